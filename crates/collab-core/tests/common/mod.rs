//! Shared helpers for the collab-core integration tests.

#![allow(dead_code)]

use collab_core::{CollabConfig, CollabSession, NodeKey, PeerId};
use serde_json::Value;

pub fn config(peer: u64) -> CollabConfig {
    CollabConfig::default().with_peer_id(PeerId::from(peer))
}

/// A fresh session on an empty document.
pub fn peer(peer: u64) -> CollabSession {
    CollabSession::start(config(peer)).expect("Failed to start session")
}

/// A session joining `source` from its snapshot.
pub fn join(source: &CollabSession, peer: u64) -> CollabSession {
    let snapshot = source.export_snapshot().expect("Failed to export snapshot");
    CollabSession::from_snapshot(&snapshot, config(peer)).expect("Failed to join from snapshot")
}

/// Deliver `from`'s pending update to `to`. Returns whether anything was sent.
pub fn deliver(from: &mut CollabSession, to: &mut CollabSession) -> bool {
    match from.prepare_update().expect("Failed to prepare update") {
        Some(msg) => {
            let reply = to.handle_message(&msg).expect("Failed to handle update");
            assert!(reply.is_none(), "Update messages get no reply");
            true
        }
        None => false,
    }
}

/// Run the three-message exchange started by `a`.
pub fn handshake(a: &mut CollabSession, b: &mut CollabSession) {
    let request = a.prepare_sync_request().expect("Failed to prepare request");
    let exchange = b
        .handle_message(&request)
        .expect("Failed to handle request")
        .expect("Request must be answered");
    let response = a
        .handle_message(&exchange)
        .expect("Failed to handle exchange")
        .expect("Exchange must be answered");
    assert!(b.handle_message(&response).expect("Failed to handle response").is_none());
}

pub fn outline(session: &CollabSession) -> Value {
    let editor = session.editor();
    editor.outline(editor.root_key())
}

pub fn root(session: &CollabSession) -> NodeKey {
    session.editor().root_key().clone()
}

/// Append a paragraph holding one text node. Returns (paragraph, text).
pub fn add_paragraph(session: &mut CollabSession, text: &str) -> (NodeKey, NodeKey) {
    let root = root(session);
    session
        .update(|state| {
            let p = state.create_element("paragraph");
            let t = state.create_text(text);
            state.append(&p, &t)?;
            state.append(&root, &p)?;
            Ok((p, t))
        })
        .expect("Failed to add paragraph")
}

/// Every local node has exactly one collab node.
pub fn assert_one_proxy_per_node(session: &CollabSession) {
    let editor = session.editor();
    let binding = session.binding();
    assert_eq!(binding.len(), editor.nodes().len(), "Proxy count must match node count");
    for key in editor.nodes().keys() {
        assert!(binding.contains(key), "Node {} has no collab node", key);
    }
}
