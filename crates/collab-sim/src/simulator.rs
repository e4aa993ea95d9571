//! Randomized convergence simulation.
//!
//! Each round every peer makes a few random edits and broadcasts them. The
//! network then delivers a random share of the queued messages, so peers
//! keep editing on top of stale state. After the last round everything is
//! delivered and all documents must be identical.

use crate::network::Network;
use anyhow::{Context, Result, bail};
use collab_core::{CollabConfig, CollabSession, DesyncPolicy, NodeKey, NodeKind, PeerId, StateMap, TextFormat};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};

const WORDS: &[&str] = &[
    "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india", "juliet",
];
const ALIGNMENTS: &[&str] = &["left", "center", "right"];

/// Upper bound on delivery passes while settling.
const MAX_SETTLE_PASSES: usize = 16;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub peers: usize,
    pub rounds: usize,
    pub edits_per_round: usize,
    pub seed: u64,
    pub desync_policy: DesyncPolicy,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            peers: 3,
            rounds: 20,
            edits_per_round: 3,
            seed: 0,
            desync_policy: DesyncPolicy::Fail,
        }
    }
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimReport {
    pub peers: usize,
    pub rounds: usize,
    pub edits: usize,
    pub messages: usize,
    pub bytes: usize,
    /// Nodes in the converged document, root included.
    pub nodes: usize,
}

#[derive(Debug, Clone, Copy)]
enum Edit {
    InsertParagraph,
    InsertImage,
    EditText,
    ToggleBold,
    SetAlign,
    MoveText,
    RemoveBlock,
    EditImageState,
}

const EDITS: &[Edit] = &[
    Edit::InsertParagraph,
    Edit::InsertImage,
    Edit::EditText,
    Edit::EditText,
    Edit::ToggleBold,
    Edit::SetAlign,
    Edit::MoveText,
    Edit::RemoveBlock,
    Edit::EditImageState,
];

pub struct Simulator {
    config: SimConfig,
    peers: Vec<CollabSession>,
    network: Network,
    rng: StdRng,
    edits: usize,
}

impl Simulator {
    /// Start the peers. Peer 0 writes a first paragraph; the others join it
    /// through the sync handshake.
    pub fn new(config: SimConfig) -> Result<Self> {
        if config.peers < 2 {
            bail!("need at least two peers, got {}", config.peers);
        }
        let mut peers = Vec::with_capacity(config.peers);
        for i in 0..config.peers {
            let session_config = CollabConfig::default()
                .with_peer_id(PeerId::from(i as u64 + 1))
                .with_desync_policy(config.desync_policy);
            let session = CollabSession::start(session_config)
                .with_context(|| format!("peer {} failed to start", i))?;
            peers.push(session);
        }

        let root = peers[0].editor().root_key().clone();
        peers[0].update(|state| {
            let p = state.create_element("paragraph");
            let t = state.create_text("hello");
            state.append(&p, &t)?;
            state.append(&root, &p)
        })?;

        let (first, rest) = peers.split_at_mut(1);
        for (i, peer) in rest.iter_mut().enumerate() {
            handshake(peer, &mut first[0]).with_context(|| format!("peer {} failed to join", i + 1))?;
        }

        Ok(Self {
            network: Network::new(config.peers),
            rng: StdRng::seed_from_u64(config.seed),
            peers,
            config,
            edits: 0,
        })
    }

    pub fn peers(&self) -> &[CollabSession] {
        &self.peers
    }

    /// Run every round, settle and check convergence.
    pub fn run(mut self) -> Result<SimReport> {
        for round in 0..self.config.rounds {
            self.round().with_context(|| format!("round {} failed", round))?;
        }
        self.settle()?;
        self.check_convergence()?;

        let editor = self.peers[0].editor();
        let report = SimReport {
            peers: self.config.peers,
            rounds: self.config.rounds,
            edits: self.edits,
            messages: self.network.sent(),
            bytes: self.network.bytes(),
            nodes: editor.nodes().len(),
        };
        info!("Simulation converged: {:?}", report);
        Ok(report)
    }

    fn round(&mut self) -> Result<()> {
        for i in 0..self.peers.len() {
            for _ in 0..self.config.edits_per_round {
                let edit = random_edit(&mut self.peers[i], &mut self.rng)
                    .with_context(|| format!("peer {} failed to edit", i))?;
                debug!("Peer {} applied {:?}", i, edit);
                self.edits += 1;
            }
            self.broadcast(i)?;
        }

        // Deliver a random prefix of every link.
        for from in 0..self.peers.len() {
            for to in 0..self.peers.len() {
                let pending = self.network.pending(from, to);
                if pending > 0 {
                    let limit = self.rng.random_range(0..=pending);
                    self.deliver(from, to, limit)?;
                }
            }
        }
        Ok(())
    }

    fn broadcast(&mut self, from: usize) -> Result<bool> {
        match self.peers[from].prepare_update()? {
            Some(msg) => {
                self.network.broadcast(from, &msg);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn deliver(&mut self, from: usize, to: usize, limit: usize) -> Result<()> {
        for msg in self.network.take(from, to, limit) {
            let reply = self.peers[to]
                .handle_message(&msg)
                .with_context(|| format!("peer {} failed to apply a message from peer {}", to, from))?;
            if reply.is_some() {
                bail!("peer {} answered a broadcast update", to);
            }
        }
        Ok(())
    }

    /// Deliver everything until no peer has anything left to send.
    fn settle(&mut self) -> Result<()> {
        for pass in 0..MAX_SETTLE_PASSES {
            let mut sent = false;
            for i in 0..self.peers.len() {
                sent |= self.broadcast(i)?;
            }
            if !sent && self.network.is_idle() {
                debug!("Settled after {} passes", pass);
                return Ok(());
            }
            for from in 0..self.peers.len() {
                for to in 0..self.peers.len() {
                    let pending = self.network.pending(from, to);
                    self.deliver(from, to, pending)?;
                }
            }
        }
        bail!("peers still exchanging updates after {} passes", MAX_SETTLE_PASSES)
    }

    fn check_convergence(&self) -> Result<()> {
        let reference = outline(&self.peers[0]);
        for (i, peer) in self.peers.iter().enumerate() {
            let editor = peer.editor();
            if peer.binding().len() != editor.nodes().len() {
                bail!(
                    "peer {} has {} collab nodes for {} local nodes",
                    i,
                    peer.binding().len(),
                    editor.nodes().len()
                );
            }
            if i > 0 && outline(peer) != reference {
                bail!(
                    "peer {} diverged:\n{}\nvs peer 0:\n{}",
                    i,
                    serde_json::to_string_pretty(&outline(peer))?,
                    serde_json::to_string_pretty(&reference)?
                );
            }
        }
        Ok(())
    }
}

fn outline(session: &CollabSession) -> serde_json::Value {
    let editor = session.editor();
    editor.outline(editor.root_key())
}

fn handshake(joining: &mut CollabSession, host: &mut CollabSession) -> Result<()> {
    let request = joining.prepare_sync_request()?;
    let Some(exchange) = host.handle_message(&request)? else {
        bail!("sync request went unanswered");
    };
    let Some(response) = joining.handle_message(&exchange)? else {
        bail!("sync exchange went unanswered");
    };
    host.handle_message(&response)?;
    Ok(())
}

/// Keys of the nodes matching `pred`, sorted so runs are reproducible.
fn keys_where(session: &CollabSession, pred: impl Fn(NodeKind, &str) -> bool) -> Vec<NodeKey> {
    let mut keys: Vec<NodeKey> = session
        .editor()
        .nodes()
        .values()
        .filter(|node| pred(node.kind(), node.node_type()))
        .map(|node| node.key().clone())
        .collect();
    keys.sort();
    keys
}

fn pick<'a, T>(rng: &mut StdRng, items: &'a [T]) -> Option<&'a T> {
    if items.is_empty() {
        None
    } else {
        Some(&items[rng.random_range(0..items.len())])
    }
}

fn word(rng: &mut StdRng) -> &'static str {
    WORDS[rng.random_range(0..WORDS.len())]
}

/// Apply one random edit. Edits with no valid target become paragraph
/// inserts.
fn random_edit(session: &mut CollabSession, rng: &mut StdRng) -> Result<Edit> {
    let root = session.editor().root_key().clone();
    let texts = keys_where(session, |kind, _| kind == NodeKind::Text);
    let paragraphs = keys_where(session, |_, node_type| node_type == "paragraph");
    let images = keys_where(session, |kind, _| kind == NodeKind::Decorator);
    let blocks = session.editor().children(&root).to_vec();

    let edit = EDITS[rng.random_range(0..EDITS.len())];
    match edit {
        Edit::EditText => {
            if let Some(key) = pick(rng, &texts) {
                let current = session.editor().node(key).and_then(|n| n.text()).unwrap_or_default();
                let next = mutate_text(rng, current);
                session.update(|state| state.set_text(key, next))?;
                return Ok(edit);
            }
        }
        Edit::ToggleBold => {
            if let Some(key) = pick(rng, &texts) {
                let format = session.editor().node(key).and_then(|n| n.format()).unwrap_or_default();
                session.update(|state| state.set_format(key, format ^ TextFormat::BOLD))?;
                return Ok(edit);
            }
        }
        Edit::SetAlign => {
            if let Some(key) = pick(rng, &paragraphs) {
                let align = ALIGNMENTS[rng.random_range(0..ALIGNMENTS.len())];
                session.update(|state| state.set_property(key, "align", json!(align)))?;
                return Ok(edit);
            }
        }
        Edit::MoveText => {
            if let (Some(text), Some(target)) = (pick(rng, &texts), pick(rng, &paragraphs)) {
                let siblings = session.editor().children(target);
                let len = siblings.len() - usize::from(siblings.contains(text));
                let index = rng.random_range(0..=len);
                session.update(|state| state.insert_child(target, index, text))?;
                return Ok(edit);
            }
        }
        Edit::RemoveBlock => {
            if blocks.len() > 1 {
                if let Some(key) = pick(rng, &blocks) {
                    session.update(|state| state.remove(key))?;
                    return Ok(edit);
                }
            }
        }
        Edit::EditImageState => {
            if let Some(key) = pick(rng, &images) {
                if let Some(state) = session.editor().node(key).and_then(|n| n.state()) {
                    state.set("alt", json!(word(rng)));
                    return Ok(edit);
                }
            }
        }
        Edit::InsertImage => {
            let index = rng.random_range(0..=blocks.len());
            let src = format!("{}.png", word(rng));
            session.update(|state| {
                let image = state.create_decorator("image", StateMap::from_entries([("src", json!(src))]));
                state.insert_child(&root, index, &image)
            })?;
            return Ok(edit);
        }
        Edit::InsertParagraph => {}
    }

    let index = rng.random_range(0..=blocks.len());
    let text = word(rng);
    session.update(|state| {
        let p = state.create_element("paragraph");
        let t = state.create_text(text);
        state.append(&p, &t)?;
        state.insert_child(&root, index, &p)
    })?;
    Ok(Edit::InsertParagraph)
}

/// Insert a word at a random position, or delete a random range.
fn mutate_text(rng: &mut StdRng, current: &str) -> String {
    let chars: Vec<char> = current.chars().collect();
    if !chars.is_empty() && rng.random_bool(0.3) {
        let start = rng.random_range(0..chars.len());
        let end = rng.random_range(start + 1..=chars.len());
        return chars[..start].iter().chain(&chars[end..]).collect();
    }
    let at = rng.random_range(0..=chars.len());
    let mut next: String = chars[..at].iter().collect();
    next.push(' ');
    next.push_str(word(rng));
    next.extend(&chars[at..]);
    next
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutate_text_handles_multibyte_text() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut text = "héllo wörld".to_string();
        for _ in 0..50 {
            let next = mutate_text(&mut rng, &text);
            assert_ne!(next, text);
            text = next;
        }
    }

    #[test]
    fn test_needs_two_peers() {
        let config = SimConfig {
            peers: 1,
            ..SimConfig::default()
        };
        assert!(Simulator::new(config).is_err());
    }

    #[test]
    fn test_peers_join_with_the_first_paragraph() {
        let sim = Simulator::new(SimConfig::default()).unwrap();
        for peer in sim.peers() {
            let editor = peer.editor();
            assert_eq!(editor.text_content(editor.root_key()), "hello");
        }
    }
}
