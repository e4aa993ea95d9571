mod common;

use collab_core::{CollabError, CollabEvent, DesyncPolicy, StateMap, TextFormat};
use common::{add_paragraph, assert_one_proxy_per_node, deliver, handshake, join, outline, peer, root};
use loro::{ExportMode, LoroDoc, TreeParentId};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[test]
fn test_local_document_reaches_joining_peer() {
    let mut a = peer(1);
    add_paragraph(&mut a, "Hello");
    let root_a = root(&a);
    a.update(|state| {
        let heading = state.create_element("heading");
        state.set_property(&heading, "tag", json!("h1"))?;
        let title = state.create_text("Title");
        state.set_format(&title, TextFormat::BOLD)?;
        state.append(&heading, &title)?;
        state.insert_child(&root_a, 0, &heading)
    })
    .unwrap();

    let b = join(&a, 2);

    assert_eq!(outline(&a), outline(&b));
    assert_eq!(b.editor().text_content(&root(&b)), "TitleHello");
    assert_one_proxy_per_node(&a);
    assert_one_proxy_per_node(&b);
}

#[test]
fn test_handshake_merges_both_sides() {
    let mut a = peer(1);
    let mut b = peer(2);
    add_paragraph(&mut a, "from a");
    add_paragraph(&mut b, "from b");

    handshake(&mut a, &mut b);

    assert_eq!(outline(&a), outline(&b));
    let text = a.editor().text_content(&root(&a));
    assert!(text.contains("from a") && text.contains("from b"), "got {}", text);
    assert_one_proxy_per_node(&a);
    assert_one_proxy_per_node(&b);
}

#[test]
fn test_text_edit_is_spliced() {
    let mut a = peer(1);
    let (_, text) = add_paragraph(&mut a, "Hello World");
    let mut b = join(&a, 2);

    a.update(|state| state.set_text(&text, "Hello Brave World")).unwrap();
    assert!(deliver(&mut a, &mut b));

    assert_eq!(b.editor().text_content(&root(&b)), "Hello Brave World");
    assert_eq!(outline(&a), outline(&b));
}

#[test]
fn test_move_and_edit_in_one_transaction() {
    let mut a = peer(1);
    let (_, text) = add_paragraph(&mut a, "moving");
    let (second, _) = add_paragraph(&mut a, "target");
    let mut b = join(&a, 2);

    a.update(|state| {
        state.insert_child(&second, 0, &text)?;
        state.set_text(&text, "moved")
    })
    .unwrap();
    assert!(deliver(&mut a, &mut b));

    assert_eq!(outline(&a), outline(&b));
    assert_eq!(b.editor().text_content(&root(&b)), "movedtarget");
    assert_one_proxy_per_node(&b);
}

#[test]
fn test_reorder_and_remove_children() {
    let mut a = peer(1);
    let (first, _) = add_paragraph(&mut a, "one");
    let (second, _) = add_paragraph(&mut a, "two");
    let (third, _) = add_paragraph(&mut a, "three");
    let mut b = join(&a, 2);
    let root_a = root(&a);

    a.update(|state| {
        state.remove(&second)?;
        state.set_children(&root_a, &[third.clone(), first.clone()])
    })
    .unwrap();
    assert!(deliver(&mut a, &mut b));

    assert_eq!(b.editor().text_content(&root(&b)), "threeone");
    assert_eq!(outline(&a), outline(&b));
    assert_one_proxy_per_node(&a);
    assert_one_proxy_per_node(&b);
}

#[test]
fn test_remote_removal_drops_local_nodes() {
    let mut a = peer(1);
    let (first, _) = add_paragraph(&mut a, "keep");
    add_paragraph(&mut a, "drop");
    let mut b = join(&a, 2);

    let b_root = root(&b);
    let dropped = b.editor().children(&b_root)[1].clone();
    b.update(|state| state.remove(&dropped)).unwrap();
    assert!(deliver(&mut b, &mut a));

    assert_eq!(a.editor().children(&root(&a)), &[first]);
    assert_eq!(outline(&a), outline(&b));
    assert_one_proxy_per_node(&a);
}

#[test]
fn test_concurrent_inserts_converge() {
    let mut a = peer(1);
    add_paragraph(&mut a, "base");
    let mut b = join(&a, 2);

    let root_a = root(&a);
    a.update(|state| {
        let p = state.create_element("paragraph");
        let t = state.create_text("A");
        state.append(&p, &t)?;
        state.insert_child(&root_a, 0, &p)
    })
    .unwrap();
    let root_b = root(&b);
    b.update(|state| {
        let p = state.create_element("paragraph");
        let t = state.create_text("B");
        state.append(&p, &t)?;
        state.insert_child(&root_b, 0, &p)
    })
    .unwrap();

    deliver(&mut a, &mut b);
    deliver(&mut b, &mut a);

    assert_eq!(outline(&a), outline(&b));
    let text = a.editor().text_content(&root(&a));
    assert!(text == "ABbase" || text == "BAbase", "got {}", text);
}

#[test]
fn test_concurrent_text_edits_merge() {
    let mut a = peer(1);
    let (_, text_a) = add_paragraph(&mut a, "middle");
    let mut b = join(&a, 2);
    let text_b = b.editor().children(&b.editor().children(&root(&b))[0])[0].clone();

    a.update(|state| state.set_text(&text_a, "start middle")).unwrap();
    b.update(|state| state.set_text(&text_b, "middle end")).unwrap();
    deliver(&mut a, &mut b);
    deliver(&mut b, &mut a);

    assert_eq!(a.editor().text_content(&root(&a)), "start middle end");
    assert_eq!(outline(&a), outline(&b));
}

#[test]
fn test_properties_sync_both_ways() {
    let mut a = peer(1);
    let (para, _) = add_paragraph(&mut a, "x");
    let mut b = join(&a, 2);

    a.update(|state| {
        state.set_property(&para, "align", json!("center"))?;
        state.set_property(&para, "indent", json!(2))
    })
    .unwrap();
    deliver(&mut a, &mut b);

    let para_b = b.editor().children(&root(&b))[0].clone();
    let props = b.editor().node(&para_b).unwrap().properties().clone();
    assert_eq!(props.get("align"), Some(&json!("center")));
    assert_eq!(props.get("indent"), Some(&json!(2)));

    b.update(|state| state.remove_property(&para_b, "indent")).unwrap();
    deliver(&mut b, &mut a);

    let props = a.editor().node(&para).unwrap().properties().clone();
    assert_eq!(props.get("indent"), None);
    assert_eq!(outline(&a), outline(&b));
}

#[test]
fn test_root_properties_sync() {
    let mut a = peer(1);
    let mut b = join(&a, 2);
    let root_a = root(&a);

    a.update(|state| state.set_property(&root_a, "direction", json!("ltr"))).unwrap();
    deliver(&mut a, &mut b);

    let root_b = root(&b);
    let props = b.editor().node(&root_b).unwrap().properties().clone();
    assert_eq!(props.get("direction"), Some(&json!("ltr")));
}

#[test]
fn test_decorator_state_edits_flow_in_place() {
    let mut a = peer(1);
    let root_a = root(&a);
    let image = a
        .update(|state| {
            let image = state.create_decorator(
                "image",
                StateMap::from_entries([("src", json!("logo.png")), ("alt", json!("logo"))]),
            );
            state.append(&root_a, &image)?;
            Ok(image)
        })
        .unwrap();
    let mut b = join(&a, 2);

    // Edit the live state map, outside any transaction.
    let state = a.editor().node(&image).unwrap().state().unwrap().clone();
    state.set("alt", json!("company logo"));
    assert!(deliver(&mut a, &mut b));

    let image_b = b.editor().children(&root(&b))[0].clone();
    let state_b = b.editor().node(&image_b).unwrap().state().unwrap().clone();
    assert_eq!(state_b.get("alt"), Some(json!("company logo")));
    assert_eq!(state_b.get("src"), Some(json!("logo.png")));

    // Applying the change must not be written back.
    assert!(b.prepare_update().unwrap().is_none());

    state_b.remove("src");
    assert!(deliver(&mut b, &mut a));
    assert_eq!(state.get("src"), None);
    assert_eq!(outline(&a), outline(&b));
}

#[test]
fn test_decorator_state_map_swap() {
    let mut a = peer(1);
    let root_a = root(&a);
    let image = a
        .update(|state| {
            let image = state.create_decorator("image", StateMap::from_entries([("src", json!("old.png"))]));
            state.append(&root_a, &image)?;
            Ok(image)
        })
        .unwrap();
    let mut b = join(&a, 2);

    let replacement = StateMap::from_entries([("src", json!("new.png")), ("width", json!(320))]);
    a.update(|state| state.set_state_map(&image, replacement.clone())).unwrap();
    deliver(&mut a, &mut b);

    let image_b = b.editor().children(&root(&b))[0].clone();
    let state_b = b.editor().node(&image_b).unwrap().state().unwrap().clone();
    assert_eq!(state_b.get("src"), Some(json!("new.png")));
    assert_eq!(state_b.get("width"), Some(json!(320)));

    // The replacement map is observed from now on.
    replacement.set("width", json!(640));
    deliver(&mut a, &mut b);
    assert_eq!(state_b.get("width"), Some(json!(640)));
}

#[test]
fn test_applied_changes_are_not_echoed() {
    let mut a = peer(1);
    add_paragraph(&mut a, "hello");
    let mut b = peer(2);
    handshake(&mut b, &mut a);

    let (_, text) = add_paragraph(&mut a, "again");
    a.update(|state| state.set_text(&text, "again and again")).unwrap();
    deliver(&mut a, &mut b);

    assert!(b.prepare_update().unwrap().is_none());
    let vv = b.binding().doc().state_vv();
    assert!(vv.get(&2).is_none(), "peer 2 never authored an op");
}

#[test]
fn test_events_report_sync_activity() {
    let mut a = peer(1);
    let mut b = join(&a, 2);

    let local = Arc::new(AtomicUsize::new(0));
    let remote = Arc::new(Mutex::new(Vec::new()));
    let _local_sub = {
        let local = local.clone();
        a.subscribe(move |event| {
            if let CollabEvent::LocalSynced { .. } = event {
                local.fetch_add(1, Ordering::SeqCst);
            }
        })
    };
    let _remote_sub = {
        let remote = remote.clone();
        b.subscribe(move |event| {
            if let CollabEvent::RemoteApplied { created, .. } = event {
                remote.lock().unwrap().push(created);
            }
        })
    };

    add_paragraph(&mut a, "one");
    add_paragraph(&mut a, "two");
    deliver(&mut a, &mut b);

    assert_eq!(local.load(Ordering::SeqCst), 2);
    assert_eq!(*remote.lock().unwrap(), vec![4]);
}

/// A shared tree holding a decorator without its state map.
fn malformed_update() -> Vec<u8> {
    let doc = LoroDoc::new();
    doc.set_peer_id(9).unwrap();
    let tree = doc.get_tree("root");
    tree.enable_fractional_index(0);
    let id = tree.create(TreeParentId::Root).unwrap();
    let meta = tree.get_meta(id).unwrap();
    meta.insert("__kind", "decorator").unwrap();
    meta.insert("__type", "image").unwrap();
    doc.commit();
    doc.export(ExportMode::Snapshot).unwrap()
}

#[test]
fn test_missing_shared_state_fails_loudly() {
    let mut b = peer(2);
    let errors = Arc::new(Mutex::new(Vec::new()));
    let _sub = {
        let errors = errors.clone();
        b.subscribe(move |event| {
            if let CollabEvent::Error { fatal, .. } = event {
                errors.lock().unwrap().push(fatal);
            }
        })
    };
    let hooked = Arc::new(AtomicUsize::new(0));
    {
        let hooked = hooked.clone();
        b.set_error_hook(move |_| {
            hooked.fetch_add(1, Ordering::SeqCst);
        });
    }

    let err = b.import(&malformed_update()).unwrap_err();

    assert!(matches!(err, CollabError::MissingSharedState { .. }), "got {:?}", err);
    assert!(err.is_fatal());
    assert_eq!(*errors.lock().unwrap(), vec![true]);
    assert_eq!(hooked.load(Ordering::SeqCst), 1);
    // The failed transaction left the local tree untouched.
    assert!(b.editor().children(&root(&b)).is_empty());
}

#[test]
fn test_resync_rebuilds_local_tree() {
    let mut a = peer(1);
    add_paragraph(&mut a, "one");
    add_paragraph(&mut a, "two");
    let config = common::config(2).with_desync_policy(DesyncPolicy::Resync);
    let snapshot = a.export_snapshot().unwrap();
    let mut b = collab_core::CollabSession::from_snapshot(&snapshot, config).unwrap();
    let before = outline(&b);

    b.resync().unwrap();

    assert_eq!(outline(&b), before);
    assert_eq!(outline(&b), outline(&a));
    assert_one_proxy_per_node(&b);
    // Rebuilding from the shared tree writes nothing.
    assert!(b.prepare_update().unwrap().is_none());
}

#[test]
fn test_stop_releases_observers() {
    let mut a = peer(1);
    let root_a = root(&a);
    let state = StateMap::from_entries([("src", json!("a.png"))]);
    a.update(|s| {
        let image = s.create_decorator("image", state.clone());
        s.append(&root_a, &image)
    })
    .unwrap();
    assert_eq!(state.observer_count(), 1);

    let editor = a.stop();

    assert_eq!(state.observer_count(), 0);
    assert_eq!(editor.children(editor.root_key()).len(), 1);
}

#[test]
fn test_local_transaction_error_rolls_back() {
    let mut a = peer(1);
    let (para, _) = add_paragraph(&mut a, "x");
    let before = outline(&a);

    let err = a
        .update(|state| {
            let t = state.create_text("orphan");
            state.append(&para, &t)?;
            state.insert_child(&para, 99, &t)
        })
        .unwrap_err();

    assert!(matches!(err, CollabError::Editor(_)));
    assert_eq!(outline(&a), before);
    assert_one_proxy_per_node(&a);
}
