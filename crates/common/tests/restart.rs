//! State carried across engine restarts

mod common;

use std::io::Write;

use ::common::loopback::LoopbackService;
use ::common::transfer::TransferEvent;
use ::common::types::Direction;
use common::{content, setup, SYNC_ROOT};

#[test]
fn test_restart_restores_tree_without_transfers() {
    let (mut device, docs) = setup();
    device
        .service
        .seed_file(docs, "kept.txt", b"from before", 10, &device.keyring)
        .unwrap();
    device.write("/sync/mine.txt", b"also from before", 20);
    device.run_until_idle();
    let nodes_before = device.client.graph().len();
    let cursor_before = device.client.cursor().map(str::to_string);

    let mut device = device.restart();
    assert!(device.client.restore_cache().unwrap());
    assert_eq!(device.client.graph().len(), nodes_before);
    assert_eq!(device.client.cursor().map(str::to_string), cursor_before);

    device.add_sync(SYNC_ROOT, docs);
    device.run_until_idle();

    assert!(device.sink.transfer_events().is_empty());
    let kept = device.remote_node("Docs/kept.txt").unwrap();
    assert!(device.client.bindings().local_of(&kept).is_some());
    let mine = device.remote_node("Docs/mine.txt").unwrap();
    assert!(device.client.bindings().local_of(&mine).is_some());
}

#[test]
fn test_offline_edits_are_uploaded_after_restart() {
    let (mut device, docs) = setup();
    device.write("/sync/journal.txt", b"monday", 100);
    device.run_until_idle();

    let device = device.restart();
    device.write("/sync/journal.txt", b"monday, tuesday", 200);
    device.write("/sync/new.txt", &content(4, 900), 200);
    let mut device = device;
    device.load();
    device.add_sync(SYNC_ROOT, docs);
    device.run_until_idle();

    assert_eq!(device.remote_file("Docs/journal.txt").unwrap(), b"monday, tuesday");
    assert_eq!(device.remote_file("Docs/new.txt").unwrap(), content(4, 900));
    let uploads = device
        .sink
        .transfer_events()
        .iter()
        .filter(|e| matches!(e, TransferEvent::Queued { direction: Direction::Put, .. }))
        .count();
    assert_eq!(uploads, 2);
}

#[test]
fn test_remote_changes_while_stopped_are_picked_up() {
    let (device, docs) = setup();
    let mut device = device.restart();
    device
        .service
        .seed_file(docs, "while-away.txt", b"hello again", 30, &device.keyring)
        .unwrap();

    device.load();
    device.add_sync(SYNC_ROOT, docs);
    device.run_until_idle();

    assert_eq!(device.read("/sync/while-away.txt").unwrap(), b"hello again");
}

#[test]
fn test_extra_rounds_change_nothing() {
    let (mut device, _) = setup();
    device.write("/sync/x/y.txt", b"y", 100);
    device.run_until_idle();
    let nodes = device.service.len();
    let events = device.sink.transfer_events().len();

    for _ in 0..5 {
        device.advance(device.client.config().poll_interval);
        device.run_until_idle();
    }

    assert_eq!(device.service.len(), nodes);
    assert_eq!(device.sink.transfer_events().len(), events);
}

#[test]
fn test_service_snapshot_survives_a_file_round_trip() {
    let (mut device, _) = setup();
    device.write("/sync/saved.txt", b"on disk", 100);
    device.run_until_idle();

    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(&device.service.to_bytes().unwrap()).unwrap();
    let restored = LoopbackService::from_bytes(&std::fs::read(file.path()).unwrap()).unwrap();

    assert_eq!(restored.len(), device.service.len());
    let node = restored
        .lookup(&restored.root(), "Docs/saved.txt", &device.keyring)
        .unwrap();
    assert_eq!(restored.read_file(&node, &device.keyring).unwrap(), b"on disk");
}
