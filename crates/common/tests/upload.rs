//! Local changes reaching the service

mod common;

use std::path::Path;

use ::common::config::EngineConfig;
use ::common::transfer::chunk::CHUNK_UNIT;
use ::common::transfer::TransferEvent;
use ::common::types::{Direction, TreeState};
use common::{content, setup, setup_with};

fn uploads_queued(events: &[TransferEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, TransferEvent::Queued { direction: Direction::Put, .. }))
        .count()
}

#[test]
fn test_new_file_is_uploaded_and_bound() {
    let (mut device, _) = setup();
    let data = content(1, 5000);
    device.write("/sync/notes.txt", &data, 1_700_000_000);
    device.run_until_idle();

    assert_eq!(device.remote_file("Docs/notes.txt").unwrap(), data);
    let node = device.remote_node("Docs/notes.txt").unwrap();
    assert!(device.client.bindings().local_of(&node).is_some());
    let sync = device.client.syncs().next().unwrap().id();
    assert_eq!(device.sink.tree_state(sync, Path::new("notes.txt")), Some(TreeState::Synced));
}

#[test]
fn test_new_folder_tree_is_created_remotely() {
    let (mut device, _) = setup();
    device.write("/sync/a/b/deep.txt", b"deep", 100);
    device.write("/sync/a/top.txt", b"top", 100);
    device.run_until_idle();

    assert_eq!(device.remote_file("Docs/a/b/deep.txt").unwrap(), b"deep");
    assert_eq!(device.remote_file("Docs/a/top.txt").unwrap(), b"top");
    let docs = device.remote_node("Docs").unwrap();
    let named_a = device
        .service
        .children(&docs)
        .into_iter()
        .filter(|n| device.service.name_of(&n.handle, &device.keyring).as_deref() == Some("a"))
        .count();
    assert_eq!(named_a, 1);
}

#[test]
fn test_changed_file_replaces_remote_version() {
    let (mut device, _) = setup();
    device.write("/sync/doc.txt", b"first draft", 100);
    device.run_until_idle();
    let first = device.remote_node("Docs/doc.txt").unwrap();

    device.write("/sync/doc.txt", b"second draft, longer", 200);
    device.run_until_idle();

    assert_eq!(device.remote_file("Docs/doc.txt").unwrap(), b"second draft, longer");
    let second = device.remote_node("Docs/doc.txt").unwrap();
    assert_ne!(first, second);
    // the superseded version is kept in the rubbish bin
    assert!(device.service.node(&first).is_some());
    assert!(device.service.lookup(&device.service.rubbish(), "SyncDebris", &device.keyring).is_some());
}

#[test]
fn test_identical_content_is_copied_not_uploaded() {
    let (mut device, _) = setup();
    let data = content(9, 20_000);
    device.write("/sync/original.bin", &data, 500);
    device.run_until_idle();
    assert_eq!(uploads_queued(&device.sink.transfer_events()), 1);

    device.write("/sync/copy.bin", &data, 500);
    device.run_until_idle();

    assert_eq!(device.remote_file("Docs/copy.bin").unwrap(), data);
    assert_eq!(uploads_queued(&device.sink.transfer_events()), 1);
}

#[test]
fn test_upload_cap_queues_the_rest() {
    let config = EngineConfig {
        max_uploads: 1,
        ..EngineConfig::default()
    };
    let (mut device, _) = setup_with(config);
    for n in 0..3u8 {
        device.write(&format!("/sync/file{}.bin", n), &content(n, 3000 + n as usize), 100);
    }

    let mut most_queued = 0;
    for _ in 0..400 {
        device.step();
        let transfers = device.client.transfers();
        assert!(transfers.active(Direction::Put) <= 1);
        most_queued = most_queued.max(transfers.queued(Direction::Put));
        device.advance(1);
    }
    device.run_until_idle();

    assert!(most_queued >= 1);
    for n in 0..3u8 {
        let path = format!("Docs/file{}.bin", n);
        assert_eq!(device.remote_file(&path).unwrap(), content(n, 3000 + n as usize));
    }
}

#[test]
fn test_local_rename_renames_remote_node() {
    let (mut device, _) = setup();
    device.write("/sync/old.txt", b"keep me", 100);
    device.run_until_idle();
    let node = device.remote_node("Docs/old.txt").unwrap();

    use ::common::fs::FileSystem;
    device
        .fs
        .rename(Path::new("/sync/old.txt"), Path::new("/sync/new.txt"))
        .unwrap();
    device.run_until_idle();

    assert_eq!(device.remote_node("Docs/new.txt"), Some(node));
    assert!(device.remote_node("Docs/old.txt").is_none());
    assert_eq!(uploads_queued(&device.sink.transfer_events()), 1);
}

#[test]
fn test_upload_overtaken_by_newer_remote_goes_to_debris() {
    let (mut device, docs) = setup_with(EngineConfig {
        connections_per_slot: 1,
        ..EngineConfig::default()
    });
    let ours = content(4, (40 * CHUNK_UNIT) as usize);
    device.write("/sync/new.txt", &ours, 100);

    for _ in 0..300 {
        if device.client.transfers().active(Direction::Put) == 1
            && device.service.chunk_requests(Direction::Put, 0) > 0
        {
            break;
        }
        device.step();
        device.advance(1);
    }
    assert_eq!(device.client.transfers().active(Direction::Put), 1);

    let theirs = b"written elsewhere, later".to_vec();
    device
        .service
        .seed_file(docs, "new.txt", &theirs, 500, &device.keyring)
        .unwrap();
    device.run_until_idle();

    // the synced folder holds only the newer version
    assert_eq!(device.remote_file("Docs/new.txt").unwrap(), theirs);
    let named = device
        .service
        .children(&docs)
        .into_iter()
        .filter(|n| device.service.name_of(&n.handle, &device.keyring).as_deref() == Some("new.txt"))
        .count();
    assert_eq!(named, 1);
    let kept = device
        .service
        .lookup(&device.service.rubbish(), "SyncDebris/2024-01-15/new.txt", &device.keyring)
        .unwrap();
    assert_eq!(device.service.read_file(&kept, &device.keyring).unwrap(), ours);

    assert_eq!(device.read("/sync/new.txt").unwrap(), theirs);
    assert_eq!(device.read("/sync/.debris/2024-01-15/new.txt").unwrap(), ours);
}
