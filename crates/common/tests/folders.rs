//! Pairing of pre-existing local and remote entries

mod common;

use std::path::Path;

use ::common::fs::FileSystem;
use ::common::testkit::Harness;
use ::common::transfer::TransferEvent;
use ::common::types::{Direction, NodeType};
use common::{find_named, init_tracing, SYNC_ROOT};

#[test]
fn test_existing_folders_are_bound_by_name() {
    init_tracing();
    let mut device = Harness::new();
    let docs = device
        .service
        .seed_folder(device.service.root(), "Docs", &device.keyring)
        .unwrap();
    let photos = device.service.seed_folder(docs, "photos", &device.keyring).unwrap();
    device.write("/sync/photos/cat.jpg", b"meow", 100);

    device.load();
    device.add_sync(SYNC_ROOT, docs);
    device.run_until_idle();

    let named_photos: Vec<_> = device
        .service
        .children(&docs)
        .into_iter()
        .filter(|n| device.service.name_of(&n.handle, &device.keyring).as_deref() == Some("photos"))
        .collect();
    assert_eq!(named_photos.len(), 1);
    assert_eq!(named_photos[0].handle, photos);
    assert_eq!(device.remote_file("Docs/photos/cat.jpg").unwrap(), b"meow");
}

#[test]
fn test_identical_files_on_both_sides_are_not_transferred() {
    init_tracing();
    let mut device = Harness::new();
    let docs = device
        .service
        .seed_folder(device.service.root(), "Docs", &device.keyring)
        .unwrap();
    device
        .service
        .seed_file(docs, "same.txt", b"same bytes", 1234, &device.keyring)
        .unwrap();
    device.write("/sync/same.txt", b"same bytes", 1234);

    device.load();
    device.add_sync(SYNC_ROOT, docs);
    device.run_until_idle();

    assert!(device.sink.transfer_events().is_empty());
    let node = device.remote_node("Docs/same.txt").unwrap();
    assert!(device.client.bindings().local_of(&node).is_some());
}

#[test]
fn test_type_mismatch_is_left_alone() {
    init_tracing();
    let mut device = Harness::new();
    let docs = device
        .service
        .seed_folder(device.service.root(), "Docs", &device.keyring)
        .unwrap();
    let remote_notes = device
        .service
        .seed_file(docs, "notes", b"a remote file", 100, &device.keyring)
        .unwrap();
    device.write("/sync/notes/inside.txt", b"a local folder", 100);

    device.load();
    device.add_sync(SYNC_ROOT, docs);
    device.run_until_idle();

    let stat = device.fs.stat(Path::new("/sync/notes")).unwrap();
    assert_eq!(stat.node_type, NodeType::Folder);
    assert_eq!(device.read("/sync/notes/inside.txt").unwrap(), b"a local folder");
    assert_eq!(device.remote_node("Docs/notes"), Some(remote_notes));
    assert_eq!(device.service.children(&docs).len(), 1);
    assert!(!device
        .sink
        .transfer_events()
        .iter()
        .any(|e| matches!(e, TransferEvent::Queued { direction: Direction::Get, .. })));
}

#[test]
fn test_newer_local_file_wins_over_remote() {
    init_tracing();
    let mut device = Harness::new();
    let docs = device
        .service
        .seed_folder(device.service.root(), "Docs", &device.keyring)
        .unwrap();
    device
        .service
        .seed_file(docs, "plan.txt", b"old plan", 100, &device.keyring)
        .unwrap();
    device.write("/sync/plan.txt", b"new plan", 900);

    device.load();
    device.add_sync(SYNC_ROOT, docs);
    device.run_until_idle();

    assert_eq!(device.remote_file("Docs/plan.txt").unwrap(), b"new plan");
    assert_eq!(device.read("/sync/plan.txt").unwrap(), b"new plan");
}

#[test]
fn test_newer_remote_file_wins_over_local() {
    init_tracing();
    let mut device = Harness::new();
    let docs = device
        .service
        .seed_folder(device.service.root(), "Docs", &device.keyring)
        .unwrap();
    device
        .service
        .seed_file(docs, "plan.txt", b"remote plan", 900, &device.keyring)
        .unwrap();
    device.write("/sync/plan.txt", b"local plan", 100);

    device.load();
    device.add_sync(SYNC_ROOT, docs);
    device.run_until_idle();

    assert_eq!(device.read("/sync/plan.txt").unwrap(), b"remote plan");
    assert_eq!(device.remote_file("Docs/plan.txt").unwrap(), b"remote plan");
    // the replaced local version is kept in a day folder
    let kept = find_named(&device, "/sync/.debris", "plan.txt");
    assert_eq!(kept.len(), 1);
    let day = kept[0].parent().and_then(|p| p.file_name()).and_then(|n| n.to_str()).unwrap();
    assert!(chrono::NaiveDate::parse_from_str(day, "%Y-%m-%d").is_ok());
    assert_eq!(device.fs.read_file(&kept[0]).unwrap(), b"local plan");
}
