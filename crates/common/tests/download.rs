//! Remote changes reaching the local folder

mod common;

use std::path::Path;

use ::common::config::EngineConfig;
use ::common::fs::FileSystem;
use ::common::transfer::chunk::CHUNK_UNIT;
use ::common::transfer::{TransferError, TransferEvent};
use ::common::types::{Direction, NodeType};
use common::{content, find_named, setup, setup_with};

#[test]
fn test_remote_file_is_downloaded_with_its_mtime() {
    let (mut device, docs) = setup();
    let data = content(3, 70_000);
    device
        .service
        .seed_file(docs, "report.pdf", &data, 1_600_000_000, &device.keyring)
        .unwrap();
    device.run_until_idle();

    assert_eq!(device.read("/sync/report.pdf").unwrap(), data);
    let stat = device.fs.stat(Path::new("/sync/report.pdf")).unwrap();
    assert_eq!(stat.mtime, 1_600_000_000);
    // nothing of the download is left behind
    assert!(device.fs.paths_below(Path::new("/sync/.debris/tmp")).is_empty());
}

#[test]
fn test_remote_folder_tree_is_created_locally() {
    let (mut device, docs) = setup();
    let album = device.service.seed_folder(docs, "album", &device.keyring).unwrap();
    let disc = device.service.seed_folder(album, "disc 1", &device.keyring).unwrap();
    device
        .service
        .seed_file(disc, "track.ogg", b"la la la", 42, &device.keyring)
        .unwrap();
    device.run_until_idle();

    assert_eq!(device.read("/sync/album/disc 1/track.ogg").unwrap(), b"la la la");
    let stat = device.fs.stat(Path::new("/sync/album")).unwrap();
    assert_eq!(stat.node_type, NodeType::Folder);
}

#[test]
fn test_remote_delete_cancels_queued_download() {
    let (mut device, docs) = setup();
    device.client.pause_transfers(Direction::Get, true);
    let node = device
        .service
        .seed_file(docs, "big.iso", &content(5, 50_000), 10, &device.keyring)
        .unwrap();

    for _ in 0..50 {
        if device.client.transfers().queued(Direction::Get) == 1 {
            break;
        }
        device.step();
        device.advance(device.client.config().poll_interval);
    }
    assert_eq!(device.client.transfers().queued(Direction::Get), 1);

    device.service.delete(node).unwrap();
    for _ in 0..50 {
        if device.client.transfers().is_empty() {
            break;
        }
        device.step();
        device.advance(device.client.config().poll_interval);
    }
    assert!(device.client.transfers().is_empty());
    assert!(device
        .sink
        .transfer_events()
        .iter()
        .any(|e| matches!(e, TransferEvent::Cancelled { direction: Direction::Get, .. })));

    device.client.pause_transfers(Direction::Get, false);
    device.run_until_idle();
    assert!(device.read("/sync/big.iso").is_none());
}

#[test]
fn test_failed_chunk_is_retried_alone() {
    let (mut device, docs) = setup();
    let data = content(7, (3 * CHUNK_UNIT + 1000) as usize);
    device.service.fail_chunk(Direction::Get, CHUNK_UNIT);
    device
        .service
        .seed_file(docs, "video.mkv", &data, 99, &device.keyring)
        .unwrap();
    device.run_until_idle();

    assert_eq!(device.read("/sync/video.mkv").unwrap(), data);
    assert_eq!(device.service.chunk_requests(Direction::Get, CHUNK_UNIT), 2);
    assert_eq!(device.service.chunk_requests(Direction::Get, 0), 1);
    assert_eq!(device.service.chunk_requests(Direction::Get, 3 * CHUNK_UNIT), 1);
}

#[test]
fn test_remote_rename_is_applied_locally() {
    let (mut device, docs) = setup();
    let node = device
        .service
        .seed_file(docs, "draft.txt", b"words", 7, &device.keyring)
        .unwrap();
    let archive = device.service.seed_folder(docs, "archive", &device.keyring).unwrap();
    device.run_until_idle();
    assert!(device.fs.exists(Path::new("/sync/draft.txt")));

    device.service.move_node(node, archive).unwrap();
    device.run_until_idle();

    assert!(!device.fs.exists(Path::new("/sync/draft.txt")));
    assert_eq!(device.read("/sync/archive/draft.txt").unwrap(), b"words");
    let downloads_queued = device
        .sink
        .transfer_events()
        .iter()
        .filter(|e| matches!(e, TransferEvent::Queued { direction: Direction::Get, .. }))
        .count();
    assert_eq!(downloads_queued, 1);
}

#[test]
fn test_remote_delete_stops_download_in_flight() {
    let (mut device, docs) = setup_with(EngineConfig {
        connections_per_slot: 1,
        ..EngineConfig::default()
    });
    let node = device
        .service
        .seed_file(docs, "huge.iso", &content(9, (40 * CHUNK_UNIT) as usize), 10, &device.keyring)
        .unwrap();

    for _ in 0..200 {
        if device.client.transfers().active(Direction::Get) == 1
            && device.service.chunk_requests(Direction::Get, 0) > 0
        {
            break;
        }
        device.step();
        device.advance(1);
    }
    assert_eq!(device.client.transfers().active(Direction::Get), 1);
    assert!(device.service.chunk_requests(Direction::Get, 0) > 0);

    device.service.delete(node).unwrap();
    for _ in 0..50 {
        if device.client.transfers().is_empty() {
            break;
        }
        device.step();
        device.advance(device.client.config().poll_interval);
    }
    device.run_until_idle();

    assert!(device.client.transfers().is_empty());
    assert_eq!(device.client.transfers().active(Direction::Get), 0);
    assert!(device.read("/sync/huge.iso").is_none());
    assert!(device.fs.paths_below(Path::new("/sync/.debris/tmp")).is_empty());
    assert!(!device
        .sink
        .transfer_events()
        .iter()
        .any(|e| matches!(e, TransferEvent::Completed { direction: Direction::Get, .. })));
}

#[test]
fn test_corrupted_chunk_restarts_the_download() {
    let (mut device, docs) = setup();
    let data = content(11, (3 * CHUNK_UNIT + 500) as usize);
    device.service.corrupt_chunk(CHUNK_UNIT);
    device
        .service
        .seed_file(docs, "archive.tar", &data, 77, &device.keyring)
        .unwrap();
    device.run_until_idle();

    assert_eq!(device.read("/sync/archive.tar").unwrap(), data);
    // the mismatch throws away every chunk, not just the bad one
    assert_eq!(device.service.chunk_requests(Direction::Get, 0), 2);
    assert_eq!(device.service.chunk_requests(Direction::Get, CHUNK_UNIT), 2);

    let events = device.sink.transfer_events();
    let failed_at = events
        .iter()
        .position(|e| {
            matches!(
                e,
                TransferEvent::Failed {
                    direction: Direction::Get,
                    error: TransferError::Integrity(_),
                    retry_in: Some(_),
                    ..
                }
            )
        })
        .unwrap();
    let completed: Vec<usize> = events
        .iter()
        .enumerate()
        .filter(|(_, e)| matches!(e, TransferEvent::Completed { direction: Direction::Get, .. }))
        .map(|(i, _)| i)
        .collect();
    assert_eq!(completed.len(), 1);
    assert!(completed[0] > failed_at);
    // no bad copy was ever placed and then replaced
    assert!(find_named(&device, "/sync/.debris", "archive.tar").is_empty());
    assert!(device.fs.paths_below(Path::new("/sync/.debris/tmp")).is_empty());
}
