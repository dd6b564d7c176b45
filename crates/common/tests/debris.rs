//! Deletions on either side end up in a debris folder, never destroyed

mod common;

use std::path::Path;

use common::{find_named, setup};

const DAY: &str = "2024-01-15";

#[test]
fn test_local_delete_moves_remote_node_to_debris() {
    let (mut device, _) = setup();
    device.write("/sync/a.txt", b"soon gone", 100);
    device.run_until_idle();
    let node = device.remote_node("Docs/a.txt").unwrap();

    device.fs.remove_all(Path::new("/sync/a.txt"));
    device.run_until_idle();

    assert!(device.remote_node("Docs/a.txt").is_none());
    let rubbish = device.service.rubbish();
    let kept = device
        .service
        .lookup(&rubbish, &format!("SyncDebris/{}/a.txt", DAY), &device.keyring);
    assert_eq!(kept, Some(node));
    assert_eq!(device.service.read_file(&node, &device.keyring).unwrap(), b"soon gone");
}

#[test]
fn test_local_folder_delete_moves_only_the_top() {
    let (mut device, _) = setup();
    device.write("/sync/project/src/main.c", b"int main;", 100);
    device.write("/sync/project/README", b"read me", 100);
    device.run_until_idle();
    let project = device.remote_node("Docs/project").unwrap();

    device.fs.remove_all(Path::new("/sync/project"));
    device.run_until_idle();

    let day = device
        .service
        .lookup(&device.service.rubbish(), &format!("SyncDebris/{}", DAY), &device.keyring)
        .unwrap();
    assert_eq!(device.service.children(&day).len(), 1);
    assert_eq!(device.service.lookup(&day, "project", &device.keyring), Some(project));
    assert!(device
        .service
        .lookup(&day, "project/src/main.c", &device.keyring)
        .is_some());
}

#[test]
fn test_remote_delete_moves_local_file_to_debris() {
    let (mut device, docs) = setup();
    let node = device
        .service
        .seed_file(docs, "b.txt", b"remote side", 5, &device.keyring)
        .unwrap();
    device.run_until_idle();
    assert_eq!(device.read("/sync/b.txt").unwrap(), b"remote side");

    device.service.delete(node).unwrap();
    device.run_until_idle();

    assert!(device.read("/sync/b.txt").is_none());
    let path = format!("/sync/.debris/{}/b.txt", DAY);
    assert_eq!(device.read(&path).unwrap(), b"remote side");
    assert_eq!(find_named(&device, "/sync", "b.txt").len(), 1);
}

#[test]
fn test_debris_name_clash_uses_a_timestamped_folder() {
    let (mut device, docs) = setup();
    for round in 0..2u8 {
        let node = device
            .service
            .seed_file(docs, "c.txt", &[round; 16], 5, &device.keyring)
            .unwrap();
        device.run_until_idle();
        device.service.delete(node).unwrap();
        device.run_until_idle();
    }

    let kept = find_named(&device, "/sync/.debris", "c.txt");
    assert_eq!(kept.len(), 2);
    assert!(kept.contains(&Path::new("/sync/.debris").join(DAY).join("c.txt")));
    let mut contents: Vec<Vec<u8>> = kept.iter().map(|p| device.fs.read_file(p).unwrap()).collect();
    contents.sort();
    assert_eq!(contents, vec![vec![0u8; 16], vec![1u8; 16]]);
}

#[test]
fn test_debris_folder_is_not_synced() {
    let (mut device, docs) = setup();
    let node = device
        .service
        .seed_file(docs, "d.txt", b"d", 5, &device.keyring)
        .unwrap();
    device.run_until_idle();
    device.service.delete(node).unwrap();
    device.run_until_idle();

    assert!(device.fs.exists(Path::new("/sync/.debris")));
    assert!(device.remote_node("Docs/.debris").is_none());
}
