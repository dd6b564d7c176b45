//! Remote tree ingestion: order independence and cached records

mod common;

use std::collections::BTreeMap;

use ::common::crypto::KeyRing;
use ::common::loopback::LoopbackService;
use ::common::node_graph::NodeGraph;
use ::common::transport::RemoteNode;
use ::common::types::{NodeHandle, UserHandle};
use proptest::prelude::*;

/// A few levels of folders and files, as the service lists them
fn seeded_tree() -> (Vec<RemoteNode>, KeyRing) {
    let keyring = KeyRing::generate(UserHandle::from_u64(7)).unwrap();
    let service = LoopbackService::new(keyring.me);
    let root = service.root();
    let docs = service.seed_folder(root, "Docs", &keyring).unwrap();
    let music = service.seed_folder(root, "Music", &keyring).unwrap();
    let deep = service.seed_folder(docs, "deep", &keyring).unwrap();
    let deeper = service.seed_folder(deep, "deeper", &keyring).unwrap();
    service.seed_file(docs, "a.txt", b"alpha", 10, &keyring).unwrap();
    service.seed_file(deep, "b.txt", b"beta", 20, &keyring).unwrap();
    service.seed_file(deeper, "c.txt", b"gamma", 30, &keyring).unwrap();
    service.seed_file(music, "song.mp3", &common::content(3, 4096), 40, &keyring).unwrap();
    (service.nodes(), keyring)
}

fn paths(graph: &NodeGraph) -> BTreeMap<NodeHandle, String> {
    graph.iter().map(|n| (n.handle, graph.path(&n.handle))).collect()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn test_insertion_order_does_not_matter(order in Just((0..14usize).collect::<Vec<_>>()).prop_shuffle()) {
        let (nodes, keyring) = seeded_tree();
        prop_assume!(order.len() >= nodes.len());

        let mut expected = NodeGraph::new();
        let report = expected.ingest_remote(nodes.clone(), &keyring);
        prop_assert!(report.rejected.is_empty());

        let shuffled: Vec<RemoteNode> = order
            .iter()
            .filter(|i| **i < nodes.len())
            .map(|i| nodes[*i].clone())
            .collect();
        let mut graph = NodeGraph::new();
        let report = graph.ingest_remote(shuffled, &keyring);
        prop_assert!(report.rejected.is_empty());
        prop_assert_eq!(graph.len(), nodes.len());
        prop_assert_eq!(paths(&graph), paths(&expected));
        for node in expected.iter() {
            let got = graph.get(&node.handle).unwrap();
            prop_assert_eq!(got.parent, node.parent);
            prop_assert_eq!(got.fingerprint, node.fingerprint);
            prop_assert!(got.is_decrypted());
        }
    }
}

#[test]
fn test_cached_records_rebuild_the_same_tree() {
    let (nodes, keyring) = seeded_tree();
    let mut graph = NodeGraph::new();
    graph.ingest_remote(nodes, &keyring);

    // children first, to exercise deferred linking
    let mut records: Vec<(u32, Vec<u8>)> = graph
        .iter()
        .map(|n| n.serialize().unwrap())
        .enumerate()
        .map(|(i, record)| (i as u32 + 1, record))
        .collect();
    records.reverse();

    let mut restored = NodeGraph::new();
    let report = restored.ingest_records(records);
    assert!(report.rejected.is_empty());
    assert_eq!(paths(&restored), paths(&graph));
    for node in graph.iter() {
        let got = restored.get(&node.handle).unwrap();
        assert_eq!(got.name(), node.name());
        assert_eq!(got.fingerprint, node.fingerprint);
        assert_eq!(got.key_bytes(), node.key_bytes());
    }
}

#[test]
fn test_records_without_their_parent_are_rejected() {
    let (nodes, keyring) = seeded_tree();
    let mut graph = NodeGraph::new();
    graph.ingest_remote(nodes, &keyring);
    let docs = graph
        .iter()
        .find(|n| n.name() == Some("Docs"))
        .map(|n| n.handle)
        .unwrap();

    let records: Vec<(u32, Vec<u8>)> = graph
        .iter()
        .filter(|n| n.handle != docs)
        .map(|n| n.serialize().unwrap())
        .enumerate()
        .map(|(i, record)| (i as u32 + 1, record))
        .collect();
    let mut restored = NodeGraph::new();
    let report = restored.ingest_records(records);
    // a.txt and deep hang off the missing folder
    assert_eq!(report.rejected.len(), 2);
    assert!(restored.iter().all(|n| n.name() != Some("a.txt")));
}

#[test]
fn test_moved_node_waits_for_its_new_parent() {
    let keyring = KeyRing::generate(UserHandle::from_u64(7)).unwrap();
    let service = LoopbackService::new(keyring.me);
    let docs = service.seed_folder(service.root(), "Docs", &keyring).unwrap();
    let a = service.seed_file(docs, "a.txt", b"alpha", 10, &keyring).unwrap();
    let mut graph = NodeGraph::new();
    assert!(graph.ingest_remote(service.nodes(), &keyring).rejected.is_empty());

    let moved_to = service.seed_folder(docs, "X", &keyring).unwrap();
    service.move_node(a, moved_to).unwrap();
    // the child is listed before the folder it moved into
    let batch = vec![service.node(&a).unwrap(), service.node(&moved_to).unwrap()];
    let report = graph.ingest_remote(batch, &keyring);

    assert!(report.rejected.is_empty());
    assert_eq!(graph.get(&a).unwrap().parent, Some(moved_to));
    assert!(graph.child_handles(&moved_to).contains(&a));
    assert!(!graph.child_handles(&docs).contains(&a));
    assert!(graph.path(&a).ends_with("/Docs/X/a.txt"));
}

#[test]
fn test_moved_node_whose_parent_never_arrives_is_rejected() {
    let keyring = KeyRing::generate(UserHandle::from_u64(7)).unwrap();
    let service = LoopbackService::new(keyring.me);
    let docs = service.seed_folder(service.root(), "Docs", &keyring).unwrap();
    let a = service.seed_file(docs, "a.txt", b"alpha", 10, &keyring).unwrap();
    let mut graph = NodeGraph::new();
    graph.ingest_remote(service.nodes(), &keyring);

    let moved_to = service.seed_folder(docs, "X", &keyring).unwrap();
    service.move_node(a, moved_to).unwrap();
    let report = graph.ingest_remote(vec![service.node(&a).unwrap()], &keyring);

    assert_eq!(report.rejected.len(), 1);
    assert!(!graph.contains(&a));
    assert!(graph.child_handles(&docs).is_empty());
}
