//! Shared test utilities for engine integration tests
#![allow(dead_code)]

use std::path::Path;

use common::config::EngineConfig;
use common::testkit::Harness;
use common::types::NodeHandle;

pub const SYNC_ROOT: &str = "/sync";

/// Log to the test output when `RUST_LOG` is set
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A device with the remote tree loaded and a "Docs" folder synced to `/sync`
pub fn setup() -> (Harness, NodeHandle) {
    setup_with(EngineConfig::default())
}

pub fn setup_with(config: EngineConfig) -> (Harness, NodeHandle) {
    init_tracing();
    let mut device = Harness::with_config(config);
    let docs = device
        .service
        .seed_folder(device.service.root(), "Docs", &device.keyring)
        .unwrap();
    device.load();
    device.add_sync(SYNC_ROOT, docs);
    device.run_until_idle();
    (device, docs)
}

/// Second device of the same account syncing the same remote folder
pub fn second_device(first: &Harness, docs: NodeHandle) -> Harness {
    let mut device = first.device();
    device.load();
    device.add_sync(SYNC_ROOT, docs);
    device.run_until_idle();
    device
}

/// Deterministic content that differs per seed
pub fn content(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

/// Files below `dir` whose name is `name`
pub fn find_named(device: &Harness, dir: &str, name: &str) -> Vec<std::path::PathBuf> {
    device
        .fs
        .paths_below(Path::new(dir))
        .into_iter()
        .filter(|p| p.file_name().and_then(|n| n.to_str()) == Some(name))
        .collect()
}
