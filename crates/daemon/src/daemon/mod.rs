//! The engine as the daemon runs it.
//!
//! The remote side is the local mirror kept in the state directory. Every
//! configured sync pair gets its remote folder created on first use.

mod sink;

use std::path::PathBuf;
use std::sync::Arc;

use common::client::{Client, ClientError};
use common::clock::SystemClock;
use common::crypto::KeyRing;
use common::fs::FsNotification;
use common::loopback::{LoopbackError, LoopbackService};
use common::persistence::StoreError;
use common::types::{NodeHandle, SyncId};

use crate::disk_fs::DiskFs;
use crate::state::{AppState, StateError};
use crate::store::FileStateStore;

pub use sink::LogSink;

/// Rounds spent waiting for the remote tree before syncs are added
const LOAD_ROUNDS: usize = 100;

/// Engine rounds between mirror snapshots
const MIRROR_SAVE_ROUNDS: u64 = 600;

#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error("state error: {0}")]
    State(#[from] StateError),
    #[error("client error: {0}")]
    Client(#[from] ClientError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("mirror error: {0}")]
    Mirror(#[from] LoopbackError),
    #[error("remote folder {0:?} did not load")]
    RemoteMissing(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Find the folder at `path` below the cloud drive root, creating what is missing
pub fn ensure_remote_folder(
    mirror: &LoopbackService,
    keyring: &KeyRing,
    path: &str,
) -> Result<NodeHandle, LoopbackError> {
    let mut current = mirror.root();
    for part in path.split('/').filter(|p| !p.is_empty()) {
        current = match mirror.child_named(&current, part, keyring) {
            Some(child) => child,
            None => {
                tracing::info!(folder = part, "creating remote folder");
                mirror.seed_folder(current, part, keyring)?
            }
        };
    }
    Ok(current)
}

pub struct Daemon {
    client: Client,
    mirror: LoopbackService,
    state: AppState,
    syncs: Vec<(SyncId, PathBuf)>,
    rounds: u64,
}

impl Daemon {
    /// Load state, restore or fetch the remote tree and add every configured sync
    pub fn open(state: AppState) -> Result<Self, DaemonError> {
        let keyring = state.load_keyring()?;
        let mirror = state.load_mirror()?;
        let mut remotes = Vec::with_capacity(state.config.syncs.len());
        for pair in &state.config.syncs {
            remotes.push(ensure_remote_folder(&mirror, &keyring, &pair.remote)?);
        }

        let store = FileStateStore::open(&state.store_path)?;
        let mut client = Client::new(
            state.config.engine.clone(),
            keyring,
            Box::new(mirror.connect()),
            Box::new(DiskFs::new()),
            Arc::new(SystemClock::new()),
        )
        .with_store(Box::new(store))
        .with_sink(Box::new(LogSink));

        if !client.restore_cache()? {
            client.fetch_nodes();
        }
        for _ in 0..LOAD_ROUNDS {
            client.exec();
            if client.is_loaded() && remotes.iter().all(|h| client.graph().contains(h)) {
                break;
            }
        }

        let mut syncs = Vec::new();
        for (pair, remote) in state.config.syncs.iter().zip(remotes) {
            if !client.graph().contains(&remote) {
                return Err(DaemonError::RemoteMissing(pair.remote.clone()));
            }
            std::fs::create_dir_all(&pair.local)?;
            let local = pair.local.canonicalize()?;
            let id = client.add_sync(local.clone(), remote)?;
            tracing::info!(sync = %id, local = ?local, remote = %pair.remote, "sync configured");
            syncs.push((id, local));
        }

        Ok(Self {
            client,
            mirror,
            state,
            syncs,
            rounds: 0,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Local roots of the running syncs
    pub fn roots(&self) -> Vec<PathBuf> {
        self.syncs.iter().map(|(_, root)| root.clone()).collect()
    }

    pub fn notify(&mut self, notification: FsNotification) {
        self.client.notify(notification);
    }

    /// One engine round
    pub fn step(&mut self) -> Result<(), DaemonError> {
        self.client.exec();
        self.rounds += 1;
        if self.rounds % MIRROR_SAVE_ROUNDS == 0 {
            self.state.save_mirror(&self.mirror)?;
        }
        Ok(())
    }

    /// Final round and mirror snapshot
    pub fn shutdown(mut self) -> Result<(), DaemonError> {
        self.client.exec();
        self.state.save_mirror(&self.mirror)?;
        tracing::info!(rounds = self.rounds, "engine stopped");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::state::{AppConfig, SyncPair};

    fn state_with_sync(dir: &std::path::Path) -> AppState {
        let config = AppConfig {
            syncs: vec![SyncPair {
                local: dir.join("local"),
                remote: "Docs/Work".to_string(),
            }],
            ..AppConfig::default()
        };
        AppState::init(Some(dir.join("state")), Some(config)).unwrap()
    }

    #[test]
    fn test_remote_folders_are_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::init(Some(dir.path().to_path_buf()), None).unwrap();
        let keyring = state.load_keyring().unwrap();
        let mirror = state.load_mirror().unwrap();

        let first = ensure_remote_folder(&mirror, &keyring, "Docs/Work").unwrap();
        let second = ensure_remote_folder(&mirror, &keyring, "/Docs/Work/").unwrap();
        assert_eq!(first, second);
        assert_eq!(mirror.lookup(&mirror.root(), "Docs/Work", &keyring), Some(first));
    }

    #[test]
    fn test_open_adds_configured_syncs() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_sync(dir.path());
        let daemon = Daemon::open(state).unwrap();

        assert_eq!(daemon.roots(), vec![dir.path().join("local").canonicalize().unwrap()]);
        assert_eq!(daemon.client().syncs().count(), 1);
    }

    #[test]
    fn test_local_file_reaches_the_mirror_and_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let state = state_with_sync(dir.path());
        std::fs::create_dir_all(dir.path().join("local")).unwrap();
        std::fs::write(dir.path().join("local/hello.txt"), b"hello").unwrap();

        let mut daemon = Daemon::open(state.clone()).unwrap();
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(20);
        while std::time::Instant::now() < deadline {
            daemon.step().unwrap();
            if daemon.client().is_idle() && daemon.mirror.len() > 5 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        daemon.shutdown().unwrap();

        let keyring = state.load_keyring().unwrap();
        let mirror = state.load_mirror().unwrap();
        let node = mirror
            .lookup(&mirror.root(), "Docs/Work/hello.txt", &keyring)
            .unwrap();
        assert_eq!(mirror.read_file(&node, &keyring).unwrap(), b"hello");
        assert!(state.store_path.exists());
    }
}
