use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};

use super::{MemoryFs, RecordingSink};
use crate::client::Client;
use crate::clock::{Clock, ManualClock};
use crate::config::EngineConfig;
use crate::crypto::KeyRing;
use crate::fs::{FileSystem, FsNotification};
use crate::loopback::LoopbackService;
use crate::persistence::MemoryStateStore;
use crate::types::{Ds, NodeHandle, SyncId, UserHandle};

/// Rounds after which [`Harness::run_until_idle`] gives up
const MAX_ROUNDS: usize = 10_000;

/// Idle rounds, one poll interval apart, before the engine counts as settled
const QUIET_ROUNDS: usize = 3;

fn epoch() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 1, 15)
        .and_then(|d| d.and_hms_opt(9, 0, 0))
        .unwrap_or_default()
}

/// One device: a client wired to an in-memory filesystem, a manual clock
/// and a session on a loopback service.
///
/// Every part is a shared handle, so a test can seed the service, edit
/// files, and inspect the store while the client runs.
pub struct Harness {
    pub client: Client,
    pub service: LoopbackService,
    pub fs: MemoryFs,
    pub clock: ManualClock,
    pub sink: RecordingSink,
    pub store: MemoryStateStore,
    pub keyring: KeyRing,
    config: EngineConfig,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// A fresh account on a fresh service
    pub fn with_config(config: EngineConfig) -> Self {
        let keyring = KeyRing::generate(UserHandle::from_u64(0x5eed)).expect("keyring");
        let service = LoopbackService::new(keyring.me);
        Self::build(
            service,
            keyring,
            config,
            MemoryFs::new(),
            MemoryStateStore::new(),
            ManualClock::new(epoch()),
        )
    }

    fn build(
        service: LoopbackService,
        keyring: KeyRing,
        config: EngineConfig,
        fs: MemoryFs,
        store: MemoryStateStore,
        clock: ManualClock,
    ) -> Self {
        let sink = RecordingSink::new();
        let clock_handle: Arc<dyn Clock> = Arc::new(clock.clone());
        let client = Client::new(
            config.clone(),
            keyring.clone(),
            Box::new(service.connect()),
            Box::new(fs.clone()),
            clock_handle,
        )
        .with_store(Box::new(store.clone()))
        .with_sink(Box::new(sink.clone()));
        Self {
            client,
            service,
            fs,
            clock,
            sink,
            store,
            keyring,
            config,
        }
    }

    /// Another device of the same account, with its own disk and cache
    pub fn device(&self) -> Self {
        Self::build(
            self.service.clone(),
            self.keyring.clone(),
            self.config.clone(),
            MemoryFs::new(),
            MemoryStateStore::new(),
            ManualClock::new(self.clock.local_time()),
        )
    }

    /// Drop the client and start a new one on the same disk, cache and clock
    pub fn restart(self) -> Self {
        let Self {
            service,
            keyring,
            config,
            fs,
            store,
            clock,
            ..
        } = self;
        Self::build(service, keyring, config, fs, store, clock)
    }

    /// Load the remote tree, from the cache when it holds one
    pub fn load(&mut self) {
        match self.client.restore_cache() {
            Ok(true) => {}
            _ => self.client.fetch_nodes(),
        }
        self.run_until_idle();
    }

    /// Sync `local` (created if missing) with `remote`
    pub fn add_sync(&mut self, local: &str, remote: NodeHandle) -> SyncId {
        let root = PathBuf::from(local);
        if self.fs.stat(&root).is_err() {
            self.fs.mkdir(&root).expect("sync root");
        }
        self.fs.take_changes();
        self.client.add_sync(root, remote).expect("add sync")
    }

    pub fn advance(&mut self, ds: Ds) {
        self.clock.advance(ds);
    }

    /// Deliver pending filesystem notifications and run one round
    pub fn step(&mut self) {
        for path in self.fs.take_changes() {
            self.client.notify(FsNotification::Changed(path));
        }
        self.client.exec();
    }

    /// Run rounds, moving the clock to each wakeup, until nothing is left to
    /// do for a few poll intervals in a row
    pub fn run_until_idle(&mut self) {
        let mut quiet = 0;
        for _ in 0..MAX_ROUNDS {
            self.step();
            if self.client.is_idle() && !self.fs.has_changes() {
                quiet += 1;
                if quiet >= QUIET_ROUNDS {
                    return;
                }
                self.clock.advance(self.config.poll_interval.max(1));
                continue;
            }
            quiet = 0;
            let now = self.clock.now();
            match self.client.next_wakeup() {
                Some(at) if at > now => self.clock.advance(at - now),
                _ => self.clock.advance(1),
            }
        }
        panic!("engine did not settle after {} rounds", MAX_ROUNDS);
    }

    /// Run both devices in turn until both have settled
    pub fn settle_with(&mut self, other: &mut Harness) {
        for _ in 0..4 {
            self.run_until_idle();
            other.run_until_idle();
        }
    }

    pub fn write(&self, path: &str, data: &[u8], mtime: i64) {
        self.fs.write_file(Path::new(path), data, mtime);
    }

    pub fn read(&self, path: &str) -> Option<Vec<u8>> {
        self.fs.read_file(Path::new(path))
    }

    /// Content of the remote file at `path` below the cloud drive root
    pub fn remote_file(&self, path: &str) -> Option<Vec<u8>> {
        let handle = self.service.lookup(&self.service.root(), path, &self.keyring)?;
        self.service.read_file(&handle, &self.keyring)
    }

    pub fn remote_node(&self, path: &str) -> Option<NodeHandle> {
        self.service.lookup(&self.service.root(), path, &self.keyring)
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}
