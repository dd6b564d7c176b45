//! The engine coordinator.
//!
//! A [`Client`] owns the node graph, the bindings, every [`Sync`], the
//! transfer engine and the file attribute channels, and talks to the outside
//! world only through the capability traits it was built with. It is driven
//! by repeated calls to [`Client::exec`], each doing a bounded amount of work:
//!
//! 1. route transport completions (transfers, file attributes, own requests)
//! 2. finalize finished transfers
//! 3. step every sync (scan, then reconcile)
//! 4. move queued nodes into remote debris
//! 5. dispatch transfers and issue chunk requests
//! 6. dispatch file attribute batches
//! 7. poll for server events
//! 8. flush the state caches
//!
//! Everything runs on the caller's thread; there is no internal locking.

mod events;
mod finalize;
mod ops;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::NaiveDateTime;

use crate::backoff::BackoffTimer;
use crate::bindings::Bindings;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::crypto::{AttrMap, CryptoError, KeyRing};
use crate::fileattr::FileAttrChannels;
use crate::fs::{FileSystem, FsError, FsNotification};
use crate::local_tree::{LocalTree, LocalTreeError};
use crate::node_graph::{resolve_share_key, GraphError, NodeGraph};
use crate::persistence::{sync_table, StateStore, StoreError, NODES_TABLE};
use crate::sink::{AppSink, NullSink};
use crate::sync::debris::RemoteDebris;
use crate::sync::{Sync, SyncContext, SyncError};
use crate::transfer::TransferEngine;
use crate::transport::{Request, ShareKeyDelivery, Transport, TransportError};
use crate::types::{Direction, Ds, LocalId, NodeHandle, NodeType, RequestId, SyncId, SyncState};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("local tree error: {0}")]
    Tree(#[from] LocalTreeError),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("node not found: {0}")]
    NodeNotFound(NodeHandle),
    #[error("no state store configured")]
    NoStore,
}

/// A request of our own waiting for its completion
#[derive(Debug)]
pub(crate) enum PendingOp {
    FetchNodes,
    Poll,
    /// Folders and content copies created by a sync
    SyncCreate {
        sync: SyncId,
        origins: Vec<(NodeHandle, LocalId)>,
    },
    /// The node built from a finished upload
    UploadFinal {
        temp: NodeHandle,
        origin: Option<LocalId>,
        replaces: Option<NodeHandle>,
        to_debris: bool,
    },
    DebrisFolders,
    Move {
        node: NodeHandle,
        parent: NodeHandle,
        to_debris: bool,
    },
    SetAttributes {
        node: NodeHandle,
        attrs: AttrMap,
    },
}

/// Build a [`SyncContext`] from disjoint borrows of a client's fields
macro_rules! sync_context {
    ($client:ident, $actions:expr, $now:expr, $local_time:expr) => {
        SyncContext {
            config: &$client.config,
            keyring: &$client.keyring,
            graph: &mut $client.graph,
            bindings: &mut $client.bindings,
            transfers: &mut $client.transfers,
            transport: &mut *$client.transport,
            fs: &*$client.fs,
            sink: &mut *$client.sink,
            debris: &mut $client.debris,
            busy: &$client.busy,
            actions: $actions,
            next_temp: &mut $client.next_temp,
            now: $now,
            local_time: $local_time,
        }
    };
}
pub(crate) use sync_context;

pub struct Client {
    config: EngineConfig,
    keyring: KeyRing,
    graph: NodeGraph,
    bindings: Bindings,
    syncs: BTreeMap<SyncId, Sync>,
    transfers: TransferEngine,
    fileattrs: FileAttrChannels,
    debris: RemoteDebris,
    transport: Box<dyn Transport>,
    fs: Box<dyn FileSystem>,
    store: Option<Box<dyn StateStore>>,
    sink: Box<dyn AppSink>,
    clock: Arc<dyn Clock>,
    pending: HashMap<RequestId, PendingOp>,
    /// Nodes with a move or attribute change in flight
    busy: HashSet<NodeHandle>,
    cursor: Option<String>,
    cursor_dirty: bool,
    fetching: bool,
    fetch_bt: BackoffTimer,
    polling: bool,
    poll_bt: BackoffTimer,
    next_sync: u32,
    next_temp: u64,
}

impl Client {
    pub fn new(
        config: EngineConfig,
        keyring: KeyRing,
        transport: Box<dyn Transport>,
        fs: Box<dyn FileSystem>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let transfers = TransferEngine::new(config.clone());
        let fileattrs = FileAttrChannels::new(config.fileattr_batch, config.backoff_cap);
        let debris = RemoteDebris::new(config.backoff_cap);
        let fetch_bt = BackoffTimer::new(config.backoff_cap);
        let poll_bt = BackoffTimer::new(config.backoff_cap);
        Self {
            config,
            keyring,
            graph: NodeGraph::new(),
            bindings: Bindings::new(),
            syncs: BTreeMap::new(),
            transfers,
            fileattrs,
            debris,
            transport,
            fs,
            store: None,
            sink: Box::new(NullSink),
            clock,
            pending: HashMap::new(),
            busy: HashSet::new(),
            cursor: None,
            cursor_dirty: false,
            fetching: false,
            fetch_bt,
            polling: false,
            poll_bt,
            next_sync: 1,
            next_temp: 0,
        }
    }

    pub fn with_store(mut self, store: Box<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn AppSink>) -> Self {
        self.sink = sink;
        self
    }

    /* Getters */

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn keyring(&self) -> &KeyRing {
        &self.keyring
    }

    pub fn graph(&self) -> &NodeGraph {
        &self.graph
    }

    pub fn bindings(&self) -> &Bindings {
        &self.bindings
    }

    pub fn transfers(&self) -> &TransferEngine {
        &self.transfers
    }

    pub fn sync(&self, id: &SyncId) -> Option<&Sync> {
        self.syncs.get(id)
    }

    pub fn syncs(&self) -> impl Iterator<Item = &Sync> {
        self.syncs.values()
    }

    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    /// Whether the remote tree has been loaded, from the service or the cache
    pub fn is_loaded(&self) -> bool {
        self.cursor.is_some()
    }

    /* Remote tree */

    /// Request a full snapshot of the remote tree
    pub fn fetch_nodes(&mut self) {
        if self.fetching {
            return;
        }
        let request = self.transport.post(Request::FetchNodes);
        tracing::info!("fetching remote tree");
        self.fetching = true;
        self.pending.insert(request, PendingOp::FetchNodes);
    }

    /// Load the graph and event cursor from the state store.
    ///
    /// Returns `false` when there is nothing usable cached; the caller should
    /// fetch the tree instead.
    pub fn restore_cache(&mut self) -> Result<bool, ClientError> {
        let store = self.store.as_mut().ok_or(ClientError::NoStore)?;
        let Some(cursor) = store.cursor()? else {
            return Ok(false);
        };
        let mut records = Vec::new();
        for (db_id, sealed) in store.records(NODES_TABLE)? {
            match self.keyring.master.decrypt_padded(&sealed) {
                Ok(plain) => records.push((db_id, plain)),
                Err(e) => {
                    tracing::warn!(record = db_id, "dropping unreadable node record: {}", e);
                    store.del(NODES_TABLE, db_id)?;
                }
            }
        }

        let report = self.graph.ingest_records(records);
        if !report.rejected.is_empty() {
            tracing::warn!(rejected = report.rejected.len(), "node cache is incomplete, discarding it");
            store.truncate(NODES_TABLE)?;
            self.graph = NodeGraph::new();
            return Ok(false);
        }
        tracing::info!(nodes = self.graph.len(), cursor = %cursor, "restored remote tree from cache");
        self.cursor = Some(cursor);
        self.sink.nodes_updated(&report.added);
        Ok(true)
    }

    /// Make a share key available and retry every undecrypted node.
    /// Returns the nodes that became readable.
    pub fn install_share_key(
        &mut self,
        node: NodeHandle,
        delivery: &ShareKeyDelivery,
    ) -> Result<Vec<NodeHandle>, ClientError> {
        let key = resolve_share_key(delivery, &self.keyring, &node)
            .ok_or(GraphError::KeyUnavailable(node))?;
        let decrypted = self.graph.set_share_key(&node, key, &self.keyring)?;
        tracing::info!(node = %node, decrypted = decrypted.len(), "share key installed");
        if !decrypted.is_empty() {
            self.sink.nodes_updated(&decrypted);
            self.reconcile_all();
        }
        Ok(decrypted)
    }

    /* Syncs */

    /// Start syncing `local_root` with the remote folder `remote_root`
    pub fn add_sync(&mut self, local_root: PathBuf, remote_root: NodeHandle) -> Result<SyncId, ClientError> {
        let remote = self
            .graph
            .get(&remote_root)
            .ok_or(ClientError::NodeNotFound(remote_root))?;
        if !remote.node_type.is_container() || !remote.is_decrypted() {
            return Err(SyncError::RemoteRootUnusable(remote_root).into());
        }
        for sync in self.syncs.values().filter(|s| s.state().is_running()) {
            let remote_overlap = self.graph.is_below(&remote_root, &sync.remote_root())
                || self.graph.is_below(&sync.remote_root(), &remote_root);
            let local_overlap =
                local_root.starts_with(sync.local_root()) || sync.local_root().starts_with(&local_root);
            if remote_overlap || local_overlap {
                return Err(SyncError::Nested(sync.id()).into());
            }
        }
        let stat = self.fs.stat(&local_root).map_err(SyncError::from)?;
        if stat.node_type != NodeType::Folder {
            return Err(SyncError::LocalRootNotFolder(local_root).into());
        }

        let id = SyncId(self.next_sync);
        self.next_sync += 1;
        let table = sync_table(&remote_root);
        let tree = match self.restore_tree(id, &table)? {
            Some(tree) => tree,
            None => {
                let name = local_root
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                LocalTree::new(id, &name, stat.fsid)
            }
        };
        tracing::info!(sync = %id, local = ?local_root, remote = %self.graph.path(&remote_root), "sync added");
        let sync = Sync::new(id, local_root, remote_root, tree, table, &self.config);
        self.sink.sync_state_changed(id, SyncState::InitialScan, None);
        self.syncs.insert(id, sync);
        Ok(id)
    }

    fn restore_tree(&mut self, id: SyncId, table: &str) -> Result<Option<LocalTree>, ClientError> {
        let Some(store) = self.store.as_mut() else {
            return Ok(None);
        };
        let records = store.records(table)?;
        if records.is_empty() {
            return Ok(None);
        }
        match LocalTree::restore(id, records, &self.keyring.master) {
            Ok((tree, bindings)) => {
                let mut bound = 0;
                for (local, node) in bindings {
                    if self.graph.contains(&node) {
                        self.bindings.bind(local, node);
                        bound += 1;
                    }
                }
                tracing::info!(sync = %id, entries = tree.len(), bound, "restored local tree from cache");
                Ok(Some(tree))
            }
            Err(e) => {
                tracing::warn!(sync = %id, "discarding local state cache: {}", e);
                store.truncate(table)?;
                Ok(None)
            }
        }
    }

    /// Stop a sync; nothing is deleted on either side
    pub fn remove_sync(&mut self, id: SyncId) -> Result<(), ClientError> {
        let mut sync = self.syncs.remove(&id).ok_or(SyncError::NotFound(id))?;
        let now = self.clock.now();
        let local_time = self.clock.local_time();
        let mut actions = Vec::new();
        let mut cx = sync_context!(self, &mut actions, now, local_time);
        sync.cancel(&mut cx);
        if let Some(store) = self.store.as_mut() {
            store.truncate(sync.table())?;
        }
        tracing::info!(sync = %id, "sync removed");
        Ok(())
    }

    /// Route a filesystem notification to the sync it concerns
    pub fn notify(&mut self, notification: FsNotification) {
        let now = self.clock.now();
        match &notification {
            FsNotification::Changed(path) => {
                if let Some(id) = self.sync_for_path(path) {
                    if let Some(sync) = self.syncs.get_mut(&id) {
                        sync.notify(notification, now, &self.config);
                    }
                }
            }
            FsNotification::Overflow | FsNotification::Unavailable => {
                for sync in self.syncs.values_mut() {
                    sync.notify(notification.clone(), now, &self.config);
                }
            }
        }
    }

    /// The running sync whose local root covers `path`
    pub(crate) fn sync_for_path(&self, path: &Path) -> Option<SyncId> {
        self.syncs
            .values()
            .find(|s| s.state().is_running() && path.starts_with(s.local_root()))
            .map(|s| s.id())
    }

    /// The running sync whose remote root covers `node`
    pub(crate) fn sync_covering(&self, node: &NodeHandle) -> Option<SyncId> {
        self.syncs
            .values()
            .find(|s| s.state().is_running() && self.graph.is_below(node, &s.remote_root()))
            .map(|s| s.id())
    }

    pub(crate) fn reconcile_all(&mut self) {
        for sync in self.syncs.values_mut() {
            sync.needs_reconcile = true;
        }
    }

    /* Transfers and file attributes */

    pub fn pause_transfers(&mut self, direction: Direction, paused: bool) {
        tracing::info!(direction = %direction, paused, "transfer queue paused state changed");
        self.transfers.set_paused(direction, paused);
    }

    /// Queue a file attribute fetch; the result arrives through the sink
    pub fn fetch_file_attribute(&mut self, node: NodeHandle, kind: u8) -> Result<(), ClientError> {
        let found = self.graph.get(&node).ok_or(ClientError::NodeNotFound(node))?;
        if found.attr_key().is_none() {
            return Err(GraphError::KeyUnavailable(node).into());
        }
        self.fileattrs.request(node, kind);
        Ok(())
    }

    /* Execution */

    /// One bounded round of work
    pub fn exec(&mut self) {
        let now = self.clock.now();
        let local_time = self.clock.local_time();

        for completion in self.transport.pump() {
            self.route(completion, now, local_time);
        }

        self.transfers.check_timeouts(now, &mut *self.transport, &*self.fs);
        for transfer in self.transfers.take_completed() {
            self.finalize(transfer, now, local_time);
        }
        for transfer in self.transfers.take_abandoned() {
            self.abandoned(transfer, now);
        }

        self.step_syncs(now, local_time);
        self.step_debris(now, local_time);

        self.transfers.dispatch(now, &mut *self.transport, &*self.fs);
        self.transfers.do_io(now, &mut *self.transport, &*self.fs);
        for event in self.transfers.take_events() {
            self.sink.transfer_update(&event);
        }

        self.fileattrs.dispatch(now, &mut *self.transport);
        self.maybe_fetch(now);
        self.maybe_poll(now);

        if let Err(e) = self.flush_caches() {
            tracing::warn!("state cache flush failed: {}", e);
        }
    }

    fn step_syncs(&mut self, now: Ds, local_time: NaiveDateTime) {
        let mut actions = Vec::new();
        {
            let mut cx = sync_context!(self, &mut actions, now, local_time);
            for sync in self.syncs.values_mut() {
                sync.step(&mut cx);
            }
        }
        self.post_actions(actions);
    }

    fn maybe_fetch(&mut self, now: Ds) {
        if self.cursor.is_none() && !self.fetching && self.fetch_bt.armed(now) && self.fetch_bt.delta() > 1 {
            self.fetch_nodes();
        }
    }

    fn maybe_poll(&mut self, now: Ds) {
        let Some(cursor) = self.cursor.clone() else {
            return;
        };
        if self.polling || self.fetching || !self.poll_bt.armed(now) {
            return;
        }
        let request = self.transport.post(Request::PollEvents { cursor });
        self.polling = true;
        self.pending.insert(request, PendingOp::Poll);
    }

    fn flush_caches(&mut self) -> Result<(), ClientError> {
        let Some(store) = self.store.as_mut() else {
            return Ok(());
        };
        let purged = self.graph.take_purged_records();
        let dirty = self.graph.take_dirty();
        let trees_pending = self.syncs.values().any(|s| s.tree().cache_pending());
        if purged.is_empty() && dirty.is_empty() && !trees_pending && !self.cursor_dirty {
            return Ok(());
        }

        store.begin()?;
        for db_id in purged {
            store.del(NODES_TABLE, db_id)?;
        }
        for handle in dirty {
            let Some(node) = self.graph.get(&handle) else {
                continue;
            };
            let record = match node.serialize() {
                Ok(record) => record,
                Err(e) => {
                    tracing::trace!(node = %handle, "not caching node: {}", e);
                    continue;
                }
            };
            let sealed = self.keyring.master.encrypt_padded(&record)?;
            match node.db_id {
                Some(db_id) => store.put(NODES_TABLE, db_id, &sealed)?,
                None => {
                    let db_id = store.insert(NODES_TABLE, &sealed)?;
                    self.graph.set_db_id(&handle, db_id);
                }
            }
        }
        for sync in self.syncs.values_mut() {
            let table = sync.table().to_string();
            sync.tree
                .flush_cache(&mut **store, &table, &self.bindings, &self.keyring.master)?;
        }
        if self.cursor_dirty {
            if let Some(cursor) = &self.cursor {
                store.set_cursor(cursor)?;
            }
            self.cursor_dirty = false;
        }
        store.commit()?;
        Ok(())
    }

    /// Nothing left to do until something external happens; polling aside
    pub fn is_idle(&self) -> bool {
        self.pending.values().all(|op| matches!(op, PendingOp::Poll))
            && !self.fetching
            && self.transfers.is_empty()
            && self.fileattrs.is_idle()
            && self.debris.is_idle()
            && self.syncs.values().all(|s| s.is_idle())
    }

    /// Earliest time `exec` has timed work to do
    pub fn next_wakeup(&self) -> Option<Ds> {
        let mut wake_at = None;
        self.transfers.next_wakeup(&mut wake_at);
        self.fileattrs.next_wakeup(&mut wake_at);
        self.debris.next_wakeup(&mut wake_at);
        for sync in self.syncs.values() {
            sync.next_wakeup(&mut wake_at);
        }
        if self.cursor.is_some() && !self.polling {
            self.poll_bt.update(&mut wake_at);
        }
        if self.cursor.is_none() && !self.fetching {
            self.fetch_bt.update(&mut wake_at);
        }
        wake_at
    }
}

/// Every handle in the subtree below `top`, `top` first
pub(crate) fn subtree(graph: &NodeGraph, top: &NodeHandle) -> Vec<NodeHandle> {
    let mut out = Vec::new();
    let mut stack = vec![*top];
    while let Some(current) = stack.pop() {
        if !graph.contains(&current) {
            continue;
        }
        out.push(current);
        stack.extend(graph.child_handles(&current));
    }
    out
}

impl From<FsError> for ClientError {
    fn from(e: FsError) -> Self {
        ClientError::Sync(e.into())
    }
}
