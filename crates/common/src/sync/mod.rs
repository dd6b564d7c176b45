//! Reconciliation of one local folder with one remote folder
//!
//! A [`Sync`] owns the [`LocalTree`] of its local root and the scan
//! bookkeeping that keeps it current. Everything else it needs (the node
//! graph, bindings, transfers) belongs to the client and is lent to it
//! through a [`SyncContext`] for the duration of one step.
//!
//! # Lifecycle
//!
//! `InitialScan` reads the whole local tree without looking at the remote
//! side. Once the scan queue drains the sync turns `Active`, reconciles in
//! both directions and from then on follows filesystem notifications,
//! falling back to rate-limited full rescans when notifications overflow or
//! are unavailable. A sync whose root disappears turns `Failed`; removing a
//! sync makes it `Canceled` without touching content on either side.
//!
//! # Passes
//!
//! - [`scan`]: check queued paths against the filesystem
//! - [`syncdown`]: bring remote changes to the local side
//! - [`syncup`]: bring local changes to the remote side
//!
//! Superseded content on either side goes to debris, see [`debris`].

pub mod debris;
mod scan;
mod syncdown;
mod syncup;

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::backoff::BackoffTimer;
use crate::bindings::Bindings;
use crate::config::EngineConfig;
use crate::crypto::{
    attribute_key, encrypt_attributes, random_bytes, AttrMap, CryptoError, KeyRing,
    FOLDER_KEY_SIZE,
};
use crate::fs::{FileSystem, FsError, FsNotification};
use crate::local_tree::{LocalNode, LocalTree, LocalTreeError};
use crate::node_graph::{GraphError, NodeGraph, ATTR_NAME};
use crate::sink::AppSink;
use crate::transfer::{RequesterKind, TransferEngine};
use crate::transport::{NewNode, NewNodeSource, Transport};
use crate::types::{Ds, LocalId, NodeHandle, NodeType, RequesterId, SyncId, SyncState, TreeState};

use debris::RemoteDebris;

pub(crate) use syncdown::remote_mtime;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("remote root {0} is not a usable folder")]
    RemoteRootUnusable(NodeHandle),
    #[error("local root {0:?} is not a directory")]
    LocalRootNotFolder(PathBuf),
    #[error("sync would overlap existing sync {0}")]
    Nested(SyncId),
    #[error("sync not found: {0}")]
    NotFound(SyncId),
    #[error("filesystem error: {0}")]
    Fs(#[from] FsError),
    #[error("local tree error: {0}")]
    Tree(#[from] LocalTreeError),
    #[error("graph error: {0}")]
    Graph(#[from] GraphError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// A remote change a sync wants the client to post
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    /// One batch of new folders and content copies under `parent`;
    /// `origins` pairs each placeholder handle with its local entry
    CreateNodes {
        sync: SyncId,
        parent: NodeHandle,
        nodes: Vec<NewNode>,
        origins: Vec<(NodeHandle, LocalId)>,
    },
    Move {
        node: NodeHandle,
        parent: NodeHandle,
    },
    SetAttributes {
        node: NodeHandle,
        attrs: AttrMap,
    },
}

/// Client state lent to a sync for one step
pub struct SyncContext<'a> {
    pub config: &'a EngineConfig,
    pub keyring: &'a KeyRing,
    pub graph: &'a mut NodeGraph,
    pub bindings: &'a mut Bindings,
    pub transfers: &'a mut TransferEngine,
    pub transport: &'a mut dyn Transport,
    pub fs: &'a dyn FileSystem,
    pub sink: &'a mut dyn AppSink,
    pub debris: &'a mut RemoteDebris,
    /// Nodes with a request in flight; their graph state may be stale
    pub busy: &'a HashSet<NodeHandle>,
    pub actions: &'a mut Vec<SyncAction>,
    pub next_temp: &'a mut u64,
    pub now: Ds,
    pub local_time: NaiveDateTime,
}

/// A path waiting to be checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ScanEntry {
    /// Relative to the sync root
    pub path: PathBuf,
    pub due: Ds,
    /// List subfolders too, not just new entries
    pub recursive: bool,
    /// 8.3 alias reported by the listing, if any
    pub short_name: Option<String>,
}

#[derive(Debug)]
pub struct Sync {
    id: SyncId,
    local_root: PathBuf,
    remote_root: NodeHandle,
    state: SyncState,
    pub(crate) tree: LocalTree,
    /// State cache table
    table: String,
    pub(crate) scan_queue: VecDeque<ScanEntry>,
    pub(crate) retry: BTreeMap<PathBuf, BackoffTimer>,
    notifications_ok: bool,
    rescan_pending: bool,
    rescan_bt: BackoffTimer,
    pub(crate) needs_reconcile: bool,
    pub(crate) reconcile_at: Option<Ds>,
    /// remote node -> download requester targeting this sync
    pub(crate) downloads: HashMap<NodeHandle, RequesterId>,
}

impl Sync {
    pub fn new(
        id: SyncId,
        local_root: PathBuf,
        remote_root: NodeHandle,
        tree: LocalTree,
        table: String,
        config: &EngineConfig,
    ) -> Self {
        let mut sync = Self {
            id,
            local_root,
            remote_root,
            state: SyncState::InitialScan,
            tree,
            table,
            scan_queue: VecDeque::new(),
            retry: BTreeMap::new(),
            notifications_ok: true,
            rescan_pending: false,
            rescan_bt: BackoffTimer::new(config.backoff_cap),
            needs_reconcile: true,
            reconcile_at: None,
            downloads: HashMap::new(),
        };
        sync.queue_full_scan();
        sync
    }

    /* Getters */

    pub fn id(&self) -> SyncId {
        self.id
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn remote_root(&self) -> NodeHandle {
        self.remote_root
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn tree(&self) -> &LocalTree {
        &self.tree
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn abs_path(&self, id: &LocalId) -> PathBuf {
        self.local_root.join(self.tree.path(id))
    }

    /// Nothing queued, retried or waiting for a transfer
    pub fn is_idle(&self) -> bool {
        !self.state.is_running()
            || (self.scan_queue.is_empty()
                && self.retry.is_empty()
                && !self.needs_reconcile
                && !self.rescan_pending
                && self.reconcile_at.is_none()
                && self.downloads.is_empty()
                && !self.tree.iter().any(|n| n.upload.is_some() || n.created)
                && !self.tree.has_unseen())
    }

    pub fn next_wakeup(&self, wake_at: &mut Option<Ds>) {
        let mut pull = |at: Ds| {
            if wake_at.map(|w| at < w).unwrap_or(true) {
                *wake_at = Some(at);
            }
        };
        if let Some(entry) = self.scan_queue.front() {
            pull(entry.due);
        }
        if let Some(at) = self.reconcile_at {
            pull(at);
        }
        for bt in self.retry.values() {
            bt.update(wake_at);
        }
        if self.rescan_pending {
            self.rescan_bt.update(wake_at);
        }
    }

    /* State */

    pub(crate) fn set_state(&mut self, state: SyncState, reason: Option<&str>, sink: &mut dyn AppSink) {
        if self.state == state {
            return;
        }
        match state {
            SyncState::Failed => {
                tracing::error!(sync = %self.id, reason = reason.unwrap_or(""), "sync failed")
            }
            _ => tracing::info!(sync = %self.id, state = ?state, "sync state changed"),
        }
        self.state = state;
        sink.sync_state_changed(self.id, state, reason);
    }

    pub(crate) fn queue_full_scan(&mut self) {
        self.scan_queue.push_back(ScanEntry {
            path: PathBuf::new(),
            due: 0,
            recursive: true,
            short_name: None,
        });
    }

    /// Feed a filesystem notification
    pub fn notify(&mut self, notification: FsNotification, now: Ds, config: &EngineConfig) {
        if !self.state.is_running() {
            return;
        }
        match notification {
            FsNotification::Changed(path) => {
                let rel = match path.strip_prefix(&self.local_root) {
                    Ok(rel) => rel.to_path_buf(),
                    Err(_) => return,
                };
                if self.in_local_debris(&rel, config) {
                    return;
                }
                tracing::trace!(sync = %self.id, path = ?rel, "change notification");
                self.scan_queue.push_back(ScanEntry {
                    path: rel,
                    due: now.saturating_add(config.scan_delay),
                    recursive: false,
                    short_name: None,
                });
            }
            FsNotification::Overflow => {
                tracing::warn!(sync = %self.id, "notification overflow, rescanning");
                self.request_rescan();
            }
            FsNotification::Unavailable => {
                tracing::warn!(sync = %self.id, "notifications unavailable, falling back to periodic rescans");
                self.notifications_ok = false;
                self.request_rescan();
            }
        }
    }

    fn request_rescan(&mut self) {
        self.rescan_pending = true;
    }

    /// Start a pending full rescan if the rate limit allows
    fn maybe_rescan(&mut self, now: Ds) {
        if !self.rescan_pending || !self.rescan_bt.armed(now) {
            return;
        }
        self.rescan_pending = false;
        let delay = 10 + (self.tree.len() / 128) as Ds;
        self.rescan_bt.backoff_for(now, delay);
        tracing::debug!(sync = %self.id, "full rescan");
        self.queue_full_scan();
    }

    pub(crate) fn in_local_debris(&self, rel: &Path, config: &EngineConfig) -> bool {
        rel.components()
            .next()
            .map(|c| c.as_os_str() == config.local_debris.as_str())
            .unwrap_or(false)
    }

    /* Step */

    /// One bounded unit of work: scan, then reconcile once the local tree is current
    pub fn step(&mut self, cx: &mut SyncContext<'_>) {
        if !self.state.is_running() {
            return;
        }
        self.maybe_rescan(cx.now);
        self.scan_step(cx);
        if !self.state.is_running() {
            return;
        }

        if !self.scan_queue.is_empty() || !self.retry.is_empty() {
            return;
        }
        self.remove_unseen(cx);
        if self.state == SyncState::InitialScan {
            self.set_state(SyncState::Active, None, cx.sink);
            self.needs_reconcile = true;
        }
        if !self.notifications_ok && !self.rescan_pending {
            self.request_rescan();
        }

        if let Some(at) = self.reconcile_at {
            if at <= cx.now {
                self.reconcile_at = None;
                self.needs_reconcile = true;
            }
        }
        if self.needs_reconcile {
            self.reconcile(cx);
        }
    }

    /// Run both passes from the roots
    pub fn reconcile(&mut self, cx: &mut SyncContext<'_>) {
        let Some(remote) = cx.graph.get(&self.remote_root) else {
            return;
        };
        if !remote.has_key() {
            return;
        }
        self.needs_reconcile = false;
        let root = self.tree.root();
        cx.bindings.bind(root, self.remote_root);
        self.syncdown(cx, root, self.remote_root);
        self.syncup(cx, root, self.remote_root);
    }

    /* Shared helpers */

    /// Update an entry's tree state and report every change
    pub(crate) fn set_tree_state(&mut self, id: &LocalId, state: TreeState, sink: &mut dyn AppSink) {
        for (changed, state) in self.tree.set_tree_state(id, state) {
            let path = self.tree.path(&changed);
            sink.tree_state_changed(self.id, &path, state);
        }
    }

    /// Release everything tied to removed entries; the top one's bound
    /// node goes to remote debris unless `keep_remote` is set
    pub(crate) fn release_removed(
        &mut self,
        cx: &mut SyncContext<'_>,
        removed: Vec<LocalNode>,
        keep_remote: bool,
    ) {
        let Some(top) = removed.last().map(|n| n.id) else {
            return;
        };
        let ids: HashSet<LocalId> = removed.iter().map(|n| n.id).collect();
        let sync = self.id;
        cx.transfers.remove_requesters(
            |r| matches!(&r.kind, RequesterKind::SyncUpload { sync: s, local, .. } if *s == sync && ids.contains(local)),
            cx.transport,
            cx.fs,
        );
        for node in &removed {
            let Some(handle) = cx.bindings.unbind_local(&node.id) else {
                continue;
            };
            self.cancel_download(cx, &handle);
            if node.id == top && !keep_remote && cx.graph.contains(&handle) {
                cx.debris.add(handle, cx.graph);
            }
        }
    }

    /// Run the passes again no later than `at`
    pub(crate) fn reconcile_by(&mut self, at: Ds) {
        if self.reconcile_at.map(|current| at < current).unwrap_or(true) {
            self.reconcile_at = Some(at);
        }
    }

    pub(crate) fn cancel_download(&mut self, cx: &mut SyncContext<'_>, node: &NodeHandle) {
        if let Some(requester) = self.downloads.remove(node) {
            cx.transfers.remove_requester(requester, cx.transport, cx.fs);
        }
    }

    /// Stop every transfer and binding of this sync; content stays where it is
    pub fn cancel(&mut self, cx: &mut SyncContext<'_>) {
        let sync = self.id;
        cx.transfers
            .remove_requesters(|r| r.kind.sync() == sync, cx.transport, cx.fs);
        self.downloads.clear();
        let ids: Vec<LocalId> = self.tree.iter().map(|n| n.id).collect();
        for id in ids {
            cx.bindings.unbind_local(&id);
        }
        self.scan_queue.clear();
        self.retry.clear();
        self.set_state(SyncState::Canceled, None, cx.sink);
    }

    /// Check one entry again soon
    pub(crate) fn rescan(&mut self, local: &LocalId, now: Ds) {
        if self.tree.get(local).is_none() {
            return;
        }
        self.scan_queue.push_back(ScanEntry {
            path: self.tree.path(local),
            due: now,
            recursive: false,
            short_name: None,
        });
    }

    /// Mark the local counterparts of vanished remote nodes
    pub fn mark_deleted(&mut self, local: &LocalId) {
        if let Some(node) = self.tree.get_mut(local) {
            node.deleted = true;
            node.pending_move = false;
        }
        self.needs_reconcile = true;
    }
}

/// A new folder for a node-creation batch, with a fresh key
pub(crate) fn new_folder_node(
    temp: NodeHandle,
    parent_temp: Option<NodeHandle>,
    name: &str,
    keyring: &KeyRing,
) -> Result<NewNode, CryptoError> {
    let mut key = [0u8; FOLDER_KEY_SIZE];
    random_bytes(&mut key)?;
    let mut attrs = AttrMap::new();
    attrs.insert(ATTR_NAME.to_string(), name.to_string());
    Ok(NewNode {
        temp,
        parent_temp,
        node_type: NodeType::Folder,
        source: NewNodeSource::Folder,
        key: KeyRing::wrap_key(&keyring.master, &key)?,
        attrs: encrypt_attributes(&attrs, &attribute_key(&key)?)?,
        mtime: 0,
    })
}

/// A file node for a node-creation batch using existing key material
pub(crate) fn new_file_node(
    temp: NodeHandle,
    parent_temp: Option<NodeHandle>,
    source: NewNodeSource,
    key: &[u8],
    attrs: &AttrMap,
    mtime: i64,
    keyring: &KeyRing,
) -> Result<NewNode, CryptoError> {
    Ok(NewNode {
        temp,
        parent_temp,
        node_type: NodeType::File,
        source,
        key: KeyRing::wrap_key(&keyring.master, key)?,
        attrs: encrypt_attributes(attrs, &attribute_key(key)?)?,
        mtime,
    })
}
