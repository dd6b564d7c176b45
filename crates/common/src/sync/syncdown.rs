//! Remote to local.
//!
//! Walks a remote folder next to its local counterpart. Matching names are
//! bound, remote-only folders are created, remote-only files downloaded,
//! and local entries whose bound node disappeared go to local debris.

use std::collections::HashSet;
use std::path::Path;

use super::debris::{ensure_dir, move_to_local_debris};
use super::{Sync, SyncContext};
use crate::fingerprint::FileFingerprint;
use crate::fs::FsError;
use crate::node_graph::{Node, SyncDeleted};
use crate::transfer::{RequesterKind, TransferSpec};
use crate::types::{Direction, LocalId, NodeHandle, NodeType, TreeState};

/// When the local copy was last changed according to the remote node
pub(crate) fn remote_mtime(node: &Node) -> i64 {
    node.fingerprint.map(|fp| fp.mtime).unwrap_or(node.mtime)
}

impl Sync {
    pub(crate) fn syncdown(&mut self, cx: &mut SyncContext<'_>, local: LocalId, remote: NodeHandle) {
        let at_root = local == self.tree.root();
        let mut matched = HashSet::new();

        for handle in cx.graph.child_handles(&remote) {
            let Some(child) = cx.graph.get(&handle) else {
                continue;
            };
            if !child.is_decrypted()
                || child.sync_deleted != SyncDeleted::None
                || cx.busy.contains(&handle)
            {
                continue;
            }
            let Some(name) = child.name().filter(|n| !n.is_empty()).map(str::to_string) else {
                continue;
            };
            if at_root && name == cx.config.local_debris {
                continue;
            }
            let node_type = child.node_type;

            if let Some(existing) = self.tree.child_by_name(&local, &name) {
                matched.insert(existing);
                self.pair_down(cx, existing, handle);
                continue;
            }

            if let Some(bound) = cx
                .bindings
                .local_of(&handle)
                .filter(|l| l.sync() == self.id && self.tree.get(l).is_some())
            {
                let follows = self
                    .tree
                    .get(&bound)
                    .map(|n| !n.pending_move)
                    .unwrap_or(false);
                if follows && !self.tree.is_not_seen(&bound) {
                    self.move_local(cx, bound, local, &name);
                }
                continue;
            }

            match node_type {
                NodeType::Folder => self.materialize_folder(cx, local, handle, &name),
                NodeType::File => self.queue_download(cx, local, handle, &name),
                _ => {}
            }
        }

        for child in self.tree.child_ids(&local) {
            if matched.contains(&child) {
                continue;
            }
            if self.tree.get(&child).map(|n| n.deleted).unwrap_or(false) {
                self.to_local_debris(cx, child);
            }
        }
    }

    /// A local entry and a remote node share a name
    fn pair_down(&mut self, cx: &mut SyncContext<'_>, local: LocalId, handle: NodeHandle) {
        if self.tree.is_not_seen(&local) {
            return;
        }
        let (Some(node), Some(remote)) = (self.tree.get(&local), cx.graph.get(&handle)) else {
            return;
        };
        if node.node_type != remote.node_type {
            tracing::debug!(
                sync = %self.id,
                path = ?self.tree.path(&local),
                "local and remote types differ, leaving both alone"
            );
            return;
        }
        let bound = cx.bindings.node_of(&local) == Some(handle);
        if !bound && cx.bindings.local_of(&handle).is_some() {
            // the node still belongs to an entry that moved away locally
            return;
        }

        if node.node_type == NodeType::Folder {
            if !bound {
                self.bind(cx, local, handle);
            }
            self.syncdown(cx, local, handle);
            return;
        }

        if node.upload.is_some() {
            return;
        }
        let local_fp = node.fingerprint;
        if !local_fp.valid {
            return;
        }
        let (parent, name, deleted) = (node.parent, node.name.clone(), node.deleted);
        let remote_newer = local_fp.mtime <= remote_mtime(remote);
        if remote.fingerprint == Some(local_fp) {
            if !bound {
                self.bind(cx, local, handle);
            }
            self.cancel_download(cx, &handle);
            self.set_tree_state(&local, TreeState::Synced, cx.sink);
            return;
        }
        if deleted {
            if let Some(node) = self.tree.get_mut(&local) {
                node.deleted = false;
            }
        }
        if !remote_newer {
            // syncup sends the local version
            return;
        }
        if let Some(parent) = parent {
            self.queue_download(cx, parent, handle, &name);
        }
    }

    fn bind(&mut self, cx: &mut SyncContext<'_>, local: LocalId, handle: NodeHandle) {
        tracing::debug!(sync = %self.id, path = ?self.tree.path(&local), node = %handle, "bound by name");
        cx.bindings.bind(local, handle);
        if let Some(node) = self.tree.get_mut(&local) {
            node.deleted = false;
        }
        self.tree.touch(&local);
    }

    fn queue_download(&mut self, cx: &mut SyncContext<'_>, parent: LocalId, handle: NodeHandle, name: &str) {
        if self.downloads.contains_key(&handle) {
            return;
        }
        let Some(remote) = cx.graph.get(&handle) else {
            return;
        };
        let (Some(key), Some(fingerprint)) = (remote.file_key(), remote.fingerprint) else {
            tracing::debug!(sync = %self.id, node = %handle, "no key or fingerprint, not downloading");
            return;
        };
        let size = remote.size;

        let tmp_dir = self.local_root.join(&cx.config.local_debris).join("tmp");
        let prepared = ensure_dir(cx.fs, &self.local_root.join(&cx.config.local_debris))
            .and_then(|_| ensure_dir(cx.fs, &tmp_dir));
        if let Err(e) = prepared {
            tracing::warn!(sync = %self.id, "cannot prepare download folder: {}", e);
            self.reconcile_by(cx.now.saturating_add(cx.config.lock_retry));
            return;
        }

        let target = self.abs_path(&parent).join(name);
        let spec = TransferSpec {
            direction: Direction::Get,
            fingerprint,
            size,
            node: Some(handle),
            key: Some(key),
            temp_path: Some(tmp_dir.join(format!("{}.part", handle))),
        };
        let (transfer, requester) = cx.transfers.enqueue(
            spec,
            RequesterKind::SyncDownload {
                sync: self.id,
                node: handle,
                target: target.clone(),
            },
        );
        tracing::debug!(sync = %self.id, node = %handle, transfer = %transfer, target = ?target, "download queued");
        self.downloads.insert(handle, requester);
        if let Some(existing) = self.tree.child_by_name(&parent, name) {
            self.set_tree_state(&existing, TreeState::Syncing, cx.sink);
        }
    }

    /// The bound node was moved or renamed remotely
    fn move_local(&mut self, cx: &mut SyncContext<'_>, local: LocalId, new_parent: LocalId, name: &str) {
        if self.tree.is_below(&new_parent, &local) {
            return;
        }
        let from = self.abs_path(&local);
        let to = self.abs_path(&new_parent).join(name);
        match cx.fs.rename(&from, &to) {
            Ok(()) => {
                tracing::info!(sync = %self.id, from = ?from, to = ?to, "applied remote move");
                if let Err(e) = self.tree.move_to(&local, new_parent, name) {
                    tracing::warn!(sync = %self.id, "local tree out of step after move: {}", e);
                    self.queue_full_scan();
                }
            }
            Err(FsError::NotFound(_)) => self.tree.set_not_seen(&local, true),
            Err(e) if e.is_transient() => {
                tracing::debug!(sync = %self.id, path = ?from, "move deferred: {}", e);
                self.reconcile_by(cx.now.saturating_add(cx.config.lock_retry));
            }
            Err(e) => tracing::warn!(sync = %self.id, path = ?from, "cannot apply remote move: {}", e),
        }
    }

    fn materialize_folder(&mut self, cx: &mut SyncContext<'_>, parent: LocalId, handle: NodeHandle, name: &str) {
        let path = self.abs_path(&parent).join(name);
        if let Err(e) = ensure_dir(cx.fs, &path) {
            if e.is_transient() {
                self.reconcile_by(cx.now.saturating_add(cx.config.lock_retry));
            } else {
                tracing::warn!(sync = %self.id, path = ?path, "cannot create folder: {}", e);
            }
            return;
        }
        let stat = match cx.fs.stat(&path) {
            Ok(stat) if stat.node_type == NodeType::Folder => stat,
            Ok(_) => return,
            Err(e) => {
                tracing::debug!(sync = %self.id, path = ?path, "created folder unreadable: {}", e);
                return;
            }
        };
        let outcome = match self.tree.add_or_update(parent, name, None, &stat) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(sync = %self.id, path = ?path, "cannot record folder: {}", e);
                return;
            }
        };
        if !outcome.displaced.is_empty() {
            self.release_removed(cx, outcome.displaced, false);
        }
        tracing::debug!(sync = %self.id, path = ?path, "folder created");
        cx.bindings.bind(outcome.id, handle);
        self.tree.touch(&outcome.id);
        self.set_tree_state(&outcome.id, TreeState::Synced, cx.sink);
        self.syncdown(cx, outcome.id, handle);
    }

    fn to_local_debris(&mut self, cx: &mut SyncContext<'_>, local: LocalId) {
        let path = self.abs_path(&local);
        let moved = move_to_local_debris(
            cx.fs,
            &self.local_root,
            &cx.config.local_debris,
            &cx.local_time,
            &path,
        );
        match moved {
            Ok(_) | Err(FsError::NotFound(_)) => {
                let removed = self.tree.remove(&local);
                self.release_removed(cx, removed, true);
            }
            Err(e) if e.is_transient() => {
                tracing::debug!(sync = %self.id, path = ?path, "debris move deferred: {}", e);
                self.reconcile_by(cx.now.saturating_add(cx.config.lock_retry));
            }
            Err(e) => tracing::warn!(sync = %self.id, path = ?path, "cannot move to local debris: {}", e),
        }
    }

    /// A finished download now sits at `target`; record and bind it
    pub(crate) fn download_placed(
        &mut self,
        cx: &mut SyncContext<'_>,
        handle: NodeHandle,
        target: &Path,
        fingerprint: FileFingerprint,
    ) {
        self.downloads.remove(&handle);
        let parent = target
            .strip_prefix(&self.local_root)
            .ok()
            .and_then(Path::parent)
            .and_then(|rel| self.tree.lookup(rel));
        let name = target.file_name().map(|n| n.to_string_lossy().into_owned());
        let (Some(parent), Some(name)) = (parent, name) else {
            // the folder went away while downloading
            self.queue_full_scan();
            return;
        };
        let stat = match cx.fs.stat(target) {
            Ok(stat) => stat,
            Err(e) => {
                tracing::debug!(sync = %self.id, path = ?target, "downloaded file unreadable: {}", e);
                self.rescan(&parent, cx.now);
                return;
            }
        };
        let outcome = match self.tree.add_or_update(parent, &name, None, &stat) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(sync = %self.id, path = ?target, "cannot record download: {}", e);
                return;
            }
        };
        if !outcome.displaced.is_empty() {
            self.release_removed(cx, outcome.displaced, false);
        }
        self.tree.set_fingerprint(&outcome.id, fingerprint);
        if let Some(node) = self.tree.get_mut(&outcome.id) {
            node.deleted = false;
            node.pending_move = false;
        }
        cx.bindings.bind(outcome.id, handle);
        self.tree.touch(&outcome.id);
        self.set_tree_state(&outcome.id, TreeState::Synced, cx.sink);
        tracing::info!(sync = %self.id, path = ?target, node = %handle, "download in place");
    }
}
