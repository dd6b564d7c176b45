//! Keeping the local tree current.
//!
//! Paths are checked off the scan queue a bounded number at a time. A
//! folder check lists the folder and queues what it has not seen before; a
//! file check refreshes the fingerprint when size or mtime moved. Entries
//! that stop showing up are only removed once every queue has drained.

use std::path::{Path, PathBuf};

use super::{ScanEntry, Sync, SyncContext};
use crate::backoff::BackoffTimer;
use crate::fingerprint::FileFingerprint;
use crate::fs::{FsError, FsStat};
use crate::local_tree::AddKind;
use crate::transfer::RequesterKind;
use crate::types::{LocalId, NodeType, SyncState, TreeState};

impl Sync {
    pub(crate) fn scan_step(&mut self, cx: &mut SyncContext<'_>) {
        let ready: Vec<PathBuf> = self
            .retry
            .iter()
            .filter(|(_, bt)| bt.armed(cx.now))
            .map(|(path, _)| path.clone())
            .collect();
        for path in ready {
            self.retry.remove(&path);
            self.scan_queue.push_back(ScanEntry {
                path,
                due: 0,
                recursive: true,
                short_name: None,
            });
        }

        let mut budget = cx.config.scan_budget.max(1);
        while budget > 0 {
            match self.scan_queue.front() {
                Some(entry) if entry.due <= cx.now => {}
                _ => break,
            }
            let Some(entry) = self.scan_queue.pop_front() else {
                break;
            };
            budget -= 1;
            self.checkpath(cx, entry);
            if !self.state.is_running() {
                return;
            }
        }
    }

    fn checkpath(&mut self, cx: &mut SyncContext<'_>, entry: ScanEntry) {
        let ScanEntry {
            path: rel,
            recursive,
            short_name,
            ..
        } = entry;
        if rel.as_os_str().is_empty() {
            self.check_root(cx, recursive);
            return;
        }
        if self.in_local_debris(&rel, cx.config) {
            return;
        }
        let (Some(parent_rel), Some(name)) = (rel.parent(), rel.file_name().and_then(|n| n.to_str()))
        else {
            return;
        };
        let Some(parent) = self.tree.lookup(parent_rel) else {
            // the parent's listing picks this entry up
            self.scan_queue.push_back(ScanEntry {
                path: parent_rel.to_path_buf(),
                due: 0,
                recursive: false,
                short_name: None,
            });
            return;
        };

        let abs = self.local_root.join(&rel);
        match cx.fs.stat(&abs) {
            Ok(stat) => self.check_existing(cx, parent, name, &rel, &abs, stat, short_name, recursive),
            Err(FsError::NotFound(_)) | Err(FsError::NotADirectory(_)) => {
                if let Some(id) = self.tree.child_by_name(&parent, name) {
                    tracing::trace!(sync = %self.id, path = ?rel, "entry gone");
                    self.tree.set_not_seen(&id, true);
                }
            }
            Err(e) if e.is_transient() => self.retry_path(cx, rel, &e),
            Err(e) => tracing::warn!(sync = %self.id, path = ?rel, "cannot stat: {}", e),
        }
    }

    fn check_root(&mut self, cx: &mut SyncContext<'_>, recursive: bool) {
        let root_path = self.local_root.clone();
        match cx.fs.stat(&root_path) {
            Ok(stat) if stat.node_type == NodeType::Folder => {
                let root = self.tree.root();
                self.list_dir(cx, root, Path::new(""), &root_path, recursive);
            }
            Ok(_) => self.fail(cx, "local root is no longer a folder"),
            Err(FsError::NotFound(_)) => self.fail(cx, "local root disappeared"),
            Err(e) if e.is_transient() => self.retry_path(cx, PathBuf::new(), &e),
            Err(e) => self.fail(cx, &e.to_string()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_existing(
        &mut self,
        cx: &mut SyncContext<'_>,
        parent: LocalId,
        name: &str,
        rel: &Path,
        abs: &Path,
        stat: FsStat,
        short_name: Option<String>,
        recursive: bool,
    ) {
        let outcome = match self.tree.add_or_update(parent, name, short_name, &stat) {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::warn!(sync = %self.id, path = ?rel, "cannot record entry: {}", e);
                return;
            }
        };
        if !outcome.displaced.is_empty() {
            self.release_removed(cx, outcome.displaced, false);
            self.needs_reconcile = true;
        }

        let id = outcome.id;
        match outcome.kind {
            AddKind::Created => {
                tracing::debug!(sync = %self.id, path = ?rel, "new local entry");
                self.set_tree_state(&id, TreeState::Pending, cx.sink);
                self.needs_reconcile = true;
            }
            AddKind::Moved { old_parent, old_name } => {
                tracing::info!(
                    sync = %self.id,
                    from = ?self.tree.path(&old_parent).join(&old_name),
                    to = ?rel,
                    "local move"
                );
                if cx.bindings.node_of(&id).is_some() {
                    if let Some(node) = self.tree.get_mut(&id) {
                        node.pending_move = true;
                    }
                    self.tree.touch(&id);
                }
                self.needs_reconcile = true;
            }
            AddKind::Existing => {}
        }

        if stat.node_type.is_file() {
            self.check_file(cx, id, rel, abs, &stat);
        } else {
            self.list_dir(cx, id, rel, abs, recursive);
        }
    }

    fn check_file(&mut self, cx: &mut SyncContext<'_>, id: LocalId, rel: &Path, abs: &Path, stat: &FsStat) {
        let Some(node) = self.tree.get(&id) else {
            return;
        };
        let old = node.fingerprint;
        if old.valid && old.size == stat.size && old.mtime == stat.mtime {
            return;
        }

        let generated = cx
            .fs
            .open_read(abs)
            .and_then(|mut file| FileFingerprint::generate(&mut *file));
        let fingerprint = match generated {
            Ok(fingerprint) => fingerprint,
            Err(FsError::NotFound(_)) => {
                self.tree.set_not_seen(&id, true);
                return;
            }
            Err(e) if e.is_transient() => {
                self.retry_path(cx, rel.to_path_buf(), &e);
                return;
            }
            Err(e) => {
                tracing::warn!(sync = %self.id, path = ?rel, "cannot fingerprint: {}", e);
                return;
            }
        };

        let changed = !old.valid || fingerprint != old;
        self.tree.set_fingerprint(&id, fingerprint);
        if !changed {
            return;
        }
        tracing::debug!(sync = %self.id, path = ?rel, size = fingerprint.size, "local content changed");

        let stale_upload = self.tree.get_mut(&id).and_then(|node| {
            if self.state == SyncState::Active {
                node.nagle_until = cx.now.saturating_add(cx.config.upload_nagle);
            }
            node.upload.take()
        });
        if stale_upload.is_some() {
            let sync = self.id;
            cx.transfers.remove_requesters(
                |r| matches!(&r.kind, RequesterKind::SyncUpload { sync: s, local, .. } if *s == sync && *local == id),
                cx.transport,
                cx.fs,
            );
        }
        self.set_tree_state(&id, TreeState::Pending, cx.sink);
        self.needs_reconcile = true;
    }

    fn list_dir(&mut self, cx: &mut SyncContext<'_>, id: LocalId, rel: &Path, abs: &Path, recursive: bool) {
        let entries = match cx.fs.read_dir(abs) {
            Ok(entries) => entries,
            Err(FsError::NotFound(_)) => {
                self.tree.set_not_seen(&id, true);
                return;
            }
            Err(e) if e.is_transient() => {
                self.retry_path(cx, rel.to_path_buf(), &e);
                return;
            }
            Err(e) => {
                tracing::warn!(sync = %self.id, path = ?rel, "cannot list: {}", e);
                return;
            }
        };

        self.tree.begin_pass();
        self.tree.mark_seen(&id);
        let at_root = id == self.tree.root();
        for entry in entries {
            if at_root && entry.name == cx.config.local_debris {
                continue;
            }
            let known = self.tree.child_by_name(&id, &entry.name);
            if let Some(child) = known {
                self.tree.mark_seen(&child);
            }
            if known.is_none() || recursive {
                self.scan_queue.push_back(ScanEntry {
                    path: rel.join(&entry.name),
                    due: 0,
                    recursive: true,
                    short_name: entry.short_name,
                });
            }
        }

        let unseen = self.tree.sweep_unseen(&id);
        if !unseen.is_empty() {
            tracing::debug!(sync = %self.id, path = ?rel, count = unseen.len(), "entries not seen");
            self.needs_reconcile = true;
        }
    }

    fn retry_path(&mut self, cx: &SyncContext<'_>, rel: PathBuf, error: &FsError) {
        tracing::debug!(sync = %self.id, path = ?rel, "retrying later: {}", error);
        let cap = cx.config.backoff_cap;
        self.retry
            .entry(rel)
            .or_insert_with(|| BackoffTimer::new(cap))
            .backoff_for(cx.now, cx.config.lock_retry);
    }

    fn fail(&mut self, cx: &mut SyncContext<'_>, reason: &str) {
        let sync = self.id;
        cx.transfers
            .remove_requesters(|r| r.kind.sync() == sync, cx.transport, cx.fs);
        self.downloads.clear();
        self.scan_queue.clear();
        self.retry.clear();
        self.set_state(SyncState::Failed, Some(reason), cx.sink);
    }

    /// Remove entries that stayed unseen through a whole scan
    pub(crate) fn remove_unseen(&mut self, cx: &mut SyncContext<'_>) {
        if !self.tree.has_unseen() || self.tree.creating() {
            return;
        }
        for top in self.tree.unseen_tops() {
            let path = self.tree.path(&top);
            let removed = self.tree.remove(&top);
            tracing::info!(sync = %self.id, path = ?path, count = removed.len(), "local deletion");
            self.release_removed(cx, removed, false);
        }
        self.needs_reconcile = true;
    }
}
