//! Finished and abandoned transfers.

use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use super::{sync_context, Client, PendingOp};
use crate::crypto::AttrMap;
use crate::fingerprint::FileFingerprint;
use crate::fs::FsError;
use crate::node_graph::{ATTR_FINGERPRINT, ATTR_NAME};
use crate::sync::debris::{move_to_local_debris, next_temp_handle};
use crate::sync::{new_file_node, remote_mtime, SyncAction, SyncContext};
use crate::transfer::{RequesterKind, Transfer, TransferError, TransferEvent};
use crate::transport::{NewNodeSource, Request};
use crate::types::{Direction, Ds, LocalId, NodeHandle, NodeType, SyncId};

impl Client {
    pub(super) fn finalize(&mut self, transfer: Transfer, now: Ds, local_time: NaiveDateTime) {
        match transfer.direction {
            Direction::Get => self.finalize_download(transfer, now, local_time),
            Direction::Put => self.finalize_upload(transfer, now),
        }
    }

    fn finalize_download(&mut self, transfer: Transfer, now: Ds, local_time: NaiveDateTime) {
        let Some(temp) = transfer.temp_path.clone() else {
            tracing::warn!(transfer = %transfer.id, "download finished without a temporary file");
            return;
        };
        if let Err(e) = self.fs.set_mtime(&temp, transfer.fingerprint.mtime) {
            tracing::debug!(path = ?temp, "cannot set modification time: {}", e);
        }
        let fingerprint = match self
            .fs
            .open_read(&temp)
            .and_then(|mut file| FileFingerprint::generate(&mut *file))
        {
            Ok(fingerprint) => fingerprint,
            Err(e) => {
                self.transfers.retry_completed(transfer, e.into(), now, &*self.fs);
                return;
            }
        };
        if transfer.fingerprint.valid && fingerprint != transfer.fingerprint {
            if let Err(e) = self.fs.remove_file(&temp) {
                tracing::debug!(path = ?temp, "cannot remove rejected download: {}", e);
            }
            let error = TransferError::Integrity("content does not match its fingerprint".to_string());
            self.transfers.retry_completed(transfer, error, now, &*self.fs);
            return;
        }

        let targets: Vec<(SyncId, NodeHandle, PathBuf)> = transfer
            .requesters
            .iter()
            .filter_map(|r| match &r.kind {
                RequesterKind::SyncDownload { sync, node, target } => Some((*sync, *node, target.clone())),
                _ => None,
            })
            .collect();
        if !transfer.fingerprint.valid {
            for node in targets.iter().map(|(_, node, _)| *node) {
                self.write_back_fingerprint(node, &fingerprint);
            }
        }

        let mut placed: Option<PathBuf> = None;
        for (sync, node, target) in targets {
            let Some(root) = self.syncs.get(&sync).map(|s| s.local_root().to_path_buf()) else {
                continue;
            };
            let source = placed.as_deref().unwrap_or(temp.as_path());
            let moved = self.put_in_place(&root, source, &target, placed.is_some(), &fingerprint, &local_time);
            match moved {
                Ok(()) => {
                    if placed.is_none() {
                        placed = Some(target.clone());
                    }
                    let mut actions = Vec::new();
                    let Some(s) = self.syncs.get_mut(&sync) else {
                        continue;
                    };
                    let mut cx = sync_context!(self, &mut actions, now, local_time);
                    s.download_placed(&mut cx, node, &target, fingerprint);
                }
                Err(e) => {
                    tracing::warn!(sync = %sync, path = ?target, "cannot place download: {}", e);
                    if let Some(s) = self.syncs.get_mut(&sync) {
                        s.downloads.remove(&node);
                        s.reconcile_by(now.saturating_add(self.config.lock_retry));
                    }
                }
            }
        }
        if placed.is_none() {
            if let Err(e) = self.fs.remove_file(&temp) {
                tracing::debug!(path = ?temp, "cannot remove unused download: {}", e);
            }
        }
    }

    /// Move (or copy) downloaded content to `target`, sending whatever
    /// occupies the name to local debris first
    fn put_in_place(
        &self,
        root: &Path,
        source: &Path,
        target: &Path,
        copy: bool,
        fingerprint: &FileFingerprint,
        local_time: &NaiveDateTime,
    ) -> Result<(), FsError> {
        match self.fs.stat(target) {
            Ok(_) => {
                move_to_local_debris(&*self.fs, root, &self.config.local_debris, local_time, target)?;
            }
            Err(FsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        if copy {
            self.fs.copy(source, target)?;
            self.fs.set_mtime(target, fingerprint.mtime)?;
        } else {
            self.fs.rename(source, target)?;
        }
        Ok(())
    }

    /// Nodes without a content fingerprint get the one computed from the download
    fn write_back_fingerprint(&mut self, node: NodeHandle, fingerprint: &FileFingerprint) {
        let Some(mut attrs) = self.graph.get(&node).and_then(|n| n.attrs().cloned()) else {
            return;
        };
        attrs.insert(ATTR_FINGERPRINT.to_string(), fingerprint.to_attribute());
        tracing::debug!(node = %node, "storing computed fingerprint");
        self.post_actions(vec![SyncAction::SetAttributes { node, attrs }]);
    }

    fn finalize_upload(&mut self, transfer: Transfer, now: Ds) {
        let (Some(token), Some(key)) = (transfer.token.clone(), transfer.key) else {
            let error = TransferError::Integrity("upload finished without a token".to_string());
            self.transfers.retry_completed(transfer, error, now, &*self.fs);
            return;
        };

        let mut primary: Option<(SyncId, LocalId)> = None;
        for requester in &transfer.requesters {
            let RequesterKind::SyncUpload { sync, local, path } = &requester.kind else {
                continue;
            };
            let current = self
                .fs
                .open_read(path)
                .and_then(|mut file| FileFingerprint::generate(&mut *file));
            let unchanged = matches!(&current, Ok(fp) if *fp == transfer.fingerprint);
            let Some(s) = self.syncs.get_mut(sync) else {
                continue;
            };
            if !unchanged {
                tracing::info!(sync = %sync, path = ?path, "source changed during upload");
                self.sink.transfer_update(&TransferEvent::Failed {
                    id: transfer.id,
                    direction: Direction::Put,
                    error: TransferError::SourceChanged,
                    retry_in: None,
                });
                if let Some(node) = s.tree.get_mut(local) {
                    node.upload = None;
                }
                s.rescan(local, now);
                continue;
            }
            if primary.is_none() {
                primary = Some((*sync, *local));
            } else {
                // the others pick up the new node as a content copy
                if let Some(node) = s.tree.get_mut(local) {
                    node.upload = None;
                }
                s.needs_reconcile = true;
            }
        }
        let Some((sync, local)) = primary else {
            return;
        };

        let Some((name, parent_local)) = self
            .syncs
            .get(&sync)
            .and_then(|s| s.tree.get(&local))
            .map(|n| (n.name.clone(), n.parent))
        else {
            return;
        };
        let parent = parent_local
            .and_then(|p| self.bindings.node_of(&p))
            .filter(|h| self.graph.contains(h));
        let existing = parent.and_then(|parent| {
            self.bindings
                .node_of(&local)
                .and_then(|h| self.graph.get(&h))
                .or_else(|| {
                    self.graph
                        .child_by_name(&parent, &name)
                        .filter(|n| self.bindings.local_of(&n.handle).is_none())
                })
                .filter(|n| n.node_type == NodeType::File)
                .map(|n| (n.handle, remote_mtime(n)))
        });

        let (target, replaces, to_debris) = match (parent, existing) {
            (Some(_), Some((old, mtime))) if mtime > transfer.fingerprint.mtime => {
                tracing::info!(sync = %sync, file = %name, "remote copy is newer, keeping upload in debris");
                (self.graph.root(NodeType::Rubbish), Some(old), true)
            }
            (Some(parent), existing) => (Some(parent), existing.map(|(old, _)| old), false),
            (None, _) => {
                tracing::info!(sync = %sync, file = %name, "parent folder gone, keeping upload in debris");
                (self.graph.root(NodeType::Rubbish), None, true)
            }
        };
        let Some(target) = target else {
            tracing::warn!(sync = %sync, file = %name, "nowhere to attach finished upload");
            self.upload_detached(sync, local);
            return;
        };

        let mut attrs = AttrMap::new();
        attrs.insert(ATTR_NAME.to_string(), name.clone());
        attrs.insert(ATTR_FINGERPRINT.to_string(), transfer.fingerprint.to_attribute());
        let temp = next_temp_handle(&mut self.next_temp);
        let source = NewNodeSource::Upload { token };
        let node = match new_file_node(
            temp,
            None,
            source,
            &key.to_bytes(),
            &attrs,
            transfer.fingerprint.mtime,
            &self.keyring,
        ) {
            Ok(node) => node,
            Err(e) => {
                tracing::warn!(sync = %sync, file = %name, "cannot prepare uploaded node: {}", e);
                self.upload_detached(sync, local);
                return;
            }
        };
        tracing::debug!(sync = %sync, file = %name, parent = %target, "attaching upload");
        let request = self.transport.post(Request::PutNodes {
            parent: target,
            nodes: vec![node],
        });
        self.pending.insert(
            request,
            PendingOp::UploadFinal {
                temp,
                origin: Some(local),
                replaces: replaces.filter(|_| !to_debris),
                to_debris,
            },
        );
    }

    fn upload_detached(&mut self, sync: SyncId, local: LocalId) {
        if let Some(s) = self.syncs.get_mut(&sync) {
            if let Some(node) = s.tree.get_mut(&local) {
                node.upload = None;
            }
            s.needs_reconcile = true;
        }
    }

    /// A transfer failed too often; the sync tries again after a pause
    pub(super) fn abandoned(&mut self, transfer: Transfer, now: Ds) {
        let later = now.saturating_add(self.config.backoff_cap);
        for requester in &transfer.requesters {
            match &requester.kind {
                RequesterKind::SyncDownload { sync, node, .. } => {
                    if let Some(s) = self.syncs.get_mut(sync) {
                        if s.downloads.get(node) == Some(&requester.id) {
                            s.downloads.remove(node);
                        }
                        s.reconcile_by(later);
                    }
                }
                RequesterKind::SyncUpload { sync, local, .. } => {
                    if let Some(s) = self.syncs.get_mut(sync) {
                        if let Some(node) = s.tree.get_mut(local) {
                            if node.upload == Some(transfer.id) {
                                node.upload = None;
                                node.nagle_until = later;
                            }
                        }
                        s.reconcile_by(later);
                    }
                }
            }
        }
    }
}
