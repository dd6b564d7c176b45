//! Local to remote.
//!
//! Walks a local folder next to its bound remote folder. New folders (and
//! files whose content already exists remotely) are gathered into one
//! creation batch per remote parent; other new or changed files are
//! uploaded once their nagle period has passed.

use super::debris::next_temp_handle;
use super::syncdown::remote_mtime;
use super::{new_file_node, new_folder_node, Sync, SyncAction, SyncContext};
use crate::crypto::AttrMap;
use crate::node_graph::{SyncDeleted, ATTR_FINGERPRINT, ATTR_NAME};
use crate::transfer::{RequesterKind, TransferSpec};
use crate::transport::{NewNode, NewNodeSource};
use crate::types::{Direction, LocalId, NodeHandle, NodeType, TreeState};

/// One creation batch under a bound remote folder
#[derive(Default)]
struct Batch {
    nodes: Vec<NewNode>,
    origins: Vec<(NodeHandle, LocalId)>,
}

impl Sync {
    pub(crate) fn syncup(&mut self, cx: &mut SyncContext<'_>, local: LocalId, remote: NodeHandle) {
        let mut batch = Batch::default();

        for child in self.tree.child_ids(&local) {
            let Some(node) = self.tree.get(&child) else {
                continue;
            };
            if node.deleted || node.created || self.tree.is_not_seen(&child) {
                continue;
            }
            let (node_type, name, fingerprint) = (node.node_type, node.name.clone(), node.fingerprint);

            if let Some(bound) = cx.bindings.node_of(&child) {
                if cx.graph.contains(&bound) {
                    self.bound_up(cx, child, bound, remote);
                    continue;
                }
                cx.bindings.unbind_local(&child);
                self.tree.touch(&child);
            }

            let counterpart = cx
                .graph
                .child_by_name(&remote, &name)
                .filter(|n| {
                    n.is_decrypted()
                        && n.sync_deleted == SyncDeleted::None
                        && !cx.busy.contains(&n.handle)
                        && cx.bindings.local_of(&n.handle).is_none()
                })
                .map(|n| (n.handle, n.node_type, n.fingerprint, remote_mtime(n)));
            if let Some((handle, remote_type, remote_fp, remote_mtime)) = counterpart {
                if remote_type != node_type {
                    continue;
                }
                if node_type == NodeType::Folder {
                    cx.bindings.bind(child, handle);
                    self.tree.touch(&child);
                    self.syncup(cx, child, handle);
                } else if fingerprint.valid {
                    if remote_fp == Some(fingerprint) {
                        cx.bindings.bind(child, handle);
                        self.tree.touch(&child);
                        self.set_tree_state(&child, TreeState::Synced, cx.sink);
                    } else if fingerprint.mtime > remote_mtime {
                        self.queue_upload(cx, child);
                    }
                }
                continue;
            }

            self.collect_new(cx, child, None, &mut batch);
        }

        if !batch.nodes.is_empty() {
            for (_, origin) in &batch.origins {
                if let Some(node) = self.tree.get_mut(origin) {
                    node.created = true;
                }
            }
            tracing::debug!(sync = %self.id, parent = %remote, count = batch.nodes.len(), "creating remote nodes");
            cx.actions.push(SyncAction::CreateNodes {
                sync: self.id,
                parent: remote,
                nodes: batch.nodes,
                origins: batch.origins,
            });
        }

        let empty = self.tree.child_ids(&local).is_empty();
        if empty && local != self.tree.root() && cx.bindings.node_of(&local) == Some(remote) {
            self.set_tree_state(&local, TreeState::Synced, cx.sink);
        }
    }

    /// A local entry with a live bound node under `parent`
    fn bound_up(&mut self, cx: &mut SyncContext<'_>, local: LocalId, handle: NodeHandle, parent: NodeHandle) {
        let (Some(node), Some(remote)) = (self.tree.get(&local), cx.graph.get(&handle)) else {
            return;
        };
        let node_type = node.node_type;
        let busy = cx.busy.contains(&handle);

        if node.pending_move && !busy {
            let renamed = remote.name() != Some(node.name.as_str());
            let reparented = remote.parent != Some(parent);
            if reparented {
                tracing::info!(sync = %self.id, node = %handle, "moving remote node after local move");
                cx.actions.push(SyncAction::Move { node: handle, parent });
            }
            if renamed {
                tracing::info!(sync = %self.id, node = %handle, name = %node.name, "renaming remote node");
                let mut attrs = remote.attrs().cloned().unwrap_or_default();
                attrs.insert(ATTR_NAME.to_string(), node.name.clone());
                cx.actions.push(SyncAction::SetAttributes { node: handle, attrs });
            }
            if !renamed && !reparented {
                if let Some(node) = self.tree.get_mut(&local) {
                    node.pending_move = false;
                }
                self.tree.touch(&local);
            }
        }

        if node_type == NodeType::Folder {
            self.syncup(cx, local, handle);
            return;
        }
        let Some(node) = self.tree.get(&local) else {
            return;
        };
        if busy || node.upload.is_some() || !node.fingerprint.valid {
            return;
        }
        let fingerprint = node.fingerprint;
        match cx.graph.get(&handle) {
            Some(remote) if remote.fingerprint == Some(fingerprint) => {
                self.set_tree_state(&local, TreeState::Synced, cx.sink);
            }
            Some(remote) if fingerprint.mtime > remote_mtime(remote) => self.queue_upload(cx, local),
            _ => {}
        }
    }

    /// Gather `local` (and, for folders, everything below it) into `batch`
    fn collect_new(
        &mut self,
        cx: &mut SyncContext<'_>,
        local: LocalId,
        parent_temp: Option<NodeHandle>,
        batch: &mut Batch,
    ) {
        let Some(node) = self.tree.get(&local) else {
            return;
        };
        if node.deleted || node.created || self.tree.is_not_seen(&local) {
            return;
        }
        let (node_type, name, fingerprint) = (node.node_type, node.name.clone(), node.fingerprint);

        match node_type {
            NodeType::Folder => {
                let temp = next_temp_handle(cx.next_temp);
                match new_folder_node(temp, parent_temp, &name, cx.keyring) {
                    Ok(new) => {
                        batch.nodes.push(new);
                        batch.origins.push((temp, local));
                    }
                    Err(e) => {
                        tracing::warn!(sync = %self.id, "cannot prepare folder {}: {}", name, e);
                        return;
                    }
                }
                for child in self.tree.child_ids(&local) {
                    self.collect_new(cx, child, Some(temp), batch);
                }
            }
            NodeType::File => {
                if !fingerprint.valid {
                    return;
                }
                let existing = cx
                    .graph
                    .node_by_fingerprint(&fingerprint)
                    .filter(|n| n.sync_deleted == SyncDeleted::None)
                    .and_then(|n| n.key_bytes().map(|key| (n.handle, key.to_vec())));
                match existing {
                    Some((from, key)) => {
                        let mut attrs = AttrMap::new();
                        attrs.insert(ATTR_NAME.to_string(), name.clone());
                        attrs.insert(ATTR_FINGERPRINT.to_string(), fingerprint.to_attribute());
                        let temp = next_temp_handle(cx.next_temp);
                        let source = NewNodeSource::Copy { from };
                        match new_file_node(temp, parent_temp, source, &key, &attrs, fingerprint.mtime, cx.keyring) {
                            Ok(new) => {
                                tracing::info!(sync = %self.id, file = %name, from = %from, "reusing remote content");
                                batch.nodes.push(new);
                                batch.origins.push((temp, local));
                            }
                            Err(e) => tracing::warn!(sync = %self.id, "cannot prepare copy of {}: {}", name, e),
                        }
                    }
                    // the parent is still being created
                    None if parent_temp.is_some() => {}
                    None => self.queue_upload(cx, local),
                }
            }
            _ => {}
        }
    }

    fn queue_upload(&mut self, cx: &mut SyncContext<'_>, local: LocalId) {
        let Some(node) = self.tree.get(&local) else {
            return;
        };
        if node.upload.is_some() || !node.fingerprint.valid {
            return;
        }
        if node.nagle_until > cx.now {
            let at = node.nagle_until;
            self.reconcile_by(at);
            self.set_tree_state(&local, TreeState::Pending, cx.sink);
            return;
        }
        let fingerprint = node.fingerprint;
        let path = self.abs_path(&local);
        let spec = TransferSpec {
            direction: Direction::Put,
            fingerprint,
            size: fingerprint.size,
            node: None,
            key: None,
            temp_path: None,
        };
        let (transfer, _) = cx.transfers.enqueue(
            spec,
            RequesterKind::SyncUpload {
                sync: self.id,
                local,
                path: path.clone(),
            },
        );
        tracing::debug!(sync = %self.id, transfer = %transfer, path = ?path, "upload queued");
        if let Some(node) = self.tree.get_mut(&local) {
            node.upload = Some(transfer);
        }
        self.set_tree_state(&local, TreeState::Syncing, cx.sink);
    }
}
