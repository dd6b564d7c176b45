//! Requests the client makes on behalf of syncs and the debris queue.

use std::collections::HashMap;

use chrono::NaiveDateTime;

use super::{Client, PendingOp};
use crate::crypto::encrypt_attributes;
use crate::node_graph::SyncDeleted;
use crate::sync::debris::DebrisStep;
use crate::sync::SyncAction;
use crate::transport::{RemoteNode, Request, Response, TransportError};
use crate::types::{Ds, NodeHandle, TreeState};

impl Client {
    pub(super) fn post_actions(&mut self, actions: Vec<SyncAction>) {
        for action in actions {
            match action {
                SyncAction::CreateNodes {
                    sync,
                    parent,
                    nodes,
                    origins,
                } => {
                    let request = self.transport.post(Request::PutNodes { parent, nodes });
                    self.pending
                        .insert(request, PendingOp::SyncCreate { sync, origins });
                }
                SyncAction::Move { node, parent } => {
                    if !self.busy.insert(node) {
                        continue;
                    }
                    let request = self.transport.post(Request::Move { node, parent });
                    self.pending.insert(
                        request,
                        PendingOp::Move {
                            node,
                            parent,
                            to_debris: false,
                        },
                    );
                }
                SyncAction::SetAttributes { node, attrs } => {
                    let Some(key) = self.graph.get(&node).and_then(|n| n.attr_key()) else {
                        continue;
                    };
                    let blob = match encrypt_attributes(&attrs, &key) {
                        Ok(blob) => blob,
                        Err(e) => {
                            tracing::warn!(node = %node, "cannot encrypt attributes: {}", e);
                            continue;
                        }
                    };
                    if !self.busy.insert(node) {
                        continue;
                    }
                    let request = self
                        .transport
                        .post(Request::SetAttributes { node, attrs: blob });
                    self.pending
                        .insert(request, PendingOp::SetAttributes { node, attrs });
                }
            }
        }
    }

    pub(super) fn step_debris(&mut self, now: Ds, local_time: NaiveDateTime) {
        let steps = self.debris.step(
            &mut self.graph,
            &self.config,
            &self.keyring,
            &local_time,
            now,
            &mut self.next_temp,
        );
        for step in steps {
            match step {
                DebrisStep::CreateFolders { parent, nodes } => {
                    let request = self.transport.post(Request::PutNodes { parent, nodes });
                    self.pending.insert(request, PendingOp::DebrisFolders);
                }
                DebrisStep::Move { node, parent } => {
                    tracing::info!(node = %node, path = %self.graph.path(&node), "moving to remote debris");
                    self.busy.insert(node);
                    let request = self.transport.post(Request::Move { node, parent });
                    self.pending.insert(
                        request,
                        PendingOp::Move {
                            node,
                            parent,
                            to_debris: true,
                        },
                    );
                }
            }
        }
    }

    pub(super) fn op_completed(
        &mut self,
        op: PendingOp,
        result: Result<Response, TransportError>,
        now: Ds,
        _local_time: NaiveDateTime,
    ) {
        match op {
            PendingOp::SyncCreate { sync, origins } => {
                let created = match result {
                    Ok(Response::Created { nodes }) => nodes,
                    Ok(other) => {
                        tracing::warn!(sync = %sync, response = ?other, "unexpected response to node creation");
                        Vec::new()
                    }
                    Err(e) => {
                        tracing::warn!(sync = %sync, "node creation failed: {}", e);
                        Vec::new()
                    }
                };
                let by_temp = self.ingest_created(created);
                let Some(s) = self.syncs.get_mut(&sync) else {
                    return;
                };
                let failed = by_temp.is_empty();
                for (temp, local) in origins {
                    if let Some(node) = s.tree.get_mut(&local) {
                        node.created = false;
                    }
                    if let Some(handle) = by_temp.get(&temp) {
                        self.bindings.bind(local, *handle);
                        s.tree.touch(&local);
                        s.set_tree_state(&local, TreeState::Synced, &mut *self.sink);
                    }
                }
                if failed {
                    s.reconcile_by(now.saturating_add(self.config.lock_retry));
                } else {
                    s.needs_reconcile = true;
                }
            }
            PendingOp::UploadFinal {
                temp,
                origin,
                replaces,
                to_debris,
            } => {
                if let Some(local) = origin {
                    if let Some(node) = self
                        .syncs
                        .get_mut(&local.sync())
                        .and_then(|s| s.tree.get_mut(&local))
                    {
                        node.upload = None;
                    }
                }
                let created = match result {
                    Ok(Response::Created { nodes }) => nodes,
                    other => {
                        tracing::warn!(result = ?other, "upload could not be attached to the tree");
                        if let Some(local) = origin {
                            if let Some(s) = self.syncs.get_mut(&local.sync()) {
                                s.reconcile_by(now.saturating_add(self.config.lock_retry));
                            }
                        }
                        return;
                    }
                };
                let by_temp = self.ingest_created(created);
                let Some(handle) = by_temp.get(&temp).copied() else {
                    return;
                };
                if to_debris {
                    tracing::info!(node = %handle, "upload kept in remote debris");
                    self.debris.add(handle, &mut self.graph);
                    self.reconcile_all();
                    return;
                }
                if let Some(old) = replaces.filter(|old| self.graph.contains(old)) {
                    self.bindings.unbind_node(&old);
                    self.debris.add(old, &mut self.graph);
                }
                if let Some(local) = origin {
                    if let Some(s) = self.syncs.get_mut(&local.sync()) {
                        if s.tree.get(&local).is_some() {
                            self.bindings.bind(local, handle);
                            s.tree.touch(&local);
                            s.set_tree_state(&local, TreeState::Synced, &mut *self.sink);
                        }
                        s.needs_reconcile = true;
                    }
                }
            }
            PendingOp::DebrisFolders => match result {
                Ok(Response::Created { nodes }) => {
                    self.ingest_created(nodes);
                    self.debris.folders_done(true, now);
                }
                other => {
                    tracing::warn!(result = ?other, "debris folders not created");
                    self.debris.folders_done(false, now);
                }
            },
            PendingOp::Move {
                node,
                parent,
                to_debris,
            } => {
                self.busy.remove(&node);
                match result {
                    Ok(_) => {
                        self.node_moved(node, parent);
                        if let Some(n) = self.graph.get_mut(&node) {
                            n.sync_deleted = SyncDeleted::None;
                        }
                    }
                    Err(e) if to_debris && self.graph.contains(&node) => {
                        tracing::warn!(node = %node, "debris move failed: {}", e);
                        self.debris.requeue(node, &mut self.graph, now);
                    }
                    Err(e) => {
                        tracing::warn!(node = %node, "move failed: {}", e);
                        self.reconcile_later(now);
                    }
                }
                self.reconcile_all();
            }
            PendingOp::SetAttributes { node, attrs } => {
                self.busy.remove(&node);
                match result {
                    Ok(_) => {
                        if let Err(e) = self.graph.set_attributes(&node, attrs) {
                            tracing::debug!(node = %node, "attributes changed on a vanished node: {}", e);
                        }
                        self.sink.nodes_updated(&[node]);
                        self.reconcile_all();
                    }
                    Err(e) => {
                        tracing::warn!(node = %node, "attribute update failed: {}", e);
                        self.reconcile_later(now);
                    }
                }
            }
            PendingOp::FetchNodes | PendingOp::Poll => {}
        }
    }

    /// Add nodes we just created to the graph; returns placeholder -> real handle
    fn ingest_created(&mut self, created: Vec<(NodeHandle, RemoteNode)>) -> HashMap<NodeHandle, NodeHandle> {
        let by_temp: HashMap<NodeHandle, NodeHandle> =
            created.iter().map(|(temp, node)| (*temp, node.handle)).collect();
        let nodes: Vec<RemoteNode> = created.into_iter().map(|(_, node)| node).collect();
        if nodes.is_empty() {
            return by_temp;
        }
        let report = self.graph.ingest_remote(nodes, &self.keyring);
        self.report_ingest(report);
        by_temp
    }

    fn reconcile_later(&mut self, now: Ds) {
        let at = now.saturating_add(self.config.lock_retry);
        for sync in self.syncs.values_mut() {
            sync.reconcile_by(at);
        }
    }
}
