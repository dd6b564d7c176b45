//! Remote tree loading and server events.

use chrono::NaiveDateTime;

use super::{subtree, Client, PendingOp};
use crate::node_graph::{resolve_share_key, GraphError, IngestReport, Node};
use crate::transport::{Completion, Response, ServerEvent, TransportError};
use crate::types::{Ds, NodeHandle};

impl Client {
    /// Hand a completion to whoever posted the request
    pub(super) fn route(&mut self, completion: Completion, now: Ds, local_time: NaiveDateTime) {
        if self.transfers.owns(&completion.id) {
            self.transfers
                .on_completion(completion, now, &mut *self.transport, &*self.fs);
            return;
        }
        if self.fileattrs.owns(&completion.id) {
            self.fileattrs
                .on_completion(completion, now, &self.graph, &mut *self.sink);
            return;
        }
        let Some(op) = self.pending.remove(&completion.id) else {
            tracing::trace!(request = %completion.id, "completion for a forgotten request");
            return;
        };
        match op {
            PendingOp::FetchNodes => self.nodes_fetched(completion.result, now),
            PendingOp::Poll => self.events_polled(completion.result, now),
            op => self.op_completed(op, completion.result, now, local_time),
        }
    }

    fn nodes_fetched(&mut self, result: Result<Response, TransportError>, now: Ds) {
        self.fetching = false;
        let (nodes, cursor) = match result {
            Ok(Response::Nodes { nodes, cursor }) => (nodes, cursor),
            Ok(other) => {
                tracing::warn!(response = ?other, "unexpected response to tree fetch");
                self.fetch_bt.backoff(now);
                return;
            }
            Err(e) => {
                self.fetch_bt.backoff(now);
                tracing::warn!(retry_in = self.fetch_bt.retry_in(now), "tree fetch failed: {}", e);
                return;
            }
        };
        self.fetch_bt.reset();
        let count = nodes.len();
        let report = self.graph.ingest_remote(nodes, &self.keyring);
        self.report_ingest(report);
        tracing::info!(nodes = count, cursor = %cursor, "remote tree loaded");
        self.cursor = Some(cursor);
        self.cursor_dirty = true;
        self.poll_bt.reset();
        self.reconcile_all();
    }

    fn events_polled(&mut self, result: Result<Response, TransportError>, now: Ds) {
        self.polling = false;
        let (events, cursor) = match result {
            Ok(Response::Events { events, cursor }) => (events, cursor),
            Ok(other) => {
                tracing::warn!(response = ?other, "unexpected response to event poll");
                self.poll_bt.backoff(now);
                return;
            }
            Err(e) => {
                self.poll_bt.backoff(now);
                tracing::debug!(retry_in = self.poll_bt.retry_in(now), "event poll failed: {}", e);
                return;
            }
        };
        if events.is_empty() {
            self.poll_bt.backoff_for(now, self.config.poll_interval);
        } else {
            self.poll_bt.reset();
            tracing::debug!(count = events.len(), "applying server events");
        }
        for event in events {
            self.apply_event(event);
        }
        if self.cursor.as_deref() != Some(cursor.as_str()) {
            self.cursor = Some(cursor);
            self.cursor_dirty = true;
        }
    }

    pub(super) fn report_ingest(&mut self, report: IngestReport) {
        for error in &report.rejected {
            tracing::warn!("rejected node: {}", error);
        }
        if !report.dropped.is_empty() {
            let tops: Vec<NodeHandle> = report
                .rejected
                .iter()
                .filter_map(|error| match error {
                    GraphError::UnresolvedParent { node, .. } => Some(*node),
                    _ => None,
                })
                .collect();
            self.release_nodes(report.dropped, &tops);
        }
        let changed: Vec<NodeHandle> = report
            .added
            .iter()
            .chain(report.updated.iter())
            .copied()
            .collect();
        if !changed.is_empty() {
            self.sink.nodes_updated(&changed);
        }
    }

    /// Apply one server event; events arrive and are applied in order
    pub(super) fn apply_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::NewNodes(nodes) => {
                let report = self.graph.ingest_remote(nodes, &self.keyring);
                self.report_ingest(report);
            }
            ServerEvent::AttributesUpdated { node, attrs } => {
                if let Err(e) = self.graph.set_attribute_blob(&node, attrs) {
                    tracing::debug!(node = %node, "attribute update ignored: {}", e);
                    return;
                }
                self.sink.nodes_updated(&[node]);
            }
            ServerEvent::Moved { node, parent } => self.node_moved(node, parent),
            ServerEvent::Deleted(node) => self.node_deleted(node),
            ServerEvent::ShareKey { node, key } => {
                let Some(share_key) = resolve_share_key(&key, &self.keyring, &node) else {
                    return;
                };
                match self.graph.set_share_key(&node, share_key, &self.keyring) {
                    Ok(decrypted) if !decrypted.is_empty() => self.sink.nodes_updated(&decrypted),
                    Ok(_) => {}
                    Err(e) => tracing::debug!(node = %node, "share key for unknown node: {}", e),
                }
            }
        }
        self.reconcile_all();
    }

    /// Reparent a node. Leaving the area of a sync counts as a deletion there.
    pub(super) fn node_moved(&mut self, node: NodeHandle, parent: NodeHandle) {
        let before = self.sync_covering(&node);
        if let Err(e) = self.graph.move_node(&node, &parent) {
            tracing::warn!(node = %node, parent = %parent, "move not applied: {}", e);
            return;
        }
        let after = self.sync_covering(&node);
        if let Some(sync) = before.filter(|s| Some(*s) != after) {
            tracing::debug!(node = %node, sync = %sync, "node left the sync");
            for handle in subtree(&self.graph, &node) {
                self.cancel_downloads(&handle);
            }
            if let Some(local) = self.bindings.unbind_node(&node) {
                if let Some(s) = self.syncs.get_mut(&local.sync()) {
                    s.mark_deleted(&local);
                }
            }
        }
        self.sink.nodes_updated(&[node]);
    }

    pub(super) fn node_deleted(&mut self, node: NodeHandle) {
        let removed = self.graph.remove_subtree(&node);
        if removed.is_empty() {
            return;
        }
        tracing::debug!(node = %node, count = removed.len(), "remote subtree removed");
        self.release_nodes(removed, &[node]);
    }

    /// Forget everything bound to nodes gone from the graph. Local
    /// counterparts of `tops` count as deleted remotely.
    fn release_nodes(&mut self, removed: Vec<Node>, tops: &[NodeHandle]) {
        let mut handles = Vec::with_capacity(removed.len());
        for gone in removed {
            self.debris.remove(&gone.handle);
            self.cancel_downloads(&gone.handle);
            if let Some(local) = self.bindings.unbind_node(&gone.handle) {
                if tops.contains(&gone.handle) {
                    if let Some(s) = self.syncs.get_mut(&local.sync()) {
                        s.mark_deleted(&local);
                    }
                }
            }
            handles.push(gone.handle);
        }
        self.sink.nodes_updated(&handles);
    }

    pub(super) fn cancel_downloads(&mut self, node: &NodeHandle) {
        for sync in self.syncs.values_mut() {
            if let Some(requester) = sync.downloads.remove(node) {
                self.transfers
                    .remove_requester(requester, &mut *self.transport, &*self.fs);
            }
        }
    }
}
