use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fileattr::FileAttrError;
use crate::sink::AppSink;
use crate::transfer::TransferEvent;
use crate::types::{NodeHandle, SyncId, SyncState, TreeState};

#[derive(Debug, Default)]
struct Recorded {
    nodes: Vec<NodeHandle>,
    transfers: Vec<TransferEvent>,
    sync_states: Vec<(SyncId, SyncState, Option<String>)>,
    tree_states: Vec<(SyncId, PathBuf, TreeState)>,
    file_attrs: Vec<(NodeHandle, u8, Result<Vec<u8>, FileAttrError>)>,
}

/// Sink that remembers every callback; clones share the log
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn updated_nodes(&self) -> Vec<NodeHandle> {
        self.inner.lock().nodes.clone()
    }

    pub fn transfer_events(&self) -> Vec<TransferEvent> {
        self.inner.lock().transfers.clone()
    }

    pub fn sync_states(&self, sync: SyncId) -> Vec<SyncState> {
        self.inner
            .lock()
            .sync_states
            .iter()
            .filter(|(s, _, _)| *s == sync)
            .map(|(_, state, _)| *state)
            .collect()
    }

    /// Last reported state of a path, if any was reported
    pub fn tree_state(&self, sync: SyncId, path: &Path) -> Option<TreeState> {
        self.inner
            .lock()
            .tree_states
            .iter()
            .rev()
            .find(|(s, p, _)| *s == sync && p == path)
            .map(|(_, _, state)| *state)
    }

    pub fn file_attributes(&self) -> Vec<(NodeHandle, u8, Result<Vec<u8>, FileAttrError>)> {
        self.inner.lock().file_attrs.clone()
    }

    pub fn clear(&self) {
        *self.inner.lock() = Recorded::default();
    }
}

impl AppSink for RecordingSink {
    fn nodes_updated(&mut self, nodes: &[NodeHandle]) {
        self.inner.lock().nodes.extend_from_slice(nodes);
    }

    fn transfer_update(&mut self, event: &TransferEvent) {
        self.inner.lock().transfers.push(event.clone());
    }

    fn sync_state_changed(&mut self, sync: SyncId, state: SyncState, reason: Option<&str>) {
        self.inner
            .lock()
            .sync_states
            .push((sync, state, reason.map(str::to_string)));
    }

    fn tree_state_changed(&mut self, sync: SyncId, path: &Path, state: TreeState) {
        self.inner
            .lock()
            .tree_states
            .push((sync, path.to_path_buf(), state));
    }

    fn file_attribute(&mut self, node: NodeHandle, kind: u8, result: Result<&[u8], &FileAttrError>) {
        let result = result.map(<[u8]>::to_vec).map_err(Clone::clone);
        self.inner.lock().file_attrs.push((node, kind, result));
    }
}
