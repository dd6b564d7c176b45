//! Application callbacks.
//!
//! Every method has an empty default so an embedder only implements what
//! it displays.

use std::path::Path;

use crate::fileattr::FileAttrError;
use crate::transfer::TransferEvent;
use crate::types::{NodeHandle, SyncId, SyncState, TreeState};

pub trait AppSink: Send {
    /// Nodes were added, changed or removed
    fn nodes_updated(&mut self, _nodes: &[NodeHandle]) {}

    fn transfer_update(&mut self, _event: &TransferEvent) {}

    fn sync_state_changed(&mut self, _sync: SyncId, _state: SyncState, _reason: Option<&str>) {}

    /// `path` is relative to the sync root
    fn tree_state_changed(&mut self, _sync: SyncId, _path: &Path, _state: TreeState) {}

    fn file_attribute(
        &mut self,
        _node: NodeHandle,
        _kind: u8,
        _result: Result<&[u8], &FileAttrError>,
    ) {
    }
}

/// Sink that ignores everything
#[derive(Debug, Default)]
pub struct NullSink;

impl AppSink for NullSink {}
