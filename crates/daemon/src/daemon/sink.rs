use std::path::Path;

use common::sink::AppSink;
use common::transfer::TransferEvent;
use common::types::{SyncId, SyncState, TreeState};

/// Reports engine callbacks through `tracing`
#[derive(Debug, Default)]
pub struct LogSink;

impl AppSink for LogSink {
    fn transfer_update(&mut self, event: &TransferEvent) {
        match event {
            TransferEvent::Completed { id, direction } => {
                tracing::info!(transfer = %id, direction = %direction, "transfer completed");
            }
            TransferEvent::Failed {
                id,
                direction,
                error,
                retry_in: Some(retry_in),
            } => {
                tracing::warn!(transfer = %id, direction = %direction, retry_in, "transfer failed: {}", error);
            }
            TransferEvent::Failed {
                id,
                direction,
                error,
                retry_in: None,
            } => {
                tracing::error!(transfer = %id, direction = %direction, "transfer abandoned: {}", error);
            }
            other => tracing::trace!(event = ?other, "transfer update"),
        }
    }

    fn sync_state_changed(&mut self, sync: SyncId, state: SyncState, reason: Option<&str>) {
        match state {
            SyncState::Failed => {
                tracing::error!(sync = %sync, reason = reason.unwrap_or("unknown"), "sync failed")
            }
            _ => tracing::info!(sync = %sync, state = ?state, "sync state changed"),
        }
    }

    fn tree_state_changed(&mut self, sync: SyncId, path: &Path, state: TreeState) {
        tracing::trace!(sync = %sync, path = ?path, state = ?state, "tree state changed");
    }
}
