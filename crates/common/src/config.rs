use serde::{Deserialize, Serialize};

use crate::backoff::DEFAULT_BACKOFF_CAP;
use crate::types::Ds;

/// Policy values of a [`crate::client::Client`].
///
/// Everything here is tunable; the defaults are what a desktop client runs with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent upload slots
    pub max_uploads: usize,
    /// Concurrent download slots
    pub max_downloads: usize,
    /// Keep dispatching while less than this many bytes remain in active slots
    pub min_pipeline: u64,
    /// Chunk requests in flight per slot
    pub connections_per_slot: usize,
    /// Attempts per chunk before the whole transfer fails
    pub chunk_retry_limit: u32,
    /// Failed attempts before a transfer is abandoned
    pub max_transfer_failures: u32,
    pub backoff_cap: Ds,
    /// A slot without any progress for this long is failed
    pub transfer_timeout: Ds,
    /// Quiet period after a local change before uploading
    pub upload_nagle: Ds,
    /// Delay between a notification and checking the path
    pub scan_delay: Ds,
    /// Retry delay for locked or transiently unreadable entries
    pub lock_retry: Ds,
    /// Folder below the rubbish root receiving superseded remote nodes
    pub debris_folder: String,
    /// Folder below each sync root receiving superseded local files
    pub local_debris: String,
    /// Paths checked per sync per step
    pub scan_budget: usize,
    /// Handles per file attribute request
    pub fileattr_batch: usize,
    /// Pause between event polls that returned nothing
    pub poll_interval: Ds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_uploads: 4,
            max_downloads: 4,
            min_pipeline: 65536,
            connections_per_slot: 4,
            chunk_retry_limit: 3,
            max_transfer_failures: 16,
            backoff_cap: DEFAULT_BACKOFF_CAP,
            transfer_timeout: 600,
            upload_nagle: 11,
            scan_delay: 3,
            lock_retry: 50,
            debris_folder: "SyncDebris".to_string(),
            local_debris: ".debris".to_string(),
            scan_budget: 256,
            fileattr_batch: 32,
            poll_interval: 10,
        }
    }
}

impl EngineConfig {
    pub fn max_slots(&self, direction: crate::types::Direction) -> usize {
        match direction {
            crate::types::Direction::Get => self.max_downloads,
            crate::types::Direction::Put => self.max_uploads,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"max_uploads": 1}"#).unwrap();
        assert_eq!(config.max_uploads, 1);
        assert_eq!(config.max_downloads, 4);
        assert_eq!(config.debris_folder, "SyncDebris");
    }
}
