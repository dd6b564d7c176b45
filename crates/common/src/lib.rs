/**
 * Identifiers, node kinds and the decisecond
 *  clock unit shared by every other module.
 */
pub mod types;
/**
 * Bounded little-endian readers and writers
 *  for the persisted record formats.
 */
pub mod codec;
pub mod backoff;
pub mod clock;
pub mod config;
/**
 * Cryptographic types and operations.
 *  - Per-node keys and the account key ring
 *  - Attribute blobs, content and chunk MACs
 *  - Share key delivery to an identity key
 */
pub mod crypto;
pub mod fingerprint;
/**
 * Capabilities the engine is built on.
 *  The local filesystem, the remote service,
 *  the record store and application callbacks
 *  are all traits so that tests and the daemon
 *  can plug in their own.
 */
pub mod fs;
pub mod persistence;
pub mod sink;
pub mod transport;
/**
 * In-memory mirror of the remote tree.
 *  Handles parent links, pending keys and
 *  the node record cache.
 */
pub mod node_graph;
/**
 * In-memory mirror of each synced local folder.
 */
pub mod local_tree;
pub mod bindings;
/**
 * Chunked, encrypted uploads and downloads
 *  with per-direction slot limits and
 *  retry scheduling.
 */
pub mod transfer;
pub mod fileattr;
/**
 * Two-way reconciliation between one local
 *  folder and one remote folder.
 */
pub mod sync;
/**
 * The engine coordinator driving every sync,
 *  transfer and request from a single thread.
 */
pub mod client;
/**
 * A complete in-process stand-in for the
 *  remote service, used by the daemon's
 *  offline mode and by the tests.
 */
pub mod loopback;
pub mod testkit;

pub mod prelude {
    pub use crate::client::{Client, ClientError};
    pub use crate::clock::{Clock, ManualClock, SystemClock};
    pub use crate::config::EngineConfig;
    pub use crate::crypto::KeyRing;
    pub use crate::fs::{FileSystem, FsError, FsNotification};
    pub use crate::loopback::{LoopbackService, LoopbackTransport};
    pub use crate::persistence::{MemoryStateStore, StateStore};
    pub use crate::sink::{AppSink, NullSink};
    pub use crate::transport::Transport;
    pub use crate::types::{Direction, Ds, NodeHandle, NodeType, SyncId, SyncState, TreeState, UserHandle};
}
