//! Request/response capability between the engine and the storage service.
//!
//! The transport is non-blocking: [`Transport::post`] hands a request over
//! and returns immediately, [`Transport::pump`] advances everything in flight
//! and reports completions. All types here describe the service's view of
//! the world; the engine translates them into its own graph.

use serde::{Deserialize, Serialize};

use crate::crypto::ShareEnvelope;
use crate::types::{Direction, NodeHandle, NodeType, RequestId, UserHandle};

/// Who a wrapped node key is encrypted for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyHolder {
    /// Wrapped under this account's master key
    User(UserHandle),
    /// Wrapped under the share key of this node
    Share(NodeHandle),
}

/// One wrapped copy of a node key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyEntry {
    pub holder: KeyHolder,
    pub wrapped: Vec<u8>,
}

/// How a share key reaches this account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShareKeyDelivery {
    /// AES-ECB wrapped under the master key
    Master(Vec<u8>),
    /// Sealed for the account's identity
    Sealed(ShareEnvelope),
}

/// Access granted to one account on a shared folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareRecord {
    pub user: UserHandle,
    pub access: i8,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteShare {
    pub key: ShareKeyDelivery,
    /// Set when this folder was shared *with* us
    pub incoming: bool,
    pub records: Vec<ShareRecord>,
}

/// A node as the service describes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    pub handle: NodeHandle,
    pub parent: Option<NodeHandle>,
    pub node_type: NodeType,
    pub size: i64,
    pub owner: UserHandle,
    pub ctime: i64,
    pub mtime: i64,
    pub keys: Vec<KeyEntry>,
    /// Encrypted attribute blob
    pub attrs: Vec<u8>,
    /// Descriptor of attached file attributes (thumbnails)
    pub file_attributes: String,
    pub share: Option<RemoteShare>,
}

/// Where the content of a node being created comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NewNodeSource {
    Folder,
    /// Completion token of a finished upload
    Upload { token: Vec<u8> },
    /// Reuse the content of an existing file node
    Copy { from: NodeHandle },
}

/// A node the engine asks the service to create.
///
/// `temp` is a client-chosen placeholder handle that lets nodes in the same
/// batch refer to each other as parents and lets the response be matched
/// back to the originating local entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNode {
    pub temp: NodeHandle,
    pub parent_temp: Option<NodeHandle>,
    pub node_type: NodeType,
    pub source: NewNodeSource,
    /// Node key wrapped under the master key
    pub key: Vec<u8>,
    pub attrs: Vec<u8>,
    pub mtime: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// Full tree snapshot
    FetchNodes,
    /// Changes since the cursor
    PollEvents { cursor: String },
    PutNodes {
        parent: NodeHandle,
        nodes: Vec<NewNode>,
    },
    Move {
        node: NodeHandle,
        parent: NodeHandle,
    },
    SetAttributes {
        node: NodeHandle,
        attrs: Vec<u8>,
    },
    Unlink {
        node: NodeHandle,
    },
    TransferUrl {
        direction: Direction,
        node: Option<NodeHandle>,
        size: i64,
    },
    UploadChunk {
        url: String,
        offset: u64,
        data: Vec<u8>,
    },
    DownloadChunk {
        url: String,
        offset: u64,
        len: u64,
    },
    FileAttributes {
        kind: u8,
        handles: Vec<NodeHandle>,
    },
}

impl Request {
    pub fn is_chunk(&self) -> bool {
        matches!(
            self,
            Request::UploadChunk { .. } | Request::DownloadChunk { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Nodes {
        nodes: Vec<RemoteNode>,
        cursor: String,
    },
    Events {
        events: Vec<ServerEvent>,
        cursor: String,
    },
    /// Created nodes, paired with the placeholder handle each replaced
    Created {
        nodes: Vec<(NodeHandle, RemoteNode)>,
    },
    Done,
    TransferUrl {
        url: String,
    },
    /// A stored upload chunk; the token appears once all content arrived
    ChunkStored {
        token: Option<Vec<u8>>,
    },
    ChunkData {
        data: Vec<u8>,
    },
    FileAttributes {
        data: Vec<u8>,
    },
}

/// A change pushed by the service, applied in delivery order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerEvent {
    NewNodes(Vec<RemoteNode>),
    AttributesUpdated {
        node: NodeHandle,
        attrs: Vec<u8>,
    },
    Moved {
        node: NodeHandle,
        parent: NodeHandle,
    },
    Deleted(NodeHandle),
    ShareKey {
        node: NodeHandle,
        key: ShareKeyDelivery,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("rate limited")]
    RateLimited,
    #[error("not found")]
    NotFound,
    #[error("access denied")]
    AccessDenied,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("cancelled")]
    Cancelled,
}

impl TransportError {
    /// Errors worth retrying with backoff
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout | TransportError::Network(_) | TransportError::RateLimited
        )
    }
}

/// Outcome of one posted request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub id: RequestId,
    pub result: Result<Response, TransportError>,
}

pub trait Transport: Send {
    fn post(&mut self, request: Request) -> RequestId;

    /// Abandon a request; it produces no completion afterwards
    fn cancel(&mut self, id: RequestId);

    /// Bytes sent or received so far for a request
    fn progress(&self, id: RequestId) -> u64;

    /// Advance in-flight requests without blocking
    fn pump(&mut self) -> Vec<Completion>;
}
