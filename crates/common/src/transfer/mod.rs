//! Content transfers
//!
//! A [`Transfer`] moves one piece of content, identified by direction and
//! fingerprint, for every party that asked for it. The [`TransferEngine`]
//! queues transfers, hands a bounded number of them a [`TransferSlot`] per
//! direction, and runs their chunks through the transport.
//!
//! Content is encrypted with AES-128-CTR under the file key. Each chunk
//! carries its own CBC-MAC; the MACs, condensed in offset order, form the
//! meta-MAC stored in the file key and checked when a download completes.

pub mod chunk;
mod engine;
mod slot;

use std::collections::BTreeMap;
use std::path::PathBuf;

pub use engine::TransferEngine;
pub use slot::TransferSlot;

use crate::backoff::BackoffTimer;
use crate::crypto::{CryptoError, FileKey, BLOCK_SIZE};
use crate::fingerprint::FileFingerprint;
use crate::fs::FsError;
use crate::transport::TransportError;
use crate::types::{Direction, Ds, LocalId, NodeHandle, RequesterId, SyncId, TransferId};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("file error: {0}")]
    Fs(String),
    #[error("crypto error: {0}")]
    Crypto(String),
    #[error("integrity check failed: {0}")]
    Integrity(String),
    #[error("no progress before timeout")]
    Timeout,
    #[error("source changed during upload")]
    SourceChanged,
    #[error("no usable file key")]
    MissingKey,
}

impl From<FsError> for TransferError {
    fn from(e: FsError) -> Self {
        TransferError::Fs(e.to_string())
    }
}

impl From<CryptoError> for TransferError {
    fn from(e: CryptoError) -> Self {
        TransferError::Crypto(e.to_string())
    }
}

/// Who is waiting for a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequesterKind {
    /// Upload a local file of a sync; `path` is absolute
    SyncUpload {
        sync: SyncId,
        local: LocalId,
        path: PathBuf,
    },
    /// Download a node into a sync; `target` is absolute
    SyncDownload {
        sync: SyncId,
        node: NodeHandle,
        target: PathBuf,
    },
}

impl RequesterKind {
    pub fn sync(&self) -> SyncId {
        match self {
            RequesterKind::SyncUpload { sync, .. } | RequesterKind::SyncDownload { sync, .. } => {
                *sync
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requester {
    pub id: RequesterId,
    pub kind: RequesterKind,
}

/// What to transfer, for [`TransferEngine::enqueue`]
#[derive(Debug, Clone)]
pub struct TransferSpec {
    pub direction: Direction,
    pub fingerprint: FileFingerprint,
    pub size: i64,
    /// Source node of a download
    pub node: Option<NodeHandle>,
    /// File key of a download
    pub key: Option<FileKey>,
    /// Where a download is assembled before it is moved into place
    pub temp_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Transfer {
    pub id: TransferId,
    pub direction: Direction,
    pub fingerprint: FileFingerprint,
    pub size: i64,
    pub node: Option<NodeHandle>,
    pub requesters: Vec<Requester>,
    pub key: Option<FileKey>,
    /// chunk offset -> MAC of the chunk's plaintext
    pub chunk_macs: BTreeMap<u64, [u8; BLOCK_SIZE]>,
    pub failcount: u32,
    pub bt: BackoffTimer,
    pub temp_path: Option<PathBuf>,
    /// Completion token returned by the service for an upload
    pub token: Option<Vec<u8>>,
    /// The temporary file holds completed chunks from an earlier attempt
    pub resumable: bool,
}

impl Transfer {
    /// Source file of an upload
    pub fn source_path(&self) -> Option<&PathBuf> {
        self.requesters.iter().find_map(|r| match &r.kind {
            RequesterKind::SyncUpload { path, .. } => Some(path),
            _ => None,
        })
    }
}

/// Progress reports for the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Queued {
        id: TransferId,
        direction: Direction,
        size: i64,
    },
    Started {
        id: TransferId,
        direction: Direction,
    },
    Progress {
        id: TransferId,
        direction: Direction,
        done: u64,
        size: i64,
    },
    Completed {
        id: TransferId,
        direction: Direction,
    },
    /// `retry_in` is `None` once the transfer has been abandoned
    Failed {
        id: TransferId,
        direction: Direction,
        error: TransferError,
        retry_in: Option<Ds>,
    },
    Cancelled {
        id: TransferId,
        direction: Direction,
    },
}
