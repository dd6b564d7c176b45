use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::crypto::{SymmKey, BLOCK_SIZE};
use crate::fs::FileHandle;
use crate::transport::Transport;
use crate::types::{Ds, RequestId, TransferId};

/// A chunk request on the wire
#[derive(Debug, Clone)]
pub(crate) struct InflightChunk {
    pub request: RequestId,
    pub end: u64,
    /// MAC of the plaintext, known up front for uploads
    pub mac: Option<[u8; BLOCK_SIZE]>,
}

/// Execution context of one active transfer.
///
/// The slot owns the open file and every chunk tracker referring to it;
/// [`TransferSlot::release`] clears the trackers before the file is closed.
pub struct TransferSlot {
    pub(crate) transfer: TransferId,
    pub(crate) url_request: Option<RequestId>,
    pub(crate) url: Option<String>,
    pub(crate) file: Option<Box<dyn FileHandle>>,
    pub(crate) cipher: Option<SymmKey>,
    pub(crate) inflight: BTreeMap<u64, InflightChunk>,
    /// Failed chunks waiting to be sent again
    pub(crate) retry: BTreeSet<u64>,
    pub(crate) attempts: HashMap<u64, u32>,
    pub(crate) next_pos: u64,
    pub(crate) sent_empty: bool,
    pub(crate) done: u64,
    pub(crate) last_activity: Ds,
}

impl std::fmt::Debug for TransferSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferSlot")
            .field("transfer", &self.transfer)
            .field("url", &self.url)
            .field("open", &self.file.is_some())
            .field("inflight", &self.inflight.len())
            .field("next_pos", &self.next_pos)
            .field("done", &self.done)
            .finish()
    }
}

impl TransferSlot {
    pub(crate) fn new(transfer: TransferId, url_request: RequestId, now: Ds) -> Self {
        Self {
            transfer,
            url_request: Some(url_request),
            url: None,
            file: None,
            cipher: None,
            inflight: BTreeMap::new(),
            retry: BTreeSet::new(),
            attempts: HashMap::new(),
            next_pos: 0,
            sent_empty: false,
            done: 0,
            last_activity: now,
        }
    }

    /// Requests owned by this slot
    pub(crate) fn requests(&self) -> Vec<RequestId> {
        self.url_request
            .into_iter()
            .chain(self.inflight.values().map(|chunk| chunk.request))
            .collect()
    }

    pub(crate) fn running(&self) -> bool {
        self.url.is_some() && self.file.is_some()
    }

    /// Cancel every request, drop the chunk trackers, then close the file.
    /// Returns the cancelled request ids.
    pub(crate) fn release(&mut self, transport: &mut dyn Transport) -> Vec<RequestId> {
        let requests = self.requests();
        for request in &requests {
            transport.cancel(*request);
        }
        self.url_request = None;
        self.inflight.clear();
        self.retry.clear();
        self.file = None;
        requests
    }
}
