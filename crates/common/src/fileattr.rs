//! File attribute retrieval.
//!
//! Small encrypted blobs attached to file nodes (thumbnails, previews) are
//! fetched in batches, one channel per attribute kind. A response is a table
//! of 12-byte headers, `handle: u64 LE` and `offset: u32 LE`, followed by the
//! payloads. Each offset is where that node's payload starts; the first one
//! is also the size of the header table. A payload runs up to the next
//! offset, the last one to the end of the response.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bytes::Buf;

use crate::backoff::BackoffTimer;
use crate::crypto::BLOCK_SIZE;
use crate::node_graph::NodeGraph;
use crate::sink::AppSink;
use crate::transport::{Completion, Request, Response, Transport, TransportError};
use crate::types::{Ds, NodeHandle, RequestId};

const HEADER_SIZE: usize = 12;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FileAttrError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("node {0} has no usable key")]
    MissingKey(NodeHandle),
    #[error("no attribute returned for node {0}")]
    NotReturned(NodeHandle),
}

/// Split a response into `(handle, encrypted payload)` pairs
pub fn parse_response(data: &[u8]) -> Result<Vec<(NodeHandle, Vec<u8>)>, FileAttrError> {
    if data.is_empty() {
        return Ok(Vec::new());
    }
    if data.len() < HEADER_SIZE {
        return Err(FileAttrError::Malformed("truncated header".to_string()));
    }

    let mut headers = Vec::new();
    let mut cursor = data;
    let mut table_end = usize::MAX;
    while headers.len() * HEADER_SIZE < table_end {
        if cursor.remaining() < HEADER_SIZE {
            return Err(FileAttrError::Malformed(
                "header table exceeds response".to_string(),
            ));
        }
        let handle = cursor.get_u64_le();
        let offset = cursor.get_u32_le() as usize;
        if headers.is_empty() {
            if offset % HEADER_SIZE != 0 || offset == 0 || offset > data.len() {
                return Err(FileAttrError::Malformed(format!(
                    "header table of {} bytes in a {} byte response",
                    offset,
                    data.len()
                )));
            }
            table_end = offset;
        }
        headers.push((NodeHandle::from_u64(handle), offset));
    }

    let mut out = Vec::with_capacity(headers.len());
    for (i, (handle, start)) in headers.iter().enumerate() {
        let end = headers
            .get(i + 1)
            .map(|(_, next)| *next)
            .unwrap_or(data.len());
        if *start < table_end || end < *start || end > data.len() {
            return Err(FileAttrError::Malformed(format!(
                "payload of {} out of bounds",
                handle
            )));
        }
        let payload = &data[*start..end];
        if payload.len() % BLOCK_SIZE != 0 {
            return Err(FileAttrError::Malformed(format!(
                "payload of {} is not block aligned",
                handle
            )));
        }
        out.push((*handle, payload.to_vec()));
    }
    Ok(out)
}

/// Build a response in the same layout; used by the loopback service
pub fn encode_response(entries: &[(NodeHandle, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut offset = entries.len() * HEADER_SIZE;
    for (handle, payload) in entries {
        out.extend_from_slice(&handle.as_u64().to_le_bytes());
        out.extend_from_slice(&(offset as u32).to_le_bytes());
        offset += payload.len();
    }
    for (_, payload) in entries {
        out.extend_from_slice(payload);
    }
    out
}

#[derive(Debug, Default)]
struct Channel {
    pending: BTreeSet<NodeHandle>,
    inflight: Option<(RequestId, Vec<NodeHandle>)>,
    bt: BackoffTimer,
}

/// Batched fetchers, one per attribute kind
#[derive(Debug)]
pub struct FileAttrChannels {
    channels: BTreeMap<u8, Channel>,
    requests: HashMap<RequestId, u8>,
    batch: usize,
    backoff_cap: Ds,
}

impl FileAttrChannels {
    pub fn new(batch: usize, backoff_cap: Ds) -> Self {
        Self {
            channels: BTreeMap::new(),
            requests: HashMap::new(),
            batch: batch.max(1),
            backoff_cap,
        }
    }

    pub fn request(&mut self, node: NodeHandle, kind: u8) {
        let cap = self.backoff_cap;
        self.channels
            .entry(kind)
            .or_insert_with(|| Channel {
                bt: BackoffTimer::new(cap),
                ..Channel::default()
            })
            .pending
            .insert(node);
    }

    pub fn owns(&self, request: &RequestId) -> bool {
        self.requests.contains_key(request)
    }

    pub fn is_idle(&self) -> bool {
        self.channels
            .values()
            .all(|c| c.pending.is_empty() && c.inflight.is_none())
    }

    /// Post one batch per ready channel
    pub fn dispatch(&mut self, now: Ds, transport: &mut dyn Transport) {
        for (kind, channel) in self.channels.iter_mut() {
            if channel.inflight.is_some() || channel.pending.is_empty() || !channel.bt.armed(now) {
                continue;
            }
            let handles: Vec<NodeHandle> = channel.pending.iter().take(self.batch).copied().collect();
            for handle in &handles {
                channel.pending.remove(handle);
            }
            let request = transport.post(Request::FileAttributes {
                kind: *kind,
                handles: handles.clone(),
            });
            tracing::debug!(kind = *kind, count = handles.len(), "fetching file attributes");
            channel.inflight = Some((request, handles));
            self.requests.insert(request, *kind);
        }
    }

    /// Handle a completion; returns `false` for foreign requests
    pub fn on_completion(
        &mut self,
        completion: Completion,
        now: Ds,
        graph: &NodeGraph,
        sink: &mut dyn AppSink,
    ) -> bool {
        let Some(kind) = self.requests.remove(&completion.id) else {
            return false;
        };
        let Some(channel) = self.channels.get_mut(&kind) else {
            return true;
        };
        let Some((_, handles)) = channel.inflight.take() else {
            return true;
        };

        let entries = match completion.result {
            Ok(Response::FileAttributes { data }) => parse_response(&data),
            Ok(_) => Err(FileAttrError::Malformed("unexpected response".to_string())),
            Err(e) if e.is_transient() => {
                channel.bt.backoff(now);
                tracing::debug!(kind, retry_in = channel.bt.retry_in(now), "file attribute fetch failed: {}", e);
                channel.pending.extend(handles);
                return true;
            }
            Err(e) => Err(e.into()),
        };

        let entries = match entries {
            Ok(entries) => entries,
            Err(e) => {
                channel.bt.backoff(now);
                tracing::warn!(kind, "file attribute response rejected: {}", e);
                for handle in handles {
                    sink.file_attribute(handle, kind, Err(&e));
                }
                return true;
            }
        };
        channel.bt.reset();

        let mut answered = BTreeSet::new();
        for (handle, mut payload) in entries {
            if !handles.contains(&handle) || !answered.insert(handle) {
                continue;
            }
            let key = graph.get(&handle).and_then(|node| node.attr_key());
            let result = match key {
                Some(key) => key
                    .cbc_decrypt(&mut payload)
                    .map_err(|e| FileAttrError::Malformed(e.to_string())),
                None => Err(FileAttrError::MissingKey(handle)),
            };
            match result {
                Ok(()) => sink.file_attribute(handle, kind, Ok(payload.as_slice())),
                Err(e) => sink.file_attribute(handle, kind, Err(&e)),
            }
        }
        for handle in handles.into_iter().filter(|h| !answered.contains(h)) {
            sink.file_attribute(handle, kind, Err(&FileAttrError::NotReturned(handle)));
        }
        true
    }

    pub fn next_wakeup(&self, wake_at: &mut Option<Ds>) {
        for channel in self.channels.values() {
            if !channel.pending.is_empty() && channel.inflight.is_none() {
                channel.bt.update(wake_at);
            }
        }
    }
}
