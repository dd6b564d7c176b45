use std::collections::{BTreeMap, HashMap, HashSet};

use super::chunk::{chunk_ceil, contiguous_end};
use super::slot::{InflightChunk, TransferSlot};
use super::{Requester, RequesterKind, Transfer, TransferError, TransferEvent, TransferSpec};
use crate::backoff::BackoffTimer;
use crate::config::EngineConfig;
use crate::crypto::FileKey;
use crate::fingerprint::FileFingerprint;
use crate::fs::{FileHandle, FileSystem};
use crate::transport::{Completion, Request, Response, Transport};
use crate::types::{Direction, Ds, RequestId, RequesterId, TransferId};

/// How a chunk response went wrong
enum ChunkError {
    /// Only this chunk is affected; send it again
    Retry(TransferError),
    /// The slot cannot continue
    Fatal(TransferError),
}

impl From<crate::crypto::CryptoError> for ChunkError {
    fn from(e: crate::crypto::CryptoError) -> Self {
        ChunkError::Fatal(e.into())
    }
}

/// Queue and slot pool for content transfers.
///
/// Transfers are deduplicated by direction and fingerprint. Dispatch is
/// FIFO per direction, bounded by the per-direction slot cap, and keeps
/// adding slots only while the bytes left in active slots are below the
/// pipeline minimum.
#[derive(Debug)]
pub struct TransferEngine {
    config: EngineConfig,
    transfers: BTreeMap<TransferId, Transfer>,
    index: HashMap<(Direction, FileFingerprint), TransferId>,
    slots: BTreeMap<TransferId, TransferSlot>,
    requests: HashMap<RequestId, TransferId>,
    paused: HashSet<Direction>,
    next_transfer: u64,
    next_requester: u64,
    completed: Vec<Transfer>,
    abandoned: Vec<Transfer>,
    events: Vec<TransferEvent>,
}

impl TransferEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            transfers: BTreeMap::new(),
            index: HashMap::new(),
            slots: BTreeMap::new(),
            requests: HashMap::new(),
            paused: HashSet::new(),
            next_transfer: 1,
            next_requester: 1,
            completed: Vec::new(),
            abandoned: Vec::new(),
            events: Vec::new(),
        }
    }

    /* Getters */

    pub fn get(&self, id: &TransferId) -> Option<&Transfer> {
        self.transfers.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Transfer> {
        self.transfers.values()
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty() && self.completed.is_empty()
    }

    pub fn slot(&self, id: &TransferId) -> Option<&TransferSlot> {
        self.slots.get(id)
    }

    /// Transfers holding a slot in `direction`
    pub fn active(&self, direction: Direction) -> usize {
        self.slots
            .keys()
            .filter(|id| self.direction_of(id) == Some(direction))
            .count()
    }

    /// Transfers waiting for a slot in `direction`
    pub fn queued(&self, direction: Direction) -> usize {
        self.transfers
            .values()
            .filter(|t| t.direction == direction && !self.slots.contains_key(&t.id))
            .count()
    }

    pub fn owns(&self, request: &RequestId) -> bool {
        self.requests.contains_key(request)
    }

    pub fn is_paused(&self, direction: Direction) -> bool {
        self.paused.contains(&direction)
    }

    fn direction_of(&self, id: &TransferId) -> Option<Direction> {
        self.transfers.get(id).map(|t| t.direction)
    }

    /* Queue */

    /// Attach a requester to the transfer for this content, creating it if needed
    pub fn enqueue(&mut self, spec: TransferSpec, kind: RequesterKind) -> (TransferId, RequesterId) {
        let requester = Requester {
            id: RequesterId(self.next_requester),
            kind,
        };
        self.next_requester += 1;
        let requester_id = requester.id;

        if let Some(id) = self.index.get(&(spec.direction, spec.fingerprint)).copied() {
            if let Some(transfer) = self.transfers.get_mut(&id) {
                tracing::debug!(transfer = %id, requester = %requester_id, "joining existing transfer");
                transfer.requesters.push(requester);
                return (id, requester_id);
            }
        }

        let id = TransferId(self.next_transfer);
        self.next_transfer += 1;
        let transfer = Transfer {
            id,
            direction: spec.direction,
            fingerprint: spec.fingerprint,
            size: spec.size,
            node: spec.node,
            requesters: vec![requester],
            key: spec.key,
            chunk_macs: BTreeMap::new(),
            failcount: 0,
            bt: BackoffTimer::new(self.config.backoff_cap),
            temp_path: spec.temp_path,
            token: None,
            resumable: false,
        };
        tracing::info!(transfer = %id, direction = %spec.direction, size = spec.size, "transfer queued");
        self.events.push(TransferEvent::Queued {
            id,
            direction: spec.direction,
            size: spec.size,
        });
        self.index.insert((spec.direction, spec.fingerprint), id);
        self.transfers.insert(id, transfer);
        (id, requester_id)
    }

    /// Detach a requester; the transfer is cancelled once nobody is left.
    /// Returns the cancelled transfer, if any.
    pub fn remove_requester(
        &mut self,
        requester: RequesterId,
        transport: &mut dyn Transport,
        fs: &dyn FileSystem,
    ) -> Option<TransferId> {
        self.remove_requesters(|r| r.id == requester, transport, fs)
            .into_iter()
            .next()
    }

    /// Detach every matching requester; returns the transfers that were cancelled
    pub fn remove_requesters(
        &mut self,
        mut matches: impl FnMut(&Requester) -> bool,
        transport: &mut dyn Transport,
        fs: &dyn FileSystem,
    ) -> Vec<TransferId> {
        let mut emptied = Vec::new();
        for transfer in self.transfers.values_mut() {
            let before = transfer.requesters.len();
            transfer.requesters.retain(|r| !matches(r));
            if before != transfer.requesters.len() && transfer.requesters.is_empty() {
                emptied.push(transfer.id);
            }
        }
        for transfer in self.completed.iter_mut() {
            transfer.requesters.retain(|r| !matches(r));
        }
        for id in &emptied {
            self.cancel(id, transport, fs);
        }
        emptied
    }

    /// Stop a transfer, release its slot and discard partial content
    pub fn cancel(
        &mut self,
        id: &TransferId,
        transport: &mut dyn Transport,
        fs: &dyn FileSystem,
    ) -> Option<Transfer> {
        self.release_slot(id, transport);
        let transfer = self.transfers.remove(id)?;
        self.unindex(&transfer);
        Self::discard_temp(&transfer, fs);
        tracing::info!(transfer = %id, direction = %transfer.direction, "transfer cancelled");
        self.events.push(TransferEvent::Cancelled {
            id: *id,
            direction: transfer.direction,
        });
        Some(transfer)
    }

    pub fn set_paused(&mut self, direction: Direction, paused: bool) {
        if paused {
            self.paused.insert(direction);
        } else {
            self.paused.remove(&direction);
        }
    }

    fn unindex(&mut self, transfer: &Transfer) {
        let key = (transfer.direction, transfer.fingerprint);
        if self.index.get(&key) == Some(&transfer.id) {
            self.index.remove(&key);
        }
    }

    fn release_slot(&mut self, id: &TransferId, transport: &mut dyn Transport) {
        if let Some(mut slot) = self.slots.remove(id) {
            for request in slot.release(transport) {
                self.requests.remove(&request);
            }
        }
    }

    fn discard_temp(transfer: &Transfer, fs: &dyn FileSystem) {
        if transfer.direction != Direction::Get {
            return;
        }
        if let Some(path) = &transfer.temp_path {
            if let Err(e) = fs.remove_file(path) {
                if !e.is_not_found() {
                    tracing::debug!(transfer = %transfer.id, "could not remove temporary file: {}", e);
                }
            }
        }
    }

    /* Scheduling */

    /// Hand free slots to eligible queued transfers
    pub fn dispatch(&mut self, now: Ds, transport: &mut dyn Transport, fs: &dyn FileSystem) {
        for direction in Direction::ALL {
            if self.paused.contains(&direction) {
                continue;
            }
            loop {
                let active: Vec<TransferId> = self
                    .slots
                    .keys()
                    .filter(|id| self.direction_of(id) == Some(direction))
                    .copied()
                    .collect();
                if active.len() >= self.config.max_slots(direction) {
                    break;
                }
                let pipeline: u64 = active
                    .iter()
                    .filter_map(|id| {
                        let size = self.transfers.get(id)?.size.max(0) as u64;
                        let done = self.slots.get(id)?.done;
                        Some(size.saturating_sub(done))
                    })
                    .sum();
                if !active.is_empty() && pipeline >= self.config.min_pipeline {
                    break;
                }
                let next = self
                    .transfers
                    .values()
                    .find(|t| {
                        t.direction == direction && !self.slots.contains_key(&t.id) && t.bt.armed(now)
                    })
                    .map(|t| t.id);
                let Some(id) = next else {
                    break;
                };
                self.start(id, now, transport, fs);
            }
        }
    }

    fn start(&mut self, id: TransferId, now: Ds, transport: &mut dyn Transport, fs: &dyn FileSystem) {
        let Some(transfer) = self.transfers.get_mut(&id) else {
            return;
        };
        if transfer.key.is_none() && transfer.direction == Direction::Put {
            match FileKey::generate() {
                Ok(key) => transfer.key = Some(key),
                Err(e) => {
                    self.fail(&id, e.into(), now, transport, fs);
                    return;
                }
            }
        }
        let request = transport.post(Request::TransferUrl {
            direction: transfer.direction,
            node: transfer.node,
            size: transfer.size,
        });
        tracing::debug!(transfer = %id, direction = %transfer.direction, "slot assigned");
        self.events.push(TransferEvent::Started {
            id,
            direction: transfer.direction,
        });
        self.requests.insert(request, id);
        self.slots.insert(id, TransferSlot::new(id, request, now));
    }

    /// Keep every running slot's connections busy
    pub fn do_io(&mut self, now: Ds, transport: &mut dyn Transport, fs: &dyn FileSystem) {
        let ids: Vec<TransferId> = self.slots.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.fill_slot(&id, transport) {
                self.fail(&id, e, now, transport, fs);
                continue;
            }
            self.check_complete(&id, now, transport, fs);
        }
    }

    fn fill_slot(&mut self, id: &TransferId, transport: &mut dyn Transport) -> Result<(), TransferError> {
        let (Some(transfer), Some(slot)) = (self.transfers.get_mut(id), self.slots.get_mut(id)) else {
            return Ok(());
        };
        if !slot.running() {
            return Ok(());
        }
        let size = transfer.size.max(0) as u64;
        let key = transfer.key.ok_or(TransferError::MissingKey)?;
        let url = slot.url.clone().unwrap_or_default();

        while slot.inflight.len() < self.config.connections_per_slot {
            let offset = if let Some(offset) = slot.retry.pop_first() {
                offset
            } else if slot.next_pos < size {
                let offset = slot.next_pos;
                slot.next_pos = chunk_ceil(offset).min(size);
                offset
            } else if size == 0 && transfer.direction == Direction::Put && !slot.sent_empty {
                slot.sent_empty = true;
                0
            } else {
                break;
            };
            let end = chunk_ceil(offset).min(size);

            let (request, mac) = match transfer.direction {
                Direction::Put => {
                    let (Some(file), Some(cipher)) = (slot.file.as_mut(), slot.cipher.as_ref()) else {
                        return Ok(());
                    };
                    let mut data = vec![0u8; (end - offset) as usize];
                    read_exact_at(&mut **file, offset, &mut data)?;
                    let mac = cipher.chunk_mac(&data, key.nonce);
                    cipher.ctr_crypt(&mut data, key.nonce, offset)?;
                    let request = transport.post(Request::UploadChunk {
                        url: url.clone(),
                        offset,
                        data,
                    });
                    (request, Some(mac))
                }
                Direction::Get => {
                    let request = transport.post(Request::DownloadChunk {
                        url: url.clone(),
                        offset,
                        len: end - offset,
                    });
                    (request, None)
                }
            };
            slot.inflight.insert(offset, InflightChunk { request, end, mac });
            self.requests.insert(request, *id);
        }
        Ok(())
    }

    /// Route a transport completion; returns `false` for requests the engine does not own
    pub fn on_completion(
        &mut self,
        completion: Completion,
        now: Ds,
        transport: &mut dyn Transport,
        fs: &dyn FileSystem,
    ) -> bool {
        let Some(id) = self.requests.remove(&completion.id) else {
            return false;
        };
        let Some(slot) = self.slots.get_mut(&id) else {
            return true;
        };
        slot.last_activity = now;

        if slot.url_request == Some(completion.id) {
            slot.url_request = None;
            let result = match completion.result {
                Ok(Response::TransferUrl { url }) => self.open(&id, url, fs),
                Ok(_) => Err(TransferError::Integrity("unexpected response to url request".to_string())),
                Err(e) => Err(e.into()),
            };
            match result {
                Ok(()) => {
                    if let Err(e) = self.fill_slot(&id, transport) {
                        self.fail(&id, e, now, transport, fs);
                        return true;
                    }
                }
                Err(e) => {
                    self.fail(&id, e, now, transport, fs);
                    return true;
                }
            }
            self.check_complete(&id, now, transport, fs);
            return true;
        }

        let Some(offset) = slot
            .inflight
            .iter()
            .find(|(_, chunk)| chunk.request == completion.id)
            .map(|(offset, _)| *offset)
        else {
            return true;
        };
        let Some(chunk) = slot.inflight.remove(&offset) else {
            return true;
        };

        let outcome = match completion.result {
            Ok(response) => self.chunk_done(&id, offset, chunk, response),
            Err(e) => Err(ChunkError::Retry(e.into())),
        };
        match outcome {
            Ok(()) => {}
            Err(ChunkError::Retry(e)) => {
                if !self.chunk_failed(&id, offset, &e) {
                    self.fail(&id, e, now, transport, fs);
                    return true;
                }
            }
            Err(ChunkError::Fatal(e)) => {
                self.fail(&id, e, now, transport, fs);
                return true;
            }
        }
        if let Err(e) = self.fill_slot(&id, transport) {
            self.fail(&id, e, now, transport, fs);
            return true;
        }
        self.check_complete(&id, now, transport, fs);
        true
    }

    fn open(&mut self, id: &TransferId, url: String, fs: &dyn FileSystem) -> Result<(), TransferError> {
        let (Some(transfer), Some(slot)) = (self.transfers.get_mut(id), self.slots.get_mut(id)) else {
            return Ok(());
        };
        let key = transfer.key.ok_or(TransferError::MissingKey)?;
        let size = transfer.size.max(0) as u64;
        let file = match transfer.direction {
            Direction::Put => {
                let path = transfer
                    .source_path()
                    .ok_or_else(|| TransferError::Fs("upload without a source".to_string()))?;
                let file = fs.open_read(path)?;
                if file.size() != transfer.size {
                    return Err(TransferError::SourceChanged);
                }
                transfer.chunk_macs.clear();
                transfer.token = None;
                file
            }
            Direction::Get => {
                let path = transfer
                    .temp_path
                    .as_ref()
                    .ok_or_else(|| TransferError::Fs("download without a target".to_string()))?;
                if transfer.resumable {
                    fs.open_write(path)?
                } else {
                    transfer.chunk_macs.clear();
                    fs.create(path)?
                }
            }
        };

        if transfer.direction == Direction::Get {
            slot.next_pos = contiguous_end(&transfer.chunk_macs, size);
            let resume_at = slot.next_pos;
            transfer.chunk_macs.retain(|offset, _| *offset < resume_at);
            slot.done = resume_at;
            if resume_at > 0 {
                tracing::debug!(transfer = %id, offset = resume_at, "resuming download");
            }
        }
        slot.url = Some(url);
        slot.file = Some(file);
        slot.cipher = Some(key.cipher());
        Ok(())
    }

    fn chunk_done(
        &mut self,
        id: &TransferId,
        offset: u64,
        chunk: InflightChunk,
        response: Response,
    ) -> Result<(), ChunkError> {
        let (Some(transfer), Some(slot)) = (self.transfers.get_mut(id), self.slots.get_mut(id)) else {
            return Ok(());
        };
        let len = chunk.end - offset;
        match (transfer.direction, response) {
            (Direction::Put, Response::ChunkStored { token }) => {
                if len > 0 {
                    let mac = chunk.mac.ok_or_else(|| {
                        ChunkError::Fatal(TransferError::Integrity("chunk without mac".to_string()))
                    })?;
                    transfer.chunk_macs.insert(offset, mac);
                }
                if token.is_some() {
                    transfer.token = token;
                }
            }
            (Direction::Get, Response::ChunkData { data }) => {
                if data.len() as u64 != len {
                    return Err(ChunkError::Retry(TransferError::Integrity(format!(
                        "chunk at {} has {} bytes, expected {}",
                        offset,
                        data.len(),
                        len
                    ))));
                }
                let key = transfer.key.ok_or(ChunkError::Fatal(TransferError::MissingKey))?;
                let (Some(file), Some(cipher)) = (slot.file.as_mut(), slot.cipher.as_ref()) else {
                    return Ok(());
                };
                let mut plain = data;
                cipher.ctr_crypt(&mut plain, key.nonce, offset)?;
                let mac = cipher.chunk_mac(&plain, key.nonce);
                file.write_at(offset, &plain)
                    .map_err(|e| ChunkError::Fatal(e.into()))?;
                transfer.chunk_macs.insert(offset, mac);
            }
            _ => {
                return Err(ChunkError::Retry(TransferError::Integrity(
                    "unexpected response to chunk request".to_string(),
                )))
            }
        }
        slot.done += len;
        self.events.push(TransferEvent::Progress {
            id: *id,
            direction: transfer.direction,
            done: slot.done,
            size: transfer.size,
        });
        Ok(())
    }

    /// Count a failed chunk; returns `false` once it exhausted its retries
    fn chunk_failed(&mut self, id: &TransferId, offset: u64, error: &TransferError) -> bool {
        let Some(slot) = self.slots.get_mut(id) else {
            return true;
        };
        let attempts = slot.attempts.entry(offset).or_insert(0);
        *attempts += 1;
        if *attempts > self.config.chunk_retry_limit {
            return false;
        }
        tracing::debug!(transfer = %id, offset, attempt = *attempts, "retrying chunk: {}", error);
        slot.retry.insert(offset);
        true
    }

    fn check_complete(&mut self, id: &TransferId, now: Ds, transport: &mut dyn Transport, fs: &dyn FileSystem) {
        let (Some(transfer), Some(slot)) = (self.transfers.get_mut(id), self.slots.get_mut(id)) else {
            return;
        };
        if !slot.running() || !slot.inflight.is_empty() || !slot.retry.is_empty() {
            return;
        }
        let size = transfer.size.max(0) as u64;
        if slot.next_pos < size {
            return;
        }
        let Some(cipher) = slot.cipher.clone() else {
            return;
        };
        match transfer.direction {
            Direction::Put => {
                if size == 0 && !slot.sent_empty {
                    return;
                }
                if transfer.token.is_none() {
                    let error = TransferError::Integrity("no completion token".to_string());
                    self.fail(id, error, now, transport, fs);
                    return;
                }
                if let Some(key) = transfer.key.as_mut() {
                    key.meta_mac = cipher.condense_macs(transfer.chunk_macs.values());
                }
            }
            Direction::Get => {
                let expected = transfer.key.map(|k| k.meta_mac);
                let actual = cipher.condense_macs(transfer.chunk_macs.values());
                if expected != Some(actual) {
                    transfer.chunk_macs.clear();
                    transfer.resumable = false;
                    let error = TransferError::Integrity("meta-MAC mismatch".to_string());
                    self.fail(id, error, now, transport, fs);
                    return;
                }
            }
        }

        self.release_slot(id, transport);
        let Some(transfer) = self.transfers.remove(id) else {
            return;
        };
        self.unindex(&transfer);
        tracing::info!(transfer = %id, direction = %transfer.direction, "transfer finished");
        self.events.push(TransferEvent::Completed {
            id: *id,
            direction: transfer.direction,
        });
        self.completed.push(transfer);
    }

    /// Fail the current attempt: back off and requeue, or abandon after too many failures
    pub fn fail(
        &mut self,
        id: &TransferId,
        error: TransferError,
        now: Ds,
        transport: &mut dyn Transport,
        fs: &dyn FileSystem,
    ) {
        self.release_slot(id, transport);
        let Some(transfer) = self.transfers.get_mut(id) else {
            return;
        };
        transfer.failcount += 1;
        match transfer.direction {
            Direction::Put => {
                transfer.chunk_macs.clear();
                transfer.token = None;
            }
            Direction::Get => transfer.resumable = !transfer.chunk_macs.is_empty(),
        }

        if transfer.failcount >= self.config.max_transfer_failures {
            tracing::warn!(transfer = %id, failures = transfer.failcount, "abandoning transfer: {}", error);
            let direction = transfer.direction;
            if let Some(transfer) = self.transfers.remove(id) {
                self.unindex(&transfer);
                Self::discard_temp(&transfer, fs);
                self.abandoned.push(transfer);
            }
            self.events.push(TransferEvent::Failed {
                id: *id,
                direction,
                error,
                retry_in: None,
            });
            return;
        }

        transfer.bt.backoff(now);
        let retry_in = transfer.bt.retry_in(now);
        tracing::warn!(transfer = %id, retry_in, "transfer attempt failed: {}", error);
        self.events.push(TransferEvent::Failed {
            id: *id,
            direction: transfer.direction,
            error,
            retry_in: Some(retry_in),
        });
    }

    /// Put back a finished transfer whose result could not be used
    pub fn retry_completed(
        &mut self,
        mut transfer: Transfer,
        error: TransferError,
        now: Ds,
        fs: &dyn FileSystem,
    ) {
        let id = transfer.id;
        transfer.failcount += 1;
        transfer.chunk_macs.clear();
        transfer.token = None;
        transfer.resumable = false;
        if transfer.failcount >= self.config.max_transfer_failures || transfer.requesters.is_empty() {
            tracing::warn!(transfer = %id, "dropping finished transfer: {}", error);
            Self::discard_temp(&transfer, fs);
            self.events.push(TransferEvent::Failed {
                id,
                direction: transfer.direction,
                error,
                retry_in: None,
            });
            self.abandoned.push(transfer);
            return;
        }
        if let Some(key) = transfer.key.as_mut() {
            if transfer.direction == Direction::Put {
                key.meta_mac = 0;
            }
        }
        transfer.bt.backoff(now);
        let retry_in = transfer.bt.retry_in(now);
        tracing::warn!(transfer = %id, retry_in, "finished transfer rejected: {}", error);
        self.events.push(TransferEvent::Failed {
            id,
            direction: transfer.direction,
            error,
            retry_in: Some(retry_in),
        });
        self.index
            .entry((transfer.direction, transfer.fingerprint))
            .or_insert(id);
        self.transfers.insert(id, transfer);
    }

    /// Fail slots that made no progress within the timeout
    pub fn check_timeouts(&mut self, now: Ds, transport: &mut dyn Transport, fs: &dyn FileSystem) {
        let timeout = self.config.transfer_timeout;
        let stalled: Vec<TransferId> = self
            .slots
            .iter()
            .filter(|(_, slot)| now.saturating_sub(slot.last_activity) >= timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in stalled {
            self.fail(&id, TransferError::Timeout, now, transport, fs);
        }
    }

    /* Results */

    pub fn take_completed(&mut self) -> Vec<Transfer> {
        std::mem::take(&mut self.completed)
    }

    pub fn take_abandoned(&mut self) -> Vec<Transfer> {
        std::mem::take(&mut self.abandoned)
    }

    pub fn take_events(&mut self) -> Vec<TransferEvent> {
        std::mem::take(&mut self.events)
    }

    /// Earliest time a queued transfer becomes eligible or a slot times out
    pub fn next_wakeup(&self, wake_at: &mut Option<Ds>) {
        for transfer in self.transfers.values() {
            if !self.slots.contains_key(&transfer.id) {
                transfer.bt.update(wake_at);
            }
        }
        for slot in self.slots.values() {
            let deadline = slot.last_activity.saturating_add(self.config.transfer_timeout);
            if wake_at.map(|at| deadline < at).unwrap_or(true) {
                *wake_at = Some(deadline);
            }
        }
    }
}

fn read_exact_at(file: &mut dyn FileHandle, offset: u64, buf: &mut [u8]) -> Result<(), TransferError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read_at(offset + filled as u64, &mut buf[filled..])?;
        if n == 0 {
            return Err(TransferError::SourceChanged);
        }
        filled += n;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::transport::TransportError;
    use crate::types::{LocalId, SyncId};
    use std::collections::VecDeque;
    use std::path::PathBuf;

    /// Records posted requests and lets the test decide every outcome
    #[derive(Default)]
    struct ScriptedTransport {
        next: u64,
        posted: Vec<(RequestId, Request)>,
        cancelled: Vec<RequestId>,
        ready: VecDeque<Completion>,
    }

    impl Transport for ScriptedTransport {
        fn post(&mut self, request: Request) -> RequestId {
            self.next += 1;
            let id = RequestId(self.next);
            self.posted.push((id, request));
            id
        }

        fn cancel(&mut self, id: RequestId) {
            self.cancelled.push(id);
        }

        fn progress(&self, _id: RequestId) -> u64 {
            0
        }

        fn pump(&mut self) -> Vec<Completion> {
            self.ready.drain(..).collect()
        }
    }

    fn upload_spec(n: u8, size: i64) -> TransferSpec {
        TransferSpec {
            direction: Direction::Put,
            fingerprint: FileFingerprint::new(size, 1, [n; 16]),
            size,
            node: None,
            key: None,
            temp_path: None,
        }
    }

    fn upload_kind(n: u32) -> RequesterKind {
        RequesterKind::SyncUpload {
            sync: SyncId(1),
            local: LocalId::new(SyncId(1), n),
            path: PathBuf::from(format!("/sync/{}", n)),
        }
    }

    #[test]
    fn test_same_content_shares_one_transfer() {
        let mut engine = TransferEngine::new(EngineConfig::default());
        let (a, _) = engine.enqueue(upload_spec(1, 10), upload_kind(1));
        let (b, _) = engine.enqueue(upload_spec(1, 10), upload_kind(2));
        let (c, _) = engine.enqueue(upload_spec(2, 10), upload_kind(3));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(engine.get(&a).unwrap().requesters.len(), 2);
    }

    #[test]
    fn test_dispatch_respects_cap() {
        let config = EngineConfig {
            max_uploads: 2,
            ..EngineConfig::default()
        };
        let mut engine = TransferEngine::new(config);
        let mut transport = ScriptedTransport::default();
        let fs = crate::testkit::MemoryFs::new();
        for n in 1..=3 {
            engine.enqueue(upload_spec(n, 10), upload_kind(n as u32));
        }
        engine.dispatch(1, &mut transport, &fs);
        assert_eq!(engine.active(Direction::Put), 2);
        assert_eq!(engine.queued(Direction::Put), 1);

        engine.set_paused(Direction::Put, true);
        let (first, _) = engine.enqueue(upload_spec(1, 10), upload_kind(9));
        engine.cancel(&first, &mut transport, &fs);
        engine.dispatch(1, &mut transport, &fs);
        assert_eq!(engine.active(Direction::Put), 1);

        engine.set_paused(Direction::Put, false);
        engine.dispatch(1, &mut transport, &fs);
        assert_eq!(engine.active(Direction::Put), 2);
        assert_eq!(engine.queued(Direction::Put), 0);
    }

    #[test]
    fn test_last_requester_cancels_and_releases() {
        let mut engine = TransferEngine::new(EngineConfig::default());
        let mut transport = ScriptedTransport::default();
        let fs = crate::testkit::MemoryFs::new();
        let (id, r1) = engine.enqueue(upload_spec(1, 10), upload_kind(1));
        let (_, r2) = engine.enqueue(upload_spec(1, 10), upload_kind(2));
        engine.dispatch(1, &mut transport, &fs);
        let url_request = transport.posted[0].0;

        assert_eq!(engine.remove_requester(r1, &mut transport, &fs), None);
        assert!(engine.get(&id).is_some());
        assert_eq!(engine.remove_requester(r2, &mut transport, &fs), Some(id));
        assert!(engine.get(&id).is_none());
        assert!(engine.slot(&id).is_none());
        assert_eq!(transport.cancelled, vec![url_request]);
        assert!(!engine.owns(&url_request));
    }

    #[test]
    fn test_failed_url_backs_off() {
        let mut engine = TransferEngine::new(EngineConfig::default());
        let mut transport = ScriptedTransport::default();
        let fs = crate::testkit::MemoryFs::new();
        let (id, _) = engine.enqueue(upload_spec(1, 10), upload_kind(1));
        engine.dispatch(10, &mut transport, &fs);
        let request = transport.posted[0].0;
        assert!(engine.on_completion(
            Completion {
                id: request,
                result: Err(TransportError::Timeout),
            },
            10,
            &mut transport,
            &fs,
        ));
        let transfer = engine.get(&id).unwrap();
        assert_eq!(transfer.failcount, 1);
        assert!(!transfer.bt.armed(10));
        assert!(engine.slot(&id).is_none());

        engine.dispatch(10, &mut transport, &fs);
        assert_eq!(engine.active(Direction::Put), 0);
        engine.dispatch(11, &mut transport, &fs);
        assert_eq!(engine.active(Direction::Put), 1);
    }
}
