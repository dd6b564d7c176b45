//! In-process storage service
//!
//! [`LoopbackService`] keeps nodes, encrypted content, file attributes and
//! an ordered event log in memory. Every [`LoopbackTransport`] opened on it
//! is one client session: requests posted to it complete on the next
//! [`Transport::pump`], and the changes it makes are recorded in the log for
//! every *other* session to pick up through `PollEvents`.
//!
//! Tests drive it directly (seeding content, deleting or moving nodes as
//! another device would, injecting chunk faults); the daemon uses it as a
//! local mirror backend persisted as a bincode snapshot.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::crypto::{
    attribute_key, decrypt_attributes, AttrMap, CryptoError, FileKey, KeyRing, BLOCK_SIZE,
};
use crate::fileattr::encode_response;
use crate::fingerprint::FileFingerprint;
use crate::node_graph::{ATTR_FINGERPRINT, ATTR_NAME};
use crate::sync::{new_file_node, new_folder_node};
use crate::transfer::chunk::chunk_ceil;
use crate::transport::{
    Completion, KeyEntry, KeyHolder, NewNode, NewNodeSource, RemoteNode, Request, Response,
    ServerEvent, Transport, TransportError,
};
use crate::types::{Direction, NodeHandle, NodeType, RequestId, UserHandle};

const ROOT: u64 = 1;
const INCOMING: u64 = 2;
const RUBBISH: u64 = 3;
/// Real handles start above the roots
const FIRST_HANDLE: u64 = 0x100;

#[derive(Debug, thiserror::Error)]
pub enum LoopbackError {
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] bincode::Error),
    #[error("request failed: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LogEntry {
    /// Session that caused the change; `None` for changes made from outside
    origin: Option<u32>,
    event: ServerEvent,
}

#[derive(Debug, Default)]
struct PendingUpload {
    size: u64,
    chunks: BTreeMap<u64, Vec<u8>>,
    token: Option<Vec<u8>>,
}

impl PendingUpload {
    fn covered(&self) -> u64 {
        let mut end = 0;
        for (offset, data) in &self.chunks {
            if *offset > end {
                break;
            }
            end = end.max(offset + data.len() as u64);
        }
        end
    }
}

/// Persistent part of the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSnapshot {
    owner: UserHandle,
    nodes: BTreeMap<NodeHandle, RemoteNode>,
    content: BTreeMap<NodeHandle, Vec<u8>>,
    file_attrs: BTreeMap<(NodeHandle, u8), Vec<u8>>,
    log: Vec<LogEntry>,
    next_handle: u64,
}

#[derive(Debug)]
struct ServiceState {
    stored: ServiceSnapshot,
    next_session: u32,
    next_url: u64,
    uploads: HashMap<String, PendingUpload>,
    downloads: HashMap<String, NodeHandle>,
    /// token -> assembled ciphertext
    finished: HashMap<Vec<u8>, Vec<u8>>,
    faults: HashSet<(Direction, u64)>,
    /// download offsets whose next response has a flipped byte
    corruptions: HashSet<u64>,
    chunk_requests: HashMap<(Direction, u64), usize>,
}

impl ServiceState {
    fn new(stored: ServiceSnapshot) -> Self {
        Self {
            stored,
            next_session: 1,
            next_url: 1,
            uploads: HashMap::new(),
            downloads: HashMap::new(),
            finished: HashMap::new(),
            faults: HashSet::new(),
            corruptions: HashSet::new(),
            chunk_requests: HashMap::new(),
        }
    }

    fn record(&mut self, origin: Option<u32>, event: ServerEvent) {
        self.stored.log.push(LogEntry { origin, event });
    }

    fn cursor(&self) -> String {
        self.stored.log.len().to_string()
    }

    fn is_below(&self, node: &NodeHandle, ancestor: &NodeHandle) -> bool {
        let mut cursor = Some(*node);
        while let Some(current) = cursor {
            if current == *ancestor {
                return true;
            }
            cursor = self.stored.nodes.get(&current).and_then(|n| n.parent);
        }
        false
    }

    fn handle(&mut self, session: u32, request: Request) -> Result<Response, TransportError> {
        match request {
            Request::FetchNodes => Ok(Response::Nodes {
                nodes: self.stored.nodes.values().cloned().collect(),
                cursor: self.cursor(),
            }),
            Request::PollEvents { cursor } => {
                let from: usize = cursor
                    .parse()
                    .map_err(|_| TransportError::Rejected(format!("bad cursor {}", cursor)))?;
                let events = self
                    .stored
                    .log
                    .iter()
                    .skip(from)
                    .filter(|entry| entry.origin != Some(session))
                    .map(|entry| entry.event.clone())
                    .collect();
                Ok(Response::Events {
                    events,
                    cursor: self.cursor(),
                })
            }
            Request::PutNodes { parent, nodes } => {
                let created = self.put_nodes(Some(session), parent, nodes)?;
                Ok(Response::Created { nodes: created })
            }
            Request::Move { node, parent } => {
                self.move_node(Some(session), node, parent)?;
                Ok(Response::Done)
            }
            Request::SetAttributes { node, attrs } => {
                let found = self
                    .stored
                    .nodes
                    .get_mut(&node)
                    .ok_or(TransportError::NotFound)?;
                found.attrs = attrs.clone();
                self.record(Some(session), ServerEvent::AttributesUpdated { node, attrs });
                Ok(Response::Done)
            }
            Request::Unlink { node } => {
                self.unlink(Some(session), node)?;
                Ok(Response::Done)
            }
            Request::TransferUrl {
                direction,
                node,
                size,
            } => {
                let url = format!("{}/{}", direction, self.next_url);
                self.next_url += 1;
                match direction {
                    Direction::Get => {
                        let node = node.ok_or(TransportError::NotFound)?;
                        if !self.stored.content.contains_key(&node) {
                            return Err(TransportError::NotFound);
                        }
                        self.downloads.insert(url.clone(), node);
                    }
                    Direction::Put => {
                        let upload = PendingUpload {
                            size: size.max(0) as u64,
                            ..Default::default()
                        };
                        self.uploads.insert(url.clone(), upload);
                    }
                }
                Ok(Response::TransferUrl { url })
            }
            Request::UploadChunk { url, offset, data } => {
                self.count_chunk(Direction::Put, offset)?;
                let upload = self.uploads.get_mut(&url).ok_or(TransportError::NotFound)?;
                if offset + data.len() as u64 > upload.size {
                    return Err(TransportError::Rejected("chunk beyond upload size".to_string()));
                }
                upload.chunks.insert(offset, data);
                if upload.token.is_none() && upload.covered() >= upload.size {
                    let token = format!("token/{}", url).into_bytes();
                    let mut content = Vec::with_capacity(upload.size as usize);
                    for data in upload.chunks.values() {
                        content.extend_from_slice(data);
                    }
                    content.truncate(upload.size as usize);
                    upload.token = Some(token.clone());
                    self.finished.insert(token, content);
                }
                Ok(Response::ChunkStored {
                    token: upload.token.clone(),
                })
            }
            Request::DownloadChunk { url, offset, len } => {
                self.count_chunk(Direction::Get, offset)?;
                let node = self.downloads.get(&url).ok_or(TransportError::NotFound)?;
                let content = self.stored.content.get(node).ok_or(TransportError::NotFound)?;
                let end = offset.saturating_add(len);
                if end > content.len() as u64 {
                    return Err(TransportError::Rejected("read beyond end of content".to_string()));
                }
                let mut data = content[offset as usize..end as usize].to_vec();
                if self.corruptions.remove(&offset) {
                    if let Some(byte) = data.first_mut() {
                        *byte ^= 0xff;
                    }
                }
                Ok(Response::ChunkData { data })
            }
            Request::FileAttributes { kind, handles } => {
                let entries: Vec<(NodeHandle, Vec<u8>)> = handles
                    .iter()
                    .filter_map(|h| {
                        self.stored
                            .file_attrs
                            .get(&(*h, kind))
                            .map(|data| (*h, data.clone()))
                    })
                    .collect();
                Ok(Response::FileAttributes {
                    data: encode_response(&entries),
                })
            }
        }
    }

    fn count_chunk(&mut self, direction: Direction, offset: u64) -> Result<(), TransportError> {
        *self.chunk_requests.entry((direction, offset)).or_insert(0) += 1;
        if self.faults.remove(&(direction, offset)) {
            return Err(TransportError::Network("injected fault".to_string()));
        }
        Ok(())
    }

    /// Validate the whole batch, then create it
    fn put_nodes(
        &mut self,
        origin: Option<u32>,
        parent: NodeHandle,
        nodes: Vec<NewNode>,
    ) -> Result<Vec<(NodeHandle, RemoteNode)>, TransportError> {
        let parent_node = self.stored.nodes.get(&parent).ok_or(TransportError::NotFound)?;
        if parent_node.node_type.is_file() {
            return Err(TransportError::Rejected("parent is a file".to_string()));
        }
        let mut temps = HashSet::new();
        for node in &nodes {
            if let Some(parent_temp) = node.parent_temp {
                if !temps.contains(&parent_temp) {
                    return Err(TransportError::Rejected(format!(
                        "unknown placeholder parent {}",
                        parent_temp
                    )));
                }
            }
            match &node.source {
                NewNodeSource::Folder => {}
                NewNodeSource::Upload { token } => {
                    if !self.finished.contains_key(token) {
                        return Err(TransportError::Rejected("unknown upload token".to_string()));
                    }
                }
                NewNodeSource::Copy { from } => {
                    if !self.stored.content.contains_key(from) {
                        return Err(TransportError::NotFound);
                    }
                }
            }
            temps.insert(node.temp);
        }

        let mut real: HashMap<NodeHandle, NodeHandle> = HashMap::new();
        let mut created = Vec::with_capacity(nodes.len());
        for node in nodes {
            let handle = NodeHandle::from_u64(self.stored.next_handle);
            self.stored.next_handle += 1;
            let content = match node.source {
                NewNodeSource::Folder => None,
                NewNodeSource::Upload { token } => self.finished.remove(&token),
                NewNodeSource::Copy { from } => self.stored.content.get(&from).cloned(),
            };
            let size = content.as_ref().map(|c| c.len() as i64).unwrap_or(0);
            if let Some(content) = content {
                self.stored.content.insert(handle, content);
            }
            let remote = RemoteNode {
                handle,
                parent: Some(
                    node.parent_temp
                        .and_then(|temp| real.get(&temp).copied())
                        .unwrap_or(parent),
                ),
                node_type: node.node_type,
                size,
                owner: self.stored.owner,
                ctime: node.mtime,
                mtime: node.mtime,
                keys: vec![KeyEntry {
                    holder: KeyHolder::User(self.stored.owner),
                    wrapped: node.key,
                }],
                attrs: node.attrs,
                file_attributes: String::new(),
                share: None,
            };
            real.insert(node.temp, handle);
            self.stored.nodes.insert(handle, remote.clone());
            created.push((node.temp, remote));
        }
        let event_nodes = created.iter().map(|(_, n)| n.clone()).collect();
        self.record(origin, ServerEvent::NewNodes(event_nodes));
        Ok(created)
    }

    fn move_node(&mut self, origin: Option<u32>, node: NodeHandle, parent: NodeHandle) -> Result<(), TransportError> {
        let moving = self.stored.nodes.get(&node).ok_or(TransportError::NotFound)?;
        if moving.node_type.is_root() {
            return Err(TransportError::AccessDenied);
        }
        let target = self.stored.nodes.get(&parent).ok_or(TransportError::NotFound)?;
        if target.node_type.is_file() || self.is_below(&parent, &node) {
            return Err(TransportError::Rejected("invalid move target".to_string()));
        }
        if let Some(moving) = self.stored.nodes.get_mut(&node) {
            moving.parent = Some(parent);
        }
        self.record(origin, ServerEvent::Moved { node, parent });
        Ok(())
    }

    fn unlink(&mut self, origin: Option<u32>, node: NodeHandle) -> Result<(), TransportError> {
        let found = self.stored.nodes.get(&node).ok_or(TransportError::NotFound)?;
        if found.node_type.is_root() {
            return Err(TransportError::AccessDenied);
        }
        let doomed: Vec<NodeHandle> = self
            .stored
            .nodes
            .keys()
            .filter(|h| self.is_below(h, &node))
            .copied()
            .collect();
        for handle in doomed {
            self.stored.nodes.remove(&handle);
            self.stored.content.remove(&handle);
            self.stored.file_attrs.retain(|(h, _), _| *h != handle);
        }
        self.record(origin, ServerEvent::Deleted(node));
        Ok(())
    }
}

/// The shared service; cloning hands out another reference to the same state
#[derive(Debug, Clone)]
pub struct LoopbackService {
    inner: Arc<Mutex<ServiceState>>,
}

impl LoopbackService {
    /// Empty account with a cloud root, an incoming-shares root and a rubbish bin
    pub fn new(owner: UserHandle) -> Self {
        let mut nodes = BTreeMap::new();
        for (handle, node_type) in [
            (ROOT, NodeType::Root),
            (INCOMING, NodeType::Incoming),
            (RUBBISH, NodeType::Rubbish),
        ] {
            let handle = NodeHandle::from_u64(handle);
            nodes.insert(
                handle,
                RemoteNode {
                    handle,
                    parent: None,
                    node_type,
                    size: 0,
                    owner,
                    ctime: 0,
                    mtime: 0,
                    keys: Vec::new(),
                    attrs: Vec::new(),
                    file_attributes: String::new(),
                    share: None,
                },
            );
        }
        Self::from_snapshot(ServiceSnapshot {
            owner,
            nodes,
            content: BTreeMap::new(),
            file_attrs: BTreeMap::new(),
            log: Vec::new(),
            next_handle: FIRST_HANDLE,
        })
    }

    pub fn from_snapshot(snapshot: ServiceSnapshot) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ServiceState::new(snapshot))),
        }
    }

    pub fn snapshot(&self) -> ServiceSnapshot {
        self.inner.lock().stored.clone()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LoopbackError> {
        Ok(bincode::serialize(&self.inner.lock().stored)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, LoopbackError> {
        let snapshot: ServiceSnapshot = bincode::deserialize(data)?;
        Ok(Self::from_snapshot(snapshot))
    }

    /// Open a client session
    pub fn connect(&self) -> LoopbackTransport {
        let session = {
            let mut state = self.inner.lock();
            let session = state.next_session;
            state.next_session += 1;
            session
        };
        tracing::debug!(session, "loopback session opened");
        LoopbackTransport {
            service: self.clone(),
            session,
            next_request: 1,
            queue: Vec::new(),
        }
    }

    pub fn root(&self) -> NodeHandle {
        NodeHandle::from_u64(ROOT)
    }

    pub fn rubbish(&self) -> NodeHandle {
        NodeHandle::from_u64(RUBBISH)
    }

    pub fn node(&self, handle: &NodeHandle) -> Option<RemoteNode> {
        self.inner.lock().stored.nodes.get(handle).cloned()
    }

    /// Every stored node, in handle order
    pub fn nodes(&self) -> Vec<RemoteNode> {
        self.inner.lock().stored.nodes.values().cloned().collect()
    }

    pub fn children(&self, parent: &NodeHandle) -> Vec<RemoteNode> {
        self.inner
            .lock()
            .stored
            .nodes
            .values()
            .filter(|n| n.parent.as_ref() == Some(parent))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().stored.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /* Acting as another device */

    /// Create a folder under `parent`
    pub fn seed_folder(&self, parent: NodeHandle, name: &str, keyring: &KeyRing) -> Result<NodeHandle, LoopbackError> {
        let temp = NodeHandle::from_u64(1);
        let node = new_folder_node(temp, None, name, keyring)?;
        let created = self.inner.lock().put_nodes(None, parent, vec![node])?;
        Ok(created[0].1.handle)
    }

    /// Encrypt `content` under a fresh file key and store it as a new file
    pub fn seed_file(
        &self,
        parent: NodeHandle,
        name: &str,
        content: &[u8],
        mtime: i64,
        keyring: &KeyRing,
    ) -> Result<NodeHandle, LoopbackError> {
        let mut key = FileKey::generate()?;
        let cipher = key.cipher();
        let mut ciphertext = content.to_vec();
        let mut macs = Vec::new();
        let size = content.len() as u64;
        let mut offset = 0;
        while offset < size {
            let end = chunk_ceil(offset).min(size);
            let chunk = &mut ciphertext[offset as usize..end as usize];
            macs.push(cipher.chunk_mac(chunk, key.nonce));
            cipher.ctr_crypt(chunk, key.nonce, offset)?;
            offset = end;
        }
        key.meta_mac = cipher.condense_macs(macs.iter());

        let mut attrs = AttrMap::new();
        attrs.insert(ATTR_NAME.to_string(), name.to_string());
        attrs.insert(
            ATTR_FINGERPRINT.to_string(),
            FileFingerprint::from_content(content, mtime).to_attribute(),
        );
        let token = format!("seed/{}", name).into_bytes();
        let temp = NodeHandle::from_u64(1);
        let node = new_file_node(
            temp,
            None,
            NewNodeSource::Upload { token: token.clone() },
            &key.to_bytes(),
            &attrs,
            mtime,
            keyring,
        )?;
        let mut state = self.inner.lock();
        state.finished.insert(token, ciphertext);
        let created = state.put_nodes(None, parent, vec![node])?;
        Ok(created[0].1.handle)
    }

    pub fn delete(&self, node: NodeHandle) -> Result<(), LoopbackError> {
        Ok(self.inner.lock().unlink(None, node)?)
    }

    pub fn move_node(&self, node: NodeHandle, parent: NodeHandle) -> Result<(), LoopbackError> {
        Ok(self.inner.lock().move_node(None, node, parent)?)
    }

    /// Attach an already encrypted file attribute of `kind` to `node`
    pub fn set_file_attribute(&self, node: NodeHandle, kind: u8, data: Vec<u8>) {
        debug_assert_eq!(data.len() % BLOCK_SIZE, 0);
        self.inner.lock().stored.file_attrs.insert((node, kind), data);
    }

    /* Inspection */

    /// Decrypted name of a node the keyring can read
    pub fn name_of(&self, handle: &NodeHandle, keyring: &KeyRing) -> Option<String> {
        let node = self.node(handle)?;
        let key = node_key(&node, keyring)?;
        let attrs = decrypt_attributes(&node.attrs, &attribute_key(&key).ok()?).ok()?;
        attrs.get(ATTR_NAME).cloned()
    }

    /// Child of `parent` with the given decrypted name
    pub fn child_named(&self, parent: &NodeHandle, name: &str, keyring: &KeyRing) -> Option<NodeHandle> {
        self.children(parent)
            .into_iter()
            .find(|n| self.name_of(&n.handle, keyring).as_deref() == Some(name))
            .map(|n| n.handle)
    }

    /// Follow a `/`-separated path of names below `from`
    pub fn lookup(&self, from: &NodeHandle, path: &str, keyring: &KeyRing) -> Option<NodeHandle> {
        path.split('/')
            .filter(|part| !part.is_empty())
            .try_fold(*from, |current, part| self.child_named(&current, part, keyring))
    }

    /// Decrypted content of a file node
    pub fn read_file(&self, handle: &NodeHandle, keyring: &KeyRing) -> Option<Vec<u8>> {
        let node = self.node(handle)?;
        let key = FileKey::from_bytes(&node_key(&node, keyring)?).ok()?;
        let mut data = self.inner.lock().stored.content.get(handle)?.clone();
        key.cipher().ctr_crypt(&mut data, key.nonce, 0).ok()?;
        Some(data)
    }

    /// Inject a network error into the next chunk request at `offset`
    pub fn fail_chunk(&self, direction: Direction, offset: u64) {
        self.inner.lock().faults.insert((direction, offset));
    }

    /// Flip a byte in the next downloaded chunk at `offset`
    pub fn corrupt_chunk(&self, offset: u64) {
        self.inner.lock().corruptions.insert(offset);
    }

    /// Chunk requests received at `offset` so far, failed ones included
    pub fn chunk_requests(&self, direction: Direction, offset: u64) -> usize {
        self.inner
            .lock()
            .chunk_requests
            .get(&(direction, offset))
            .copied()
            .unwrap_or(0)
    }
}

fn node_key(node: &RemoteNode, keyring: &KeyRing) -> Option<Vec<u8>> {
    node.keys
        .iter()
        .find(|k| k.holder == KeyHolder::User(keyring.me))
        .and_then(|k| KeyRing::unwrap_key(&keyring.master, &k.wrapped).ok())
}

/// One client session on a [`LoopbackService`]
#[derive(Debug)]
pub struct LoopbackTransport {
    service: LoopbackService,
    session: u32,
    next_request: u64,
    queue: Vec<(RequestId, Request)>,
}

impl LoopbackTransport {
    pub fn service(&self) -> &LoopbackService {
        &self.service
    }
}

impl Transport for LoopbackTransport {
    fn post(&mut self, request: Request) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        self.queue.push((id, request));
        id
    }

    fn cancel(&mut self, id: RequestId) {
        self.queue.retain(|(queued, _)| *queued != id);
    }

    fn progress(&self, _id: RequestId) -> u64 {
        0
    }

    fn pump(&mut self) -> Vec<Completion> {
        if self.queue.is_empty() {
            return Vec::new();
        }
        let queue = std::mem::take(&mut self.queue);
        let mut state = self.service.inner.lock();
        queue
            .into_iter()
            .map(|(id, request)| {
                let result = state.handle(self.session, request);
                if let Err(e) = &result {
                    tracing::trace!(session = self.session, request = %id, "loopback request failed: {}", e);
                }
                Completion { id, result }
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn account() -> (LoopbackService, KeyRing) {
        let keyring = KeyRing::generate(UserHandle::from_u64(7)).unwrap();
        (LoopbackService::new(keyring.me), keyring)
    }

    fn run(transport: &mut LoopbackTransport, request: Request) -> Result<Response, TransportError> {
        let id = transport.post(request);
        let mut completions = transport.pump();
        assert_eq!(completions.len(), 1);
        let completion = completions.remove(0);
        assert_eq!(completion.id, id);
        completion.result
    }

    #[test]
    fn test_fetch_lists_roots() {
        let (service, _) = account();
        let mut session = service.connect();
        let Ok(Response::Nodes { nodes, cursor }) = run(&mut session, Request::FetchNodes) else {
            panic!("expected nodes");
        };
        assert_eq!(nodes.len(), 3);
        assert_eq!(cursor, "0");
    }

    #[test]
    fn test_events_skip_own_session() {
        let (service, keyring) = account();
        let mut alice = service.connect();
        let mut bob = service.connect();

        let folder = new_folder_node(NodeHandle::from_u64(9), None, "docs", &keyring).unwrap();
        let created = run(
            &mut alice,
            Request::PutNodes {
                parent: service.root(),
                nodes: vec![folder],
            },
        )
        .unwrap();
        assert!(matches!(created, Response::Created { ref nodes } if nodes.len() == 1));

        let cursor = "0".to_string();
        let Ok(Response::Events { events, .. }) = run(&mut alice, Request::PollEvents { cursor: cursor.clone() }) else {
            panic!("expected events");
        };
        assert!(events.is_empty());
        let Ok(Response::Events { events, cursor }) = run(&mut bob, Request::PollEvents { cursor }) else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 1);
        assert_eq!(cursor, "1");
    }

    #[test]
    fn test_batch_with_unknown_placeholder_rejected() {
        let (service, keyring) = account();
        let mut session = service.connect();
        let orphan =
            new_folder_node(NodeHandle::from_u64(2), Some(NodeHandle::from_u64(1)), "x", &keyring).unwrap();
        let result = run(
            &mut session,
            Request::PutNodes {
                parent: service.root(),
                nodes: vec![orphan],
            },
        );
        assert!(matches!(result, Err(TransportError::Rejected(_))));
        assert_eq!(service.len(), 3);
    }

    #[test]
    fn test_seeded_file_reads_back() {
        let (service, keyring) = account();
        let content = vec![42u8; 300 * 1024];
        let file = service
            .seed_file(service.root(), "big.bin", &content, 1000, &keyring)
            .unwrap();
        assert_eq!(service.read_file(&file, &keyring).unwrap(), content);
        assert_eq!(service.lookup(&service.root(), "big.bin", &keyring), Some(file));
        assert_eq!(service.node(&file).unwrap().size, content.len() as i64);
    }

    #[test]
    fn test_injected_fault_hits_once() {
        let (service, keyring) = account();
        let file = service.seed_file(service.root(), "a", b"hello", 1, &keyring).unwrap();
        let mut session = service.connect();
        let Ok(Response::TransferUrl { url }) = run(
            &mut session,
            Request::TransferUrl {
                direction: Direction::Get,
                node: Some(file),
                size: 5,
            },
        ) else {
            panic!("expected url");
        };
        service.fail_chunk(Direction::Get, 0);
        let chunk = Request::DownloadChunk {
            url,
            offset: 0,
            len: 5,
        };
        assert!(run(&mut session, chunk.clone()).is_err());
        assert!(matches!(run(&mut session, chunk), Ok(Response::ChunkData { data }) if data.len() == 5));
        assert_eq!(service.chunk_requests(Direction::Get, 0), 2);
    }

    #[test]
    fn test_corrupted_chunk_differs_once() {
        let (service, keyring) = account();
        let file = service.seed_file(service.root(), "a", b"hello", 1, &keyring).unwrap();
        let mut session = service.connect();
        let Ok(Response::TransferUrl { url }) = run(
            &mut session,
            Request::TransferUrl {
                direction: Direction::Get,
                node: Some(file),
                size: 5,
            },
        ) else {
            panic!("expected url");
        };
        service.corrupt_chunk(0);
        let chunk = Request::DownloadChunk {
            url,
            offset: 0,
            len: 5,
        };
        let Ok(Response::ChunkData { data: bad }) = run(&mut session, chunk.clone()) else {
            panic!("expected data");
        };
        let Ok(Response::ChunkData { data: good }) = run(&mut session, chunk) else {
            panic!("expected data");
        };
        assert_eq!(bad.len(), good.len());
        assert_ne!(bad, good);
        assert_eq!(bad[1..], good[1..]);
    }

    #[test]
    fn test_snapshot_restores_tree() {
        let (service, keyring) = account();
        let docs = service.seed_folder(service.root(), "docs", &keyring).unwrap();
        service.seed_file(docs, "note.txt", b"text", 5, &keyring).unwrap();
        let restored = LoopbackService::from_bytes(&service.to_bytes().unwrap()).unwrap();
        let note = restored.lookup(&restored.root(), "docs/note.txt", &keyring).unwrap();
        assert_eq!(restored.read_file(&note, &keyring).unwrap(), b"text");
    }

    #[test]
    fn test_unlink_removes_subtree() {
        let (service, keyring) = account();
        let docs = service.seed_folder(service.root(), "docs", &keyring).unwrap();
        let note = service.seed_file(docs, "note.txt", b"text", 5, &keyring).unwrap();
        service.delete(docs).unwrap();
        assert!(service.node(&note).is_none());
        assert!(service.node(&docs).is_none());
        assert!(service.delete(service.root()).is_err());
    }
}
