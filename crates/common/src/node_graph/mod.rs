//! The remote object tree
//!
//! Nodes live in an arena keyed by handle. Parent links are stored on each
//! node and the reverse direction in an explicit child index; both are only
//! ever changed together, so a node is in its parent's child set exactly
//! when its parent link names that parent.
//!
//! # Ingest
//!
//! The service may deliver children before their parents. Ingest is
//! two-phase: every record of a batch is staged (linked right away when the
//! parent is known, parked on the missing parent otherwise), then links are
//! resolved. Anything still waiting for a parent after the batch is reported
//! as a data-integrity error and dropped rather than left dangling.
//!
//! # Keys
//!
//! See [`crate::crypto`] for the resolution order. Undecrypted nodes are
//! tracked so they can be retried when share keys arrive.

mod node;
mod record;

use std::collections::{BTreeMap, BTreeSet, HashMap};

pub use node::{
    KeyState, Node, NodeAttributes, SyncDeleted, ATTR_FINGERPRINT, ATTR_NAME, BLANK_NAME,
    CRYPTO_ERROR_NAME, NO_KEY_NAME,
};

use crate::codec::CodecError;
use crate::crypto::{
    attribute_key, decrypt_attributes, node_key_size, AttrMap, CryptoError, KeyRing, SymmKey,
    FILE_KEY_SIZE,
};
use crate::fingerprint::{FileFingerprint, CRC_SIZE};
use crate::transport::{KeyHolder, RemoteNode, ShareKeyDelivery};
use crate::types::{NodeHandle, NodeType};

#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("node not found: {0}")]
    NotFound(NodeHandle),
    #[error("node {node} references missing parent {parent}")]
    UnresolvedParent { node: NodeHandle, parent: NodeHandle },
    #[error("cannot move {0} below itself")]
    Cycle(NodeHandle),
    #[error("node {0} cannot hold children")]
    NotAContainer(NodeHandle),
    #[error("node {0} has no usable key")]
    KeyUnavailable(NodeHandle),
    #[error("record error: {0}")]
    Codec(#[from] CodecError),
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

/// Outcome of ingesting one batch of nodes
#[derive(Debug, Default)]
pub struct IngestReport {
    pub added: Vec<NodeHandle>,
    pub updated: Vec<NodeHandle>,
    /// Nodes dropped because their parent never arrived
    pub rejected: Vec<GraphError>,
    /// Every node freed by those rejections, including known ones that moved
    pub dropped: Vec<Node>,
}

#[derive(Debug, Default)]
pub struct NodeGraph {
    nodes: HashMap<NodeHandle, Node>,
    children: HashMap<NodeHandle, BTreeSet<NodeHandle>>,
    /// missing parent -> staged children waiting for it
    awaiting_parent: HashMap<NodeHandle, BTreeSet<NodeHandle>>,
    undecrypted: BTreeSet<NodeHandle>,
    fingerprints: BTreeMap<FileFingerprint, BTreeSet<NodeHandle>>,
    roots: BTreeMap<NodeType, NodeHandle>,
    dirty: BTreeSet<NodeHandle>,
    purged_records: Vec<u32>,
}

impl NodeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /* Getters */

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, handle: &NodeHandle) -> Option<&Node> {
        self.nodes.get(handle)
    }

    pub(crate) fn get_mut(&mut self, handle: &NodeHandle) -> Option<&mut Node> {
        self.dirty.insert(*handle);
        self.nodes.get_mut(handle)
    }

    pub fn contains(&self, handle: &NodeHandle) -> bool {
        self.nodes.contains_key(handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn root(&self, node_type: NodeType) -> Option<NodeHandle> {
        self.roots.get(&node_type).copied()
    }

    pub fn child_handles(&self, parent: &NodeHandle) -> Vec<NodeHandle> {
        self.children
            .get(parent)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn children(&self, parent: &NodeHandle) -> impl Iterator<Item = &Node> {
        self.children
            .get(parent)
            .into_iter()
            .flatten()
            .filter_map(|handle| self.nodes.get(handle))
    }

    pub fn child_by_name(&self, parent: &NodeHandle, name: &str) -> Option<&Node> {
        self.children(parent).find(|node| node.name() == Some(name))
    }

    /// Whether `handle` is `ancestor` or lies anywhere below it
    pub fn is_below(&self, handle: &NodeHandle, ancestor: &NodeHandle) -> bool {
        let mut cursor = Some(*handle);
        while let Some(current) = cursor {
            if current == *ancestor {
                return true;
            }
            cursor = self.nodes.get(&current).and_then(|node| node.parent);
        }
        false
    }

    /// Any decrypted file with this fingerprint
    pub fn node_by_fingerprint(&self, fingerprint: &FileFingerprint) -> Option<&Node> {
        self.fingerprints
            .get(fingerprint)
            .into_iter()
            .flatten()
            .filter_map(|handle| self.nodes.get(handle))
            .find(|node| node.is_decrypted())
    }

    /// Slash-separated path from the root, for logs
    pub fn path(&self, handle: &NodeHandle) -> String {
        let mut parts = Vec::new();
        let mut cursor = Some(*handle);
        while let Some(current) = cursor {
            match self.nodes.get(&current) {
                Some(node) => {
                    parts.push(node.display_name().to_string());
                    cursor = node.parent;
                }
                None => break,
            }
        }
        parts.reverse();
        format!("/{}", parts.join("/"))
    }

    pub fn undecrypted(&self) -> impl Iterator<Item = &NodeHandle> {
        self.undecrypted.iter()
    }

    /* Ingest */

    /// Stage one node: link it now if its parent is known, park it otherwise.
    ///
    /// Re-delivery of a known handle refreshes the node in place and moves it
    /// if the parent changed. Returns whether the node was new.
    pub fn stage(&mut self, mut node: Node) -> bool {
        let handle = node.handle;
        if let Some(existing) = self.nodes.get_mut(&handle) {
            existing.size = node.size;
            existing.mtime = node.mtime;
            existing.ctime = node.ctime;
            existing.owner = node.owner;
            existing.file_attributes = std::mem::take(&mut node.file_attributes);
            if !existing.has_key() || matches!(node.key, KeyState::Ready(_)) {
                existing.key = node.key;
            }
            if !matches!(node.attributes, NodeAttributes::Decrypted(ref a) if a.is_empty()) {
                existing.attributes = node.attributes;
            }
            if node.share_key.is_some() {
                existing.share_key = node.share_key;
                existing.outshares = node.outshares;
                existing.inshare = node.inshare;
            }
            let parent_changed = existing.parent != node.parent;
            self.dirty.insert(handle);
            if parent_changed {
                if let Some(parent) = node.parent {
                    if self.nodes.contains_key(&parent) {
                        if let Err(e) = self.move_node(&handle, &parent) {
                            tracing::warn!(node = %handle, "ignoring re-delivered parent: {}", e);
                        }
                    } else {
                        self.park(handle, parent);
                    }
                }
            }
            return false;
        }

        if node.node_type.is_root() {
            self.roots.insert(node.node_type, handle);
            node.parent = None;
        }
        if node.inshare.is_some() {
            // top of an incoming share: its parent belongs to someone else
            node.parent = None;
        }
        if let Some(parent) = node.parent {
            if self.nodes.contains_key(&parent) {
                self.children.entry(parent).or_default().insert(handle);
            } else {
                self.awaiting_parent.entry(parent).or_default().insert(handle);
            }
        }
        if let Some(waiting) = self.awaiting_parent.remove(&handle) {
            // a parked node cannot adopt one of its own descendants
            let (cyclic, linked): (BTreeSet<_>, BTreeSet<_>) = waiting
                .into_iter()
                .partition(|child| node.parent.is_some_and(|p| self.is_below(&p, child)));
            self.children.entry(handle).or_default().extend(linked);
            if !cyclic.is_empty() {
                self.awaiting_parent.insert(handle, cyclic);
            }
        }
        self.dirty.insert(handle);
        self.nodes.insert(handle, node);
        true
    }

    /// Detach a known node and wait for its new parent to be staged
    fn park(&mut self, handle: NodeHandle, parent: NodeHandle) {
        let Some(node) = self.nodes.get_mut(&handle) else {
            return;
        };
        if let Some(old) = node.parent.replace(parent) {
            if let Some(set) = self.children.get_mut(&old) {
                set.remove(&handle);
            }
        }
        for waiting in self.awaiting_parent.values_mut() {
            waiting.remove(&handle);
        }
        self.awaiting_parent.entry(parent).or_default().insert(handle);
    }

    /// Second phase: drop every node still waiting for a parent
    pub fn resolve(&mut self, report: &mut IngestReport) {
        let orphans: Vec<(NodeHandle, NodeHandle)> = self
            .awaiting_parent
            .drain()
            .flat_map(|(parent, children)| children.into_iter().map(move |c| (c, parent)))
            .collect();
        for (node, parent) in orphans {
            tracing::warn!(node = %node, parent = %parent, "dropping node with unresolved parent");
            report.dropped.extend(self.remove_subtree(&node));
            report.rejected.push(GraphError::UnresolvedParent { node, parent });
        }
    }

    /// Ingest a batch from the service in any order
    pub fn ingest_remote(
        &mut self,
        remotes: Vec<RemoteNode>,
        keyring: &KeyRing,
    ) -> IngestReport {
        let mut report = IngestReport::default();
        let mut staged = Vec::with_capacity(remotes.len());
        for remote in remotes {
            let share_key = remote
                .share
                .as_ref()
                .and_then(|share| resolve_share_key(&share.key, keyring, &remote.handle));
            let mut node = Node::from_remote(remote);
            node.share_key = share_key;
            let handle = node.handle;
            if self.stage(node) {
                report.added.push(handle);
            } else {
                report.updated.push(handle);
            }
            staged.push(handle);
        }
        self.resolve(&mut report);
        for handle in staged {
            if self.nodes.contains_key(&handle) {
                self.apply_key(&handle, keyring);
            }
        }
        report
    }

    /// Restore cached records (keys and attributes already in the clear)
    pub fn ingest_records(&mut self, records: Vec<(u32, Vec<u8>)>) -> IngestReport {
        let mut report = IngestReport::default();
        let mut staged = Vec::new();
        for (db_id, data) in records {
            match Node::deserialize(&data) {
                Ok(mut node) => {
                    let handle = node.handle;
                    node.db_id = Some(db_id);
                    staged.push(handle);
                    if self.stage(node) {
                        report.added.push(handle);
                    }
                }
                Err(e) => {
                    tracing::warn!(record = db_id, "skipping corrupt node record: {}", e);
                    self.purged_records.push(db_id);
                    report.rejected.push(e);
                }
            }
        }
        self.resolve(&mut report);
        for handle in staged {
            if self.nodes.contains_key(&handle) {
                self.set_fingerprint(&handle);
            }
        }
        // freshly restored records need no rewrite
        self.dirty.clear();
        report
    }

    /* Keys and attributes */

    /// Try to make the node's key usable. Returns whether it is.
    pub fn apply_key(&mut self, handle: &NodeHandle, keyring: &KeyRing) -> bool {
        let Some(node) = self.nodes.get(handle) else {
            return false;
        };
        let entries = match &node.key {
            KeyState::Pending(entries) => entries.clone(),
            _ => {
                self.undecrypted.remove(handle);
                self.decrypt_attributes(handle);
                return true;
            }
        };
        let key_size = node_key_size(node.node_type);
        let unwrap = |holder_key: &SymmKey, wrapped: &[u8]| {
            KeyRing::unwrap_key(holder_key, wrapped)
                .ok()
                .filter(|key| key.len() == key_size)
        };

        // master key
        let mut resolved = entries
            .iter()
            .filter(|entry| entry.holder == KeyHolder::User(keyring.me))
            .find_map(|entry| unwrap(&keyring.master, &entry.wrapped));

        // share key of the nearest ancestor that has one
        if resolved.is_none() {
            let mut cursor = Some(*handle);
            while resolved.is_none() {
                let Some(ancestor) = cursor.and_then(|current| self.nodes.get(&current)) else {
                    break;
                };
                let current = ancestor.handle;
                if let Some(share_key) = &ancestor.share_key {
                    resolved = entries
                        .iter()
                        .filter(|entry| entry.holder == KeyHolder::Share(current))
                        .find_map(|entry| unwrap(share_key, &entry.wrapped));
                }
                cursor = ancestor.parent;
            }
        }

        // any other share this account holds a key for
        if resolved.is_none() {
            resolved = entries.iter().find_map(|entry| match entry.holder {
                KeyHolder::Share(share) => self
                    .nodes
                    .get(&share)
                    .and_then(|n| n.share_key.as_ref())
                    .and_then(|share_key| unwrap(share_key, &entry.wrapped)),
                KeyHolder::User(_) => None,
            });
        }

        match resolved {
            Some(key) => {
                if let Some(node) = self.get_mut(handle) {
                    node.key = KeyState::Ready(key);
                }
                self.undecrypted.remove(handle);
                self.decrypt_attributes(handle);
                true
            }
            None => {
                tracing::debug!(node = %handle, "node key not yet decryptable");
                self.undecrypted.insert(*handle);
                false
            }
        }
    }

    /// Retry every undecrypted node; returns those that became usable
    pub fn apply_keys(&mut self, keyring: &KeyRing) -> Vec<NodeHandle> {
        let pending: Vec<NodeHandle> = self.undecrypted.iter().copied().collect();
        pending
            .into_iter()
            .filter(|handle| self.apply_key(handle, keyring))
            .collect()
    }

    /// Install the share key of a node and retry pending keys
    pub fn set_share_key(
        &mut self,
        handle: &NodeHandle,
        key: SymmKey,
        keyring: &KeyRing,
    ) -> Result<Vec<NodeHandle>, GraphError> {
        let node = self
            .get_mut(handle)
            .ok_or(GraphError::NotFound(*handle))?;
        node.share_key = Some(key);
        Ok(self.apply_keys(keyring))
    }

    /// Decode the attribute blob once the key is usable
    pub fn decrypt_attributes(&mut self, handle: &NodeHandle) {
        let Some(node) = self.nodes.get(handle) else {
            return;
        };
        let NodeAttributes::Encrypted(blob) = &node.attributes else {
            self.set_fingerprint(handle);
            return;
        };
        let Some(key) = node.key_bytes().and_then(|k| attribute_key(k).ok()) else {
            return;
        };
        let attributes = match decrypt_attributes(blob, &key) {
            Ok(attrs) => NodeAttributes::Decrypted(attrs),
            Err(e) => {
                tracing::warn!(node = %handle, "attributes failed to decrypt: {}", e);
                NodeAttributes::Undecryptable(blob.clone())
            }
        };
        if let Some(node) = self.get_mut(handle) {
            node.attributes = attributes;
        }
        self.set_fingerprint(handle);
    }

    /// Replace the encrypted attribute blob (remote update)
    pub fn set_attribute_blob(&mut self, handle: &NodeHandle, blob: Vec<u8>) -> Result<(), GraphError> {
        let node = self
            .get_mut(handle)
            .ok_or(GraphError::NotFound(*handle))?;
        node.attributes = NodeAttributes::Encrypted(blob);
        self.decrypt_attributes(handle);
        Ok(())
    }

    /// Replace decrypted attributes (local update)
    pub fn set_attributes(&mut self, handle: &NodeHandle, attrs: AttrMap) -> Result<(), GraphError> {
        let node = self
            .get_mut(handle)
            .ok_or(GraphError::NotFound(*handle))?;
        node.attributes = NodeAttributes::Decrypted(attrs);
        self.set_fingerprint(handle);
        Ok(())
    }

    /// Recompute the fingerprint index entry of a file node
    pub fn set_fingerprint(&mut self, handle: &NodeHandle) {
        let Some(node) = self.nodes.get_mut(handle) else {
            return;
        };
        if let Some(old) = node.fingerprint.take() {
            if let Some(set) = self.fingerprints.get_mut(&old) {
                set.remove(handle);
                if set.is_empty() {
                    self.fingerprints.remove(&old);
                }
            }
        }
        if !node.node_type.is_file() {
            return;
        }
        let Some(key) = node.key_bytes().filter(|k| k.len() == FILE_KEY_SIZE) else {
            return;
        };
        let from_attribute = node
            .attrs()
            .and_then(|attrs| attrs.get(ATTR_FINGERPRINT))
            .and_then(|value| FileFingerprint::from_attribute(value, node.size));
        let fingerprint = from_attribute.unwrap_or_else(|| {
            let mut crc = [0u8; CRC_SIZE];
            crc.copy_from_slice(&key[..CRC_SIZE]);
            FileFingerprint {
                size: node.size,
                mtime: node.mtime,
                crc,
                valid: false,
            }
        });
        node.fingerprint = Some(fingerprint);
        self.fingerprints
            .entry(fingerprint)
            .or_default()
            .insert(*handle);
    }

    /* Structure */

    /// Move a node below a new parent, keeping both link directions in step.
    /// Returns the previous parent.
    pub fn move_node(
        &mut self,
        handle: &NodeHandle,
        new_parent: &NodeHandle,
    ) -> Result<Option<NodeHandle>, GraphError> {
        let parent = self
            .nodes
            .get(new_parent)
            .ok_or(GraphError::NotFound(*new_parent))?;
        if !parent.node_type.is_container() {
            return Err(GraphError::NotAContainer(*new_parent));
        }
        if !self.nodes.contains_key(handle) {
            return Err(GraphError::NotFound(*handle));
        }
        if self.is_below(new_parent, handle) {
            return Err(GraphError::Cycle(*handle));
        }

        let old_parent = self.nodes.get(handle).and_then(|node| node.parent);
        if let Some(old) = old_parent {
            if let Some(set) = self.children.get_mut(&old) {
                set.remove(handle);
            }
        }
        self.children.entry(*new_parent).or_default().insert(*handle);
        if let Some(node) = self.get_mut(handle) {
            node.parent = Some(*new_parent);
        }
        Ok(old_parent)
    }

    /// Detach and free a subtree, children first.
    ///
    /// The removed nodes are returned in removal order so the caller can
    /// release whatever it has bound to them.
    pub fn remove_subtree(&mut self, handle: &NodeHandle) -> Vec<Node> {
        let mut order = Vec::new();
        let mut stack = vec![(*handle, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            stack.push((current, true));
            if let Some(children) = self.children.get(&current) {
                stack.extend(children.iter().map(|child| (*child, false)));
            }
        }

        let mut removed = Vec::with_capacity(order.len());
        for current in order {
            self.children.remove(&current);
            self.undecrypted.remove(&current);
            self.dirty.remove(&current);
            for waiting in self.awaiting_parent.values_mut() {
                waiting.remove(&current);
            }
            let Some(mut node) = self.nodes.remove(&current) else {
                continue;
            };
            if let Some(parent) = node.parent {
                if let Some(set) = self.children.get_mut(&parent) {
                    set.remove(&current);
                }
            }
            if let Some(fingerprint) = node.fingerprint {
                if let Some(set) = self.fingerprints.get_mut(&fingerprint) {
                    set.remove(&current);
                    if set.is_empty() {
                        self.fingerprints.remove(&fingerprint);
                    }
                }
            }
            if self.roots.get(&node.node_type) == Some(&current) {
                self.roots.remove(&node.node_type);
            }
            if let Some(db_id) = node.db_id {
                self.purged_records.push(db_id);
            }
            node.share_key = None;
            removed.push(node);
        }
        self.awaiting_parent.retain(|_, waiting| !waiting.is_empty());
        removed
    }

    /* Persistence bookkeeping */

    pub(crate) fn take_dirty(&mut self) -> Vec<NodeHandle> {
        std::mem::take(&mut self.dirty).into_iter().collect()
    }

    pub(crate) fn take_purged_records(&mut self) -> Vec<u32> {
        std::mem::take(&mut self.purged_records)
    }

    pub(crate) fn set_db_id(&mut self, handle: &NodeHandle, db_id: u32) {
        if let Some(node) = self.nodes.get_mut(handle) {
            node.db_id = Some(db_id);
        }
    }

    /// Parent/child pairs, sorted; used to compare graph shapes
    pub fn linkage(&self) -> Vec<(NodeHandle, Vec<NodeHandle>)> {
        let mut out: Vec<(NodeHandle, Vec<NodeHandle>)> = self
            .children
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(parent, set)| (*parent, set.iter().copied().collect()))
            .collect();
        out.sort();
        out
    }
}

/// Open a share key delivered by the service
pub fn resolve_share_key(
    delivery: &ShareKeyDelivery,
    keyring: &KeyRing,
    handle: &NodeHandle,
) -> Option<SymmKey> {
    let opened = match delivery {
        ShareKeyDelivery::Master(wrapped) => KeyRing::unwrap_key(&keyring.master, wrapped)
            .and_then(|key| SymmKey::try_from(key.as_slice())),
        ShareKeyDelivery::Sealed(envelope) => match &keyring.identity {
            Some(identity) => envelope.open(identity),
            None => return None,
        },
    };
    match opened {
        Ok(key) => Some(key),
        Err(e) => {
            tracing::warn!(node = %handle, "share key could not be opened: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::crypto::encrypt_attributes;
    use crate::transport::KeyEntry;
    use crate::types::UserHandle;

    fn keyring() -> KeyRing {
        KeyRing::new(UserHandle::from_u64(1), SymmKey::from([1u8; 16]))
    }

    fn h(v: u64) -> NodeHandle {
        NodeHandle::from_u64(v)
    }

    fn folder(handle: u64, parent: u64, name: &str, ring: &KeyRing) -> RemoteNode {
        let key = [handle as u8; 16];
        let mut attrs = AttrMap::new();
        attrs.insert(ATTR_NAME.to_string(), name.to_string());
        RemoteNode {
            handle: h(handle),
            parent: Some(h(parent)),
            node_type: NodeType::Folder,
            size: -1,
            owner: ring.me,
            ctime: 0,
            mtime: 0,
            keys: vec![KeyEntry {
                holder: KeyHolder::User(ring.me),
                wrapped: KeyRing::wrap_key(&ring.master, &key).unwrap(),
            }],
            attrs: encrypt_attributes(&attrs, &SymmKey::from(key)).unwrap(),
            file_attributes: String::new(),
            share: None,
        }
    }

    fn root(handle: u64) -> RemoteNode {
        RemoteNode {
            handle: h(handle),
            parent: None,
            node_type: NodeType::Root,
            size: -1,
            owner: UserHandle::from_u64(1),
            ctime: 0,
            mtime: 0,
            keys: Vec::new(),
            attrs: Vec::new(),
            file_attributes: String::new(),
            share: None,
        }
    }

    #[test]
    fn test_child_before_parent_is_linked() {
        let ring = keyring();
        let mut graph = NodeGraph::new();
        let report = graph.ingest_remote(
            vec![
                folder(3, 2, "inner", &ring),
                folder(2, 1, "outer", &ring),
                root(1),
            ],
            &ring,
        );
        assert!(report.rejected.is_empty());
        assert_eq!(graph.child_handles(&h(1)), vec![h(2)]);
        assert_eq!(graph.child_handles(&h(2)), vec![h(3)]);
        assert_eq!(graph.path(&h(3)), "/ROOT/outer/inner");
    }

    #[test]
    fn test_unresolved_parent_is_rejected() {
        let ring = keyring();
        let mut graph = NodeGraph::new();
        let report = graph.ingest_remote(vec![root(1), folder(5, 4, "lost", &ring)], &ring);
        assert_eq!(report.rejected.len(), 1);
        assert!(matches!(
            report.rejected[0],
            GraphError::UnresolvedParent { .. }
        ));
        assert!(!graph.contains(&h(5)));
    }

    #[test]
    fn test_reparent_to_later_sibling_in_batch() {
        let ring = keyring();
        let mut graph = NodeGraph::new();
        graph.ingest_remote(vec![root(1), folder(2, 1, "a", &ring)], &ring);

        let report = graph.ingest_remote(
            vec![folder(2, 3, "a", &ring), folder(3, 1, "b", &ring)],
            &ring,
        );
        assert!(report.rejected.is_empty());
        assert_eq!(graph.child_handles(&h(1)), vec![h(3)]);
        assert_eq!(graph.child_handles(&h(3)), vec![h(2)]);
        assert_eq!(graph.path(&h(2)), "/ROOT/b/a");
    }

    #[test]
    fn test_reparent_below_own_child_is_rejected() {
        let ring = keyring();
        let mut graph = NodeGraph::new();
        graph.ingest_remote(vec![root(1), folder(2, 1, "a", &ring)], &ring);

        let report = graph.ingest_remote(
            vec![folder(2, 3, "a", &ring), folder(3, 2, "b", &ring)],
            &ring,
        );
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.dropped.len(), 2);
        assert!(!graph.contains(&h(2)));
        assert!(!graph.contains(&h(3)));
        assert!(graph.child_handles(&h(1)).is_empty());
    }

    #[test]
    fn test_move_rejects_cycles() {
        let ring = keyring();
        let mut graph = NodeGraph::new();
        graph.ingest_remote(
            vec![root(1), folder(2, 1, "a", &ring), folder(3, 2, "b", &ring)],
            &ring,
        );
        assert!(matches!(
            graph.move_node(&h(2), &h(3)),
            Err(GraphError::Cycle(_))
        ));
        assert_eq!(graph.move_node(&h(3), &h(1)).unwrap(), Some(h(2)));
        assert!(graph.child_handles(&h(2)).is_empty());
        assert_eq!(graph.child_handles(&h(1)), vec![h(2), h(3)]);
    }

    #[test]
    fn test_undecryptable_key_stays_pending_until_share_key() {
        let ring = keyring();
        let share_key = SymmKey::from([9u8; 16]);
        let mut graph = NodeGraph::new();

        let mut shared = folder(2, 1, "shared", &ring);
        let mut inner = folder(3, 2, "inner", &ring);
        let inner_key = [3u8; 16];
        inner.keys = vec![KeyEntry {
            holder: KeyHolder::Share(h(2)),
            wrapped: KeyRing::wrap_key(&share_key, &inner_key).unwrap(),
        }];
        shared.share = None;
        graph.ingest_remote(vec![root(1), shared, inner], &ring);

        assert_eq!(graph.get(&h(3)).unwrap().display_name(), NO_KEY_NAME);
        assert!(graph.undecrypted().any(|x| *x == h(3)));

        let decrypted = graph.set_share_key(&h(2), share_key, &ring).unwrap();
        assert_eq!(decrypted, vec![h(3)]);
        assert_eq!(graph.get(&h(3)).unwrap().name(), Some("inner"));
    }

    #[test]
    fn test_remove_subtree_releases_indexes() {
        let ring = keyring();
        let mut graph = NodeGraph::new();
        graph.ingest_remote(
            vec![root(1), folder(2, 1, "a", &ring), folder(3, 2, "b", &ring)],
            &ring,
        );
        let removed = graph.remove_subtree(&h(2));
        let order: Vec<NodeHandle> = removed.iter().map(|n| n.handle).collect();
        assert_eq!(order, vec![h(3), h(2)]);
        assert!(graph.child_handles(&h(1)).is_empty());
        assert_eq!(graph.len(), 1);
    }
}
