use crate::crypto::{attribute_key, AttrMap, FileKey, SymmKey};
use crate::fingerprint::FileFingerprint;
use crate::transport::{KeyEntry, RemoteNode, ShareRecord};
use crate::types::{NodeHandle, NodeType, UserHandle};

/// Display name of a node whose key or attributes could not be decrypted
pub const NO_KEY_NAME: &str = "NO_KEY";
/// Display name of a decrypted node that carries no name
pub const CRYPTO_ERROR_NAME: &str = "CRYPTO_ERROR";
/// Display name of a node with an empty name
pub const BLANK_NAME: &str = "BLANK";

/// Attribute name holding the node name
pub const ATTR_NAME: &str = "n";
/// Attribute name holding the encoded fingerprint
pub const ATTR_FINGERPRINT: &str = "c";

/// Content key of a node
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyState {
    /// Root types carry no key
    None,
    /// Wrapped copies that no known key could open yet
    Pending(Vec<KeyEntry>),
    /// Usable key bytes
    Ready(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeAttributes {
    /// Still encrypted, waiting for the key
    Encrypted(Vec<u8>),
    /// The key opened the blob but the magic prefix did not match
    Undecryptable(Vec<u8>),
    Decrypted(AttrMap),
}

/// Progress of a node being moved to the sync debris folder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncDeleted {
    #[default]
    None,
    /// Queued for relocation
    Deleted,
    /// Move request in flight
    InFlight,
    /// Waiting for the rubbish root to be known
    Bin,
    /// Waiting for the debris folder to be created
    Debris,
    /// Waiting for the day folder to be created
    DebrisDay,
}

/// A node of the remote tree.
///
/// Links to other nodes are stored as handles; the [`super::NodeGraph`]
/// owns the child index and keeps both directions consistent.
#[derive(Debug, Clone)]
pub struct Node {
    pub handle: NodeHandle,
    pub parent: Option<NodeHandle>,
    pub node_type: NodeType,
    pub size: i64,
    pub owner: UserHandle,
    pub ctime: i64,
    pub mtime: i64,
    pub key: KeyState,
    pub attributes: NodeAttributes,
    pub file_attributes: String,
    /// Derived once the key is available (files only)
    pub fingerprint: Option<FileFingerprint>,
    /// Key of the share rooted at this node, incoming or outgoing
    pub share_key: Option<SymmKey>,
    pub outshares: Vec<ShareRecord>,
    pub inshare: Option<ShareRecord>,
    pub sync_deleted: SyncDeleted,
    /// Persisted record id, once cached
    pub db_id: Option<u32>,
}

impl Node {
    pub fn new(handle: NodeHandle, parent: Option<NodeHandle>, node_type: NodeType) -> Self {
        Self {
            handle,
            parent,
            node_type,
            size: if node_type.is_file() { 0 } else { -1 },
            owner: UserHandle::default(),
            ctime: 0,
            mtime: 0,
            key: KeyState::None,
            attributes: NodeAttributes::Decrypted(AttrMap::new()),
            file_attributes: String::new(),
            fingerprint: None,
            share_key: None,
            outshares: Vec::new(),
            inshare: None,
            sync_deleted: SyncDeleted::None,
            db_id: None,
        }
    }

    /// Build a node from the service's description; share keys are resolved by the graph
    pub fn from_remote(remote: RemoteNode) -> Self {
        let key = if remote.node_type.is_root() {
            KeyState::None
        } else {
            KeyState::Pending(remote.keys)
        };
        let attributes = if remote.attrs.is_empty() {
            NodeAttributes::Decrypted(AttrMap::new())
        } else {
            NodeAttributes::Encrypted(remote.attrs)
        };
        let (outshares, inshare) = match remote.share {
            Some(share) if share.incoming => (Vec::new(), share.records.first().copied()),
            Some(share) => (share.records, None),
            None => (Vec::new(), None),
        };
        Self {
            handle: remote.handle,
            parent: remote.parent,
            node_type: remote.node_type,
            size: remote.size,
            owner: remote.owner,
            ctime: remote.ctime,
            mtime: remote.mtime,
            key,
            attributes,
            file_attributes: remote.file_attributes,
            fingerprint: None,
            share_key: None,
            outshares,
            inshare,
            sync_deleted: SyncDeleted::None,
            db_id: None,
        }
    }

    pub fn key_bytes(&self) -> Option<&[u8]> {
        match &self.key {
            KeyState::Ready(key) => Some(key),
            _ => None,
        }
    }

    pub fn has_key(&self) -> bool {
        matches!(self.key, KeyState::Ready(_) | KeyState::None)
    }

    pub fn attr_key(&self) -> Option<SymmKey> {
        self.key_bytes().and_then(|key| attribute_key(key).ok())
    }

    pub fn file_key(&self) -> Option<FileKey> {
        if !self.node_type.is_file() {
            return None;
        }
        self.key_bytes().and_then(|key| FileKey::from_bytes(key).ok())
    }

    pub fn attrs(&self) -> Option<&AttrMap> {
        match &self.attributes {
            NodeAttributes::Decrypted(attrs) => Some(attrs),
            _ => None,
        }
    }

    /// Decrypted name, if there is one
    pub fn name(&self) -> Option<&str> {
        self.attrs()
            .and_then(|attrs| attrs.get(ATTR_NAME))
            .map(String::as_str)
    }

    /// Name for display, with a placeholder when none is available
    pub fn display_name(&self) -> &str {
        if self.node_type.is_root() {
            return match self.node_type {
                NodeType::Root => "ROOT",
                NodeType::Incoming => "INBOX",
                _ => "RUBBISH",
            };
        }
        match &self.attributes {
            NodeAttributes::Decrypted(attrs) => match attrs.get(ATTR_NAME) {
                Some(name) if name.is_empty() => BLANK_NAME,
                Some(name) => name,
                None => CRYPTO_ERROR_NAME,
            },
            _ => NO_KEY_NAME,
        }
    }

    /// Fully decrypted and usable by the sync engine
    pub fn is_decrypted(&self) -> bool {
        self.has_key() && matches!(self.attributes, NodeAttributes::Decrypted(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_placeholder_names() {
        let mut node = Node::new(NodeHandle::from_u64(1), None, NodeType::File);
        node.attributes = NodeAttributes::Encrypted(vec![0; 16]);
        assert_eq!(node.display_name(), NO_KEY_NAME);

        node.attributes = NodeAttributes::Decrypted(AttrMap::new());
        assert_eq!(node.display_name(), CRYPTO_ERROR_NAME);

        let mut attrs = AttrMap::new();
        attrs.insert(ATTR_NAME.to_string(), String::new());
        node.attributes = NodeAttributes::Decrypted(attrs);
        assert_eq!(node.display_name(), BLANK_NAME);
    }
}
