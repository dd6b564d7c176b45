use std::fmt;

use serde::{Deserialize, Serialize};

/// Logical clock unit: deciseconds since the engine's clock started.
pub type Ds = u32;

/// Size of a remote node handle in bytes
pub const NODE_HANDLE_SIZE: usize = 6;
/// Size of an account (user) handle in bytes
pub const USER_HANDLE_SIZE: usize = 8;

/// Opaque, stable identifier of a remote node.
///
/// Handles are 48 bits wide. The all-ones value is reserved to mean
/// "no node" and is what an unbound or parentless record carries on disk.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeHandle([u8; NODE_HANDLE_SIZE]);

impl NodeHandle {
    pub const UNDEF: NodeHandle = NodeHandle([0xff; NODE_HANDLE_SIZE]);

    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; NODE_HANDLE_SIZE];
        bytes.copy_from_slice(&value.to_le_bytes()[..NODE_HANDLE_SIZE]);
        NodeHandle(bytes)
    }

    pub fn as_u64(&self) -> u64 {
        let mut buff = [0u8; 8];
        buff[..NODE_HANDLE_SIZE].copy_from_slice(&self.0);
        u64::from_le_bytes(buff)
    }

    pub fn is_undef(&self) -> bool {
        *self == Self::UNDEF
    }

    pub fn to_bytes(&self) -> [u8; NODE_HANDLE_SIZE] {
        self.0
    }

    /// Map the on-disk representation back to an optional handle
    pub fn from_record(bytes: [u8; NODE_HANDLE_SIZE]) -> Option<Self> {
        let handle = NodeHandle(bytes);
        (!handle.is_undef()).then_some(handle)
    }
}

impl From<[u8; NODE_HANDLE_SIZE]> for NodeHandle {
    fn from(bytes: [u8; NODE_HANDLE_SIZE]) -> Self {
        NodeHandle(bytes)
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHandle({})", self)
    }
}

/// Identifier of an account.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
pub struct UserHandle([u8; USER_HANDLE_SIZE]);

impl UserHandle {
    pub fn from_u64(value: u64) -> Self {
        UserHandle(value.to_le_bytes())
    }

    pub fn as_u64(&self) -> u64 {
        u64::from_le_bytes(self.0)
    }

    pub fn to_bytes(&self) -> [u8; USER_HANDLE_SIZE] {
        self.0
    }
}

impl From<[u8; USER_HANDLE_SIZE]> for UserHandle {
    fn from(bytes: [u8; USER_HANDLE_SIZE]) -> Self {
        UserHandle(bytes)
    }
}

impl fmt::Display for UserHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for UserHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserHandle({})", self)
    }
}

/// Kind of a remote or local node.
///
/// The discriminant doubles as the negative size tag written into
/// serialized records for anything that is not a file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    File = 0,
    Folder = 1,
    Root = 2,
    Incoming = 3,
    Rubbish = 4,
}

impl NodeType {
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            0 => Some(NodeType::File),
            1 => Some(NodeType::Folder),
            2 => Some(NodeType::Root),
            3 => Some(NodeType::Incoming),
            4 => Some(NodeType::Rubbish),
            _ => None,
        }
    }

    pub fn tag(&self) -> i64 {
        *self as i64
    }

    pub fn is_file(&self) -> bool {
        matches!(self, NodeType::File)
    }

    /// Anything that can hold children
    pub fn is_container(&self) -> bool {
        !self.is_file()
    }

    pub fn is_root(&self) -> bool {
        matches!(self, NodeType::Root | NodeType::Incoming | NodeType::Rubbish)
    }
}

/// Encode a node's size (files) or negated type tag (everything else).
pub fn size_or_type(node_type: NodeType, size: i64) -> i64 {
    if node_type.is_file() {
        size
    } else {
        -node_type.tag()
    }
}

/// Decode the leading field of a node or local node record.
pub fn split_size_or_type(value: i64) -> Option<(NodeType, i64)> {
    if value < 0 {
        NodeType::from_tag(-value).map(|t| (t, -1))
    } else {
        Some((NodeType::File, value))
    }
}

/// Transfer direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Direction {
    Get,
    Put,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Put, Direction::Get];
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Get => write!(f, "download"),
            Direction::Put => write!(f, "upload"),
        }
    }
}

/// Synchronization state of a local node, rolled up to its ancestors.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum TreeState {
    #[default]
    None,
    Synced,
    Pending,
    Syncing,
}

/// Lifecycle of a sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncState {
    Canceled,
    InitialScan,
    Active,
    Failed,
}

impl SyncState {
    pub fn is_running(&self) -> bool {
        matches!(self, SyncState::InitialScan | SyncState::Active)
    }
}

/// Filesystem-assigned identity of a local file or directory.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fsid(pub u64);

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty)) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

id_type!(
    /// Identifier of a configured sync
    SyncId(u32)
);
id_type!(
    /// Identifier of a logical transfer
    TransferId(u64)
);
id_type!(
    /// Identifier of a request handed to the transport
    RequestId(u64)
);
id_type!(
    /// Identifier of one party interested in a transfer's outcome
    RequesterId(u64)
);

/// Arena id of a local node.
///
/// The owning sync is encoded in the upper half so ids stay unique
/// across every local tree the client holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalId(u64);

impl LocalId {
    pub fn new(sync: SyncId, index: u32) -> Self {
        LocalId(((sync.0 as u64) << 32) | index as u64)
    }

    pub fn sync(&self) -> SyncId {
        SyncId((self.0 >> 32) as u32)
    }

    pub fn index(&self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.sync(), self.index())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_node_handle_u64() {
        let handle = NodeHandle::from_u64(0x0000_1234_5678_9abc);
        assert_eq!(handle.as_u64(), 0x1234_5678_9abc);
        assert!(!handle.is_undef());
        assert_eq!(NodeHandle::from_record(NodeHandle::UNDEF.to_bytes()), None);
    }

    #[test]
    fn test_size_or_type() {
        assert_eq!(size_or_type(NodeType::File, 42), 42);
        assert_eq!(size_or_type(NodeType::Rubbish, 42), -4);
        assert_eq!(split_size_or_type(-1), Some((NodeType::Folder, -1)));
        assert_eq!(split_size_or_type(7), Some((NodeType::File, 7)));
        assert_eq!(split_size_or_type(-9), None);
    }

    #[test]
    fn test_local_id_encodes_sync() {
        let id = LocalId::new(SyncId(3), 17);
        assert_eq!(id.sync(), SyncId(3));
        assert_eq!(id.index(), 17);
    }
}
