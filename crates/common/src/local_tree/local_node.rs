use crate::fingerprint::FileFingerprint;
use crate::types::{Ds, Fsid, LocalId, NodeType, TransferId, TreeState};

/// One entry of the local mirror.
///
/// The bound remote node is not stored here; see [`crate::bindings::Bindings`].
#[derive(Debug, Clone)]
pub struct LocalNode {
    pub id: LocalId,
    pub parent: Option<LocalId>,
    pub node_type: NodeType,
    pub name: String,
    pub short_name: Option<String>,
    pub size: i64,
    pub fsid: Option<Fsid>,
    /// Content identity (files only)
    pub fingerprint: FileFingerprint,
    pub tree_state: TreeState,
    /// Pass generation in which the entry was last listed
    pub(crate) seen: u32,
    /// The bound remote node went away; the entry goes to local debris
    pub deleted: bool,
    /// A remote counterpart is being created
    pub created: bool,
    /// Moved or renamed locally; the bound node has not followed yet
    pub pending_move: bool,
    /// Upload in progress for this entry
    pub upload: Option<TransferId>,
    /// Earliest time an upload may start
    pub nagle_until: Ds,
    /// Persisted record id, once cached
    pub db_id: Option<u32>,
}

impl LocalNode {
    pub fn new(id: LocalId, parent: Option<LocalId>, node_type: NodeType, name: String) -> Self {
        Self {
            id,
            parent,
            node_type,
            name,
            short_name: None,
            size: if node_type.is_file() { 0 } else { -1 },
            fsid: None,
            fingerprint: FileFingerprint::default(),
            tree_state: TreeState::None,
            seen: 0,
            deleted: false,
            created: false,
            pending_move: false,
            upload: None,
            nagle_until: 0,
            db_id: None,
        }
    }

    pub fn is_file(&self) -> bool {
        self.node_type.is_file()
    }
}
