//! The local filesystem mirror of one sync
//!
//! Entries live in an arena keyed by [`LocalId`]. Each parent keeps its
//! children in a name-ordered map, which is what makes names unique within
//! a parent, and the tree keeps a cross index from filesystem identity
//! ([`Fsid`]) to the single entry that currently claims it.
//!
//! Deletion detection works in passes: listing a directory starts a new
//! generation, every entry found is marked seen, and entries of that
//! directory left unmarked are put in the not-seen set. They are only
//! removed once the scan queues drain, so an entry that turns up elsewhere
//! in the meantime (a move) is recovered instead of deleted.

mod cache;
mod local_node;
mod record;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};

pub use local_node::LocalNode;
pub use record::LocalRecord;

use crate::codec::CodecError;
use crate::fingerprint::FileFingerprint;
use crate::fs::FsStat;
use crate::types::{Fsid, LocalId, NodeType, SyncId, TreeState};

use cache::CacheQueues;

#[derive(Debug, thiserror::Error)]
pub enum LocalTreeError {
    #[error("local node not found: {0}")]
    NotFound(LocalId),
    #[error("local node {0} is not a folder")]
    NotAFolder(LocalId),
    #[error("cannot move {0} below itself")]
    Cycle(LocalId),
    #[error("record error: {0}")]
    Codec(#[from] CodecError),
    #[error("corrupt state cache: {0}")]
    Corrupt(String),
    #[error("store error: {0}")]
    Store(#[from] crate::persistence::StoreError),
    #[error("crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// How [`LocalTree::add_or_update`] matched a scanned entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddKind {
    Created,
    Existing,
    /// An entry with the same fsid was found elsewhere and moved here
    Moved { old_parent: LocalId, old_name: String },
}

#[derive(Debug)]
pub struct AddOutcome {
    pub id: LocalId,
    pub kind: AddKind,
    /// Entries removed because a different object took their name
    pub displaced: Vec<LocalNode>,
}

#[derive(Debug)]
pub struct LocalTree {
    sync: SyncId,
    root: LocalId,
    nodes: HashMap<LocalId, LocalNode>,
    children: HashMap<LocalId, BTreeMap<String, LocalId>>,
    short_names: HashMap<LocalId, BTreeMap<String, LocalId>>,
    fsids: HashMap<Fsid, LocalId>,
    not_seen: BTreeSet<LocalId>,
    generation: u32,
    next_index: u32,
    cache: CacheQueues,
}

impl LocalTree {
    pub fn new(sync: SyncId, root_name: &str, root_fsid: Option<Fsid>) -> Self {
        let root = LocalId::new(sync, 1);
        let mut node = LocalNode::new(root, None, NodeType::Folder, root_name.to_string());
        node.fsid = root_fsid;
        let mut tree = Self {
            sync,
            root,
            nodes: HashMap::new(),
            children: HashMap::new(),
            short_names: HashMap::new(),
            fsids: HashMap::new(),
            not_seen: BTreeSet::new(),
            generation: 0,
            next_index: 2,
            cache: CacheQueues::default(),
        };
        if let Some(fsid) = root_fsid {
            tree.fsids.insert(fsid, root);
        }
        tree.nodes.insert(root, node);
        tree.cache.inserts.insert(root);
        tree
    }

    /* Getters */

    pub fn sync(&self) -> SyncId {
        self.sync
    }

    pub fn root(&self) -> LocalId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &LocalId) -> Option<&LocalNode> {
        self.nodes.get(id)
    }

    /// Mutable access for transient state; call [`LocalTree::touch`] after
    /// changing anything that is persisted
    pub fn get_mut(&mut self, id: &LocalId) -> Option<&mut LocalNode> {
        self.nodes.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LocalNode> {
        self.nodes.values()
    }

    /// Children ids in name order
    pub fn child_ids(&self, parent: &LocalId) -> Vec<LocalId> {
        self.children
            .get(parent)
            .map(|map| map.values().copied().collect())
            .unwrap_or_default()
    }

    pub fn child_by_name(&self, parent: &LocalId, name: &str) -> Option<LocalId> {
        self.children
            .get(parent)
            .and_then(|map| map.get(name))
            .or_else(|| self.short_names.get(parent).and_then(|map| map.get(name)))
            .copied()
    }

    pub fn by_fsid(&self, fsid: &Fsid) -> Option<LocalId> {
        self.fsids.get(fsid).copied()
    }

    /// Path relative to the sync root (empty for the root itself)
    pub fn path(&self, id: &LocalId) -> PathBuf {
        let mut parts = Vec::new();
        let mut cursor = self.nodes.get(id);
        while let Some(node) = cursor {
            let Some(parent) = node.parent else {
                break;
            };
            parts.push(node.name.as_str());
            cursor = self.nodes.get(&parent);
        }
        parts.iter().rev().collect()
    }

    /// Resolve a path relative to the sync root
    pub fn lookup(&self, rel: &Path) -> Option<LocalId> {
        let mut current = self.root;
        for component in rel.components() {
            match component {
                Component::Normal(name) => {
                    current = self.child_by_name(&current, name.to_str()?)?;
                }
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(current)
    }

    /// Whether `id` is `ancestor` or lies below it
    pub fn is_below(&self, id: &LocalId, ancestor: &LocalId) -> bool {
        let mut cursor = Some(*id);
        while let Some(current) = cursor {
            if current == *ancestor {
                return true;
            }
            cursor = self.nodes.get(&current).and_then(|n| n.parent);
        }
        false
    }

    /* Scanning */

    /// Create or update the entry for a scanned filesystem object.
    ///
    /// An entry with the same fsid elsewhere in the tree is treated as a
    /// move (files must also keep size and mtime); anything of a different
    /// type occupying the name is displaced.
    pub fn add_or_update(
        &mut self,
        parent: LocalId,
        name: &str,
        short_name: Option<String>,
        stat: &FsStat,
    ) -> Result<AddOutcome, LocalTreeError> {
        let parent_node = self
            .nodes
            .get(&parent)
            .ok_or(LocalTreeError::NotFound(parent))?;
        if parent_node.is_file() {
            return Err(LocalTreeError::NotAFolder(parent));
        }
        let mut displaced = Vec::new();

        if let Some(holder) = stat.fsid.and_then(|fsid| self.fsids.get(&fsid).copied()) {
            if let Some(moved) = self.try_fsid_move(holder, parent, name, stat, &mut displaced)? {
                return Ok(AddOutcome {
                    id: holder,
                    kind: moved,
                    displaced,
                });
            }
        }

        if let Some(existing) = self.children.get(&parent).and_then(|m| m.get(name)).copied() {
            let same_type = self
                .nodes
                .get(&existing)
                .map(|n| n.node_type == stat.node_type)
                .unwrap_or(false);
            if same_type {
                self.mark_seen(&existing);
                if let Some(node) = self.nodes.get_mut(&existing) {
                    if node.short_name != short_name {
                        node.short_name = short_name.clone();
                    }
                }
                self.index_short_name(existing, parent, short_name);
                if stat.fsid.is_some() && self.nodes.get(&existing).and_then(|n| n.fsid) != stat.fsid {
                    self.bind_fsid(&existing, stat.fsid);
                }
                return Ok(AddOutcome {
                    id: existing,
                    kind: AddKind::Existing,
                    displaced,
                });
            }
            displaced.extend(self.remove(&existing));
        }

        let id = LocalId::new(self.sync, self.next_index);
        self.next_index += 1;
        let mut node = LocalNode::new(id, Some(parent), stat.node_type, name.to_string());
        node.short_name = short_name.clone();
        node.seen = self.generation;
        if stat.node_type.is_file() {
            node.size = stat.size;
        }
        self.nodes.insert(id, node);
        self.children
            .entry(parent)
            .or_default()
            .insert(name.to_string(), id);
        self.index_short_name(id, parent, short_name);
        self.bind_fsid(&id, stat.fsid);
        self.cache.inserts.insert(id);
        Ok(AddOutcome {
            id,
            kind: AddKind::Created,
            displaced,
        })
    }

    fn try_fsid_move(
        &mut self,
        holder: LocalId,
        parent: LocalId,
        name: &str,
        stat: &FsStat,
        displaced: &mut Vec<LocalNode>,
    ) -> Result<Option<AddKind>, LocalTreeError> {
        let Some(node) = self.nodes.get(&holder) else {
            return Ok(None);
        };
        let Some(old_parent) = node.parent else {
            return Ok(None);
        };
        if node.node_type != stat.node_type {
            return Ok(None);
        }
        if node.is_file()
            && (node.size != stat.size || (node.fingerprint.valid && node.fingerprint.mtime != stat.mtime))
        {
            return Ok(None);
        }
        if old_parent == parent && node.name == name {
            return Ok(None);
        }
        if self.is_below(&parent, &holder) {
            return Ok(None);
        }

        let old_name = node.name.clone();
        if let Some(occupant) = self.children.get(&parent).and_then(|m| m.get(name)).copied() {
            displaced.extend(self.remove(&occupant));
        }
        self.move_to(&holder, parent, name)?;
        self.mark_seen(&holder);
        Ok(Some(AddKind::Moved {
            old_parent,
            old_name,
        }))
    }

    fn index_short_name(&mut self, id: LocalId, parent: LocalId, short_name: Option<String>) {
        if let Some(map) = self.short_names.get_mut(&parent) {
            map.retain(|_, v| *v != id);
        }
        if let Some(short) = short_name {
            self.short_names.entry(parent).or_default().insert(short, id);
        }
    }

    /// Reparent and/or rename an entry
    pub fn move_to(
        &mut self,
        id: &LocalId,
        new_parent: LocalId,
        new_name: &str,
    ) -> Result<(), LocalTreeError> {
        if self.is_below(&new_parent, id) {
            return Err(LocalTreeError::Cycle(*id));
        }
        let node = self.nodes.get(id).ok_or(LocalTreeError::NotFound(*id))?;
        let old_parent = node.parent;
        let old_name = node.name.clone();
        if let Some(old_parent) = old_parent {
            if let Some(map) = self.children.get_mut(&old_parent) {
                if map.get(&old_name) == Some(id) {
                    map.remove(&old_name);
                }
            }
            if let Some(map) = self.short_names.get_mut(&old_parent) {
                map.retain(|_, v| v != id);
            }
        }
        self.children
            .entry(new_parent)
            .or_default()
            .insert(new_name.to_string(), *id);
        if let Some(node) = self.nodes.get_mut(id) {
            node.parent = Some(new_parent);
            node.name = new_name.to_string();
            node.short_name = None;
        }
        self.cache.inserts.insert(*id);
        Ok(())
    }

    /// Assign an fsid, revoking it from any other entry.
    /// Returns the entry that lost it.
    pub fn bind_fsid(&mut self, id: &LocalId, fsid: Option<Fsid>) -> Option<LocalId> {
        let previous = self.nodes.get(id).and_then(|n| n.fsid);
        if let Some(previous) = previous {
            if self.fsids.get(&previous) == Some(id) {
                self.fsids.remove(&previous);
            }
        }
        let mut revoked = None;
        if let Some(fsid) = fsid {
            if let Some(holder) = self.fsids.insert(fsid, *id) {
                if holder != *id {
                    if let Some(node) = self.nodes.get_mut(&holder) {
                        node.fsid = None;
                    }
                    self.cache.inserts.insert(holder);
                    revoked = Some(holder);
                }
            }
        }
        if let Some(node) = self.nodes.get_mut(id) {
            node.fsid = fsid;
        }
        self.cache.inserts.insert(*id);
        revoked
    }

    pub fn set_fingerprint(&mut self, id: &LocalId, fingerprint: FileFingerprint) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.size = fingerprint.size;
            node.fingerprint = fingerprint;
            self.cache.inserts.insert(*id);
        }
    }

    /// Start a listing pass; returns the new generation
    pub fn begin_pass(&mut self) -> u32 {
        self.generation = self.generation.wrapping_add(1);
        self.generation
    }

    pub fn mark_seen(&mut self, id: &LocalId) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.seen = self.generation;
        }
        self.not_seen.remove(id);
    }

    /// Put every child of `dir` not marked in the current pass in the not-seen set.
    /// Returns the newly unseen entries.
    pub fn sweep_unseen(&mut self, dir: &LocalId) -> Vec<LocalId> {
        let unseen: Vec<LocalId> = self
            .child_ids(dir)
            .into_iter()
            .filter(|child| {
                self.nodes
                    .get(child)
                    .map(|n| n.seen != self.generation)
                    .unwrap_or(false)
            })
            .collect();
        for child in &unseen {
            self.not_seen.insert(*child);
        }
        unseen
    }

    pub fn set_not_seen(&mut self, id: &LocalId, not_seen: bool) {
        if not_seen {
            if self.nodes.contains_key(id) {
                self.not_seen.insert(*id);
            }
        } else {
            self.not_seen.remove(id);
        }
    }

    pub fn is_not_seen(&self, id: &LocalId) -> bool {
        self.not_seen.contains(id)
    }

    /// Not-seen entries whose parent is not itself not-seen
    pub fn unseen_tops(&self) -> Vec<LocalId> {
        self.not_seen
            .iter()
            .filter(|id| {
                let mut cursor = self.nodes.get(*id).and_then(|n| n.parent);
                while let Some(parent) = cursor {
                    if self.not_seen.contains(&parent) {
                        return false;
                    }
                    cursor = self.nodes.get(&parent).and_then(|n| n.parent);
                }
                true
            })
            .copied()
            .collect()
    }

    pub fn has_unseen(&self) -> bool {
        !self.not_seen.is_empty()
    }

    /// Whether any remote creation is still outstanding
    pub fn creating(&self) -> bool {
        self.nodes.values().any(|n| n.created)
    }

    /* Removal */

    /// Remove an entry and everything below it, children first.
    pub fn remove(&mut self, id: &LocalId) -> Vec<LocalNode> {
        let mut order = Vec::new();
        let mut stack = vec![(*id, false)];
        while let Some((current, expanded)) = stack.pop() {
            if expanded {
                order.push(current);
                continue;
            }
            stack.push((current, true));
            if let Some(children) = self.children.get(&current) {
                stack.extend(children.values().map(|child| (*child, false)));
            }
        }

        let mut removed = Vec::with_capacity(order.len());
        for current in order {
            self.children.remove(&current);
            self.short_names.remove(&current);
            self.not_seen.remove(&current);
            self.cache.inserts.remove(&current);
            let Some(node) = self.nodes.remove(&current) else {
                continue;
            };
            if let Some(parent) = node.parent {
                if let Some(map) = self.children.get_mut(&parent) {
                    if map.get(&node.name) == Some(&current) {
                        map.remove(&node.name);
                    }
                }
                if let Some(map) = self.short_names.get_mut(&parent) {
                    map.retain(|_, v| *v != current);
                }
            }
            if let Some(fsid) = node.fsid {
                if self.fsids.get(&fsid) == Some(&current) {
                    self.fsids.remove(&fsid);
                }
            }
            if let Some(db_id) = node.db_id {
                self.cache.deletes.insert(db_id);
            }
            removed.push(node);
        }
        removed
    }

    /* Tree state */

    /// Set an entry's state and roll the change up through its ancestors.
    /// Returns every entry whose state changed.
    pub fn set_tree_state(&mut self, id: &LocalId, state: TreeState) -> Vec<(LocalId, TreeState)> {
        let mut changes = Vec::new();
        let Some(node) = self.nodes.get_mut(id) else {
            return changes;
        };
        if node.tree_state != state {
            node.tree_state = state;
            changes.push((*id, state));
        }
        let mut cursor = node.parent;
        while let Some(parent) = cursor {
            let rolled = if state == TreeState::Syncing {
                TreeState::Syncing
            } else {
                self.aggregate_state(&parent)
            };
            let Some(node) = self.nodes.get_mut(&parent) else {
                break;
            };
            if node.tree_state == rolled {
                break;
            }
            node.tree_state = rolled;
            changes.push((parent, rolled));
            cursor = node.parent;
        }
        changes
    }

    fn aggregate_state(&self, parent: &LocalId) -> TreeState {
        let mut result = TreeState::Synced;
        for child in self.children.get(parent).into_iter().flat_map(|m| m.values()) {
            match self.nodes.get(child).map(|n| n.tree_state) {
                Some(TreeState::Syncing) => return TreeState::Syncing,
                Some(TreeState::Pending) => result = TreeState::Pending,
                _ => {}
            }
        }
        result
    }

    /// Mark an entry for rewriting in the state cache
    pub fn touch(&mut self, id: &LocalId) {
        if self.nodes.contains_key(id) {
            self.cache.inserts.insert(*id);
        }
    }

    fn attach_restored(&mut self, node: LocalNode) {
        let id = node.id;
        if let Some(parent) = node.parent {
            self.children
                .entry(parent)
                .or_default()
                .insert(node.name.clone(), id);
        }
        if let Some(fsid) = node.fsid {
            self.fsids.insert(fsid, id);
        }
        self.next_index = self.next_index.max(id.index() + 1);
        self.nodes.insert(id, node);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn stat(node_type: NodeType, size: i64, fsid: u64) -> FsStat {
        FsStat {
            node_type,
            size,
            mtime: 100,
            fsid: Some(Fsid(fsid)),
        }
    }

    fn tree() -> LocalTree {
        LocalTree::new(SyncId(1), "root", Some(Fsid(1)))
    }

    #[test]
    fn test_add_and_lookup() {
        let mut tree = tree();
        let root = tree.root();
        let dir = tree
            .add_or_update(root, "docs", None, &stat(NodeType::Folder, -1, 2))
            .unwrap();
        assert_eq!(dir.kind, AddKind::Created);
        let file = tree
            .add_or_update(dir.id, "a.txt", None, &stat(NodeType::File, 10, 3))
            .unwrap();
        assert_eq!(tree.lookup(Path::new("docs/a.txt")), Some(file.id));
        assert_eq!(tree.path(&file.id), PathBuf::from("docs/a.txt"));

        let again = tree
            .add_or_update(dir.id, "a.txt", None, &stat(NodeType::File, 10, 3))
            .unwrap();
        assert_eq!(again.kind, AddKind::Existing);
        assert_eq!(again.id, file.id);
    }

    #[test]
    fn test_rename_detected_by_fsid() {
        let mut tree = tree();
        let root = tree.root();
        let file = tree
            .add_or_update(root, "old.txt", None, &stat(NodeType::File, 10, 3))
            .unwrap();
        let renamed = tree
            .add_or_update(root, "new.txt", None, &stat(NodeType::File, 10, 3))
            .unwrap();
        assert_eq!(renamed.id, file.id);
        assert_eq!(
            renamed.kind,
            AddKind::Moved {
                old_parent: root,
                old_name: "old.txt".to_string()
            }
        );
        assert_eq!(tree.child_by_name(&root, "old.txt"), None);
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_fsid_revocation() {
        let mut tree = tree();
        let root = tree.root();
        let a = tree
            .add_or_update(root, "a", None, &stat(NodeType::File, 10, 5))
            .unwrap()
            .id;
        // different size: not a move, the new entry takes the fsid
        let b = tree
            .add_or_update(root, "b", None, &stat(NodeType::File, 99, 5))
            .unwrap()
            .id;
        assert_ne!(a, b);
        assert_eq!(tree.get(&a).unwrap().fsid, None);
        assert_eq!(tree.by_fsid(&Fsid(5)), Some(b));
        assert_eq!(tree.bind_fsid(&a, Some(Fsid(5))), Some(b));
        assert_eq!(tree.get(&b).unwrap().fsid, None);
    }

    #[test]
    fn test_type_change_displaces() {
        let mut tree = tree();
        let root = tree.root();
        let file = tree
            .add_or_update(root, "x", None, &stat(NodeType::File, 1, 7))
            .unwrap()
            .id;
        let outcome = tree
            .add_or_update(root, "x", None, &stat(NodeType::Folder, -1, 8))
            .unwrap();
        assert_eq!(outcome.kind, AddKind::Created);
        assert_eq!(outcome.displaced.len(), 1);
        assert_eq!(outcome.displaced[0].id, file);
    }

    #[test]
    fn test_sweep_unseen() {
        let mut tree = tree();
        let root = tree.root();
        let a = tree
            .add_or_update(root, "a", None, &stat(NodeType::File, 1, 2))
            .unwrap()
            .id;
        let b = tree
            .add_or_update(root, "b", None, &stat(NodeType::File, 1, 3))
            .unwrap()
            .id;
        tree.begin_pass();
        tree.mark_seen(&a);
        assert_eq!(tree.sweep_unseen(&root), vec![b]);
        assert!(tree.is_not_seen(&b));
        assert_eq!(tree.unseen_tops(), vec![b]);
        let removed = tree.remove(&b);
        assert_eq!(removed.len(), 1);
        assert!(!tree.has_unseen());
    }

    #[test]
    fn test_tree_state_rollup() {
        let mut tree = tree();
        let root = tree.root();
        let dir = tree
            .add_or_update(root, "d", None, &stat(NodeType::Folder, -1, 2))
            .unwrap()
            .id;
        let a = tree
            .add_or_update(dir, "a", None, &stat(NodeType::File, 1, 3))
            .unwrap()
            .id;
        let b = tree
            .add_or_update(dir, "b", None, &stat(NodeType::File, 1, 4))
            .unwrap()
            .id;
        tree.set_tree_state(&a, TreeState::Synced);
        tree.set_tree_state(&b, TreeState::Pending);
        assert_eq!(tree.get(&dir).unwrap().tree_state, TreeState::Pending);

        let changes = tree.set_tree_state(&a, TreeState::Syncing);
        assert!(changes.contains(&(root, TreeState::Syncing)));

        tree.set_tree_state(&a, TreeState::Synced);
        tree.set_tree_state(&b, TreeState::Synced);
        assert_eq!(tree.get(&root).unwrap().tree_state, TreeState::Synced);
    }
}
