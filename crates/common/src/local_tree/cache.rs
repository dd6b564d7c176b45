//! State cache of a local tree.
//!
//! Changed entries are queued and written parent-first, so every record
//! can name its parent's record id. Loading is two-phase: records are
//! grouped by parent id, then attached recursively from the root record.
//! Records the walk never reaches are discarded.

use std::collections::{BTreeSet, HashMap, VecDeque};

use super::{LocalNode, LocalRecord, LocalTree, LocalTreeError};
use crate::bindings::Bindings;
use crate::crypto::SymmKey;
use crate::persistence::StateStore;
use crate::types::{LocalId, NodeHandle, SyncId};

#[derive(Debug, Default)]
pub(super) struct CacheQueues {
    pub(super) inserts: BTreeSet<LocalId>,
    pub(super) deletes: BTreeSet<u32>,
}

impl LocalTree {
    pub fn cache_pending(&self) -> bool {
        !self.cache.inserts.is_empty() || !self.cache.deletes.is_empty()
    }

    /// Write queued changes. Entries whose parent has no record yet stay queued.
    pub fn flush_cache(
        &mut self,
        store: &mut dyn StateStore,
        table: &str,
        bindings: &Bindings,
        master: &SymmKey,
    ) -> Result<usize, LocalTreeError> {
        for db_id in std::mem::take(&mut self.cache.deletes) {
            store.del(table, db_id)?;
        }

        let mut written = 0;
        loop {
            let ready: Vec<(LocalId, u32)> = self
                .cache
                .inserts
                .iter()
                .filter_map(|id| {
                    let node = self.nodes.get(id)?;
                    match node.parent {
                        None => Some((*id, 0)),
                        Some(parent) => self
                            .nodes
                            .get(&parent)
                            .and_then(|p| p.db_id)
                            .map(|parent_db| (*id, parent_db)),
                    }
                })
                .collect();
            if ready.is_empty() {
                break;
            }
            for (id, parent_db) in ready {
                self.cache.inserts.remove(&id);
                let Some(node) = self.nodes.get(&id) else {
                    continue;
                };
                let record = node.serialize(parent_db, bindings.node_of(&id))?;
                let sealed = master.encrypt_padded(&record)?;
                let db_id = match node.db_id {
                    Some(db_id) => {
                        store.put(table, db_id, &sealed)?;
                        db_id
                    }
                    None => store.insert(table, &sealed)?,
                };
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.db_id = Some(db_id);
                }
                written += 1;
            }
        }
        Ok(written)
    }

    /// Rebuild a tree from its cached records.
    ///
    /// Returns the tree and the bindings the records carried.
    pub fn restore(
        sync: SyncId,
        records: Vec<(u32, Vec<u8>)>,
        master: &SymmKey,
    ) -> Result<(LocalTree, Vec<(LocalId, NodeHandle)>), LocalTreeError> {
        let mut by_parent: HashMap<u32, Vec<(u32, LocalRecord)>> = HashMap::new();
        let mut stale = BTreeSet::new();
        for (db_id, sealed) in records {
            let decoded = master
                .decrypt_padded(&sealed)
                .map_err(LocalTreeError::from)
                .and_then(|plain| LocalRecord::deserialize(&plain).map_err(LocalTreeError::from));
            match decoded {
                Ok(record) => by_parent.entry(record.parent_db_id).or_default().push((db_id, record)),
                Err(e) => {
                    tracing::warn!(sync = %sync, record = db_id, "skipping corrupt local record: {}", e);
                    stale.insert(db_id);
                }
            }
        }

        let mut roots = by_parent.remove(&0).unwrap_or_default();
        if roots.len() != 1 || roots[0].1.node_type.is_file() {
            return Err(LocalTreeError::Corrupt(format!(
                "expected one root folder record, found {}",
                roots.len()
            )));
        }
        let (root_db, root_record) = roots.remove(0);

        let mut tree = LocalTree::new(sync, &root_record.name, root_record.fsid);
        let root = tree.root();
        let mut bindings = Vec::new();
        if let Some(node) = tree.nodes.get_mut(&root) {
            node.db_id = Some(root_db);
        }
        tree.cache.inserts.clear();
        if let Some(handle) = root_record.node {
            bindings.push((root, handle));
        }

        let mut queue = VecDeque::from([(root_db, root)]);
        while let Some((parent_db, parent)) = queue.pop_front() {
            for (db_id, record) in by_parent.remove(&parent_db).unwrap_or_default() {
                let id = LocalId::new(sync, tree.next_index);
                let mut node = LocalNode::new(id, Some(parent), record.node_type, record.name);
                node.size = record.size;
                node.fsid = record.fsid;
                node.db_id = Some(db_id);
                if let Some(fingerprint) = record.fingerprint {
                    node.fingerprint = fingerprint;
                }
                if tree.child_by_name(&parent, &node.name).is_some() {
                    stale.insert(db_id);
                    continue;
                }
                if let Some(handle) = record.node {
                    bindings.push((id, handle));
                }
                let is_folder = !node.is_file();
                tree.attach_restored(node);
                if is_folder {
                    queue.push_back((db_id, id));
                }
            }
        }

        // anything left was never reached from the root
        for (_, orphans) in by_parent {
            stale.extend(orphans.into_iter().map(|(db_id, _)| db_id));
        }
        if !stale.is_empty() {
            tracing::warn!(sync = %sync, count = stale.len(), "discarding unreachable local records");
        }
        tree.cache.deletes = stale;
        Ok((tree, bindings))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::FsStat;
    use crate::persistence::MemoryStateStore;
    use crate::types::{Fsid, NodeType};
    use std::path::Path;

    #[test]
    fn test_flush_and_restore() {
        let master = SymmKey::from([3u8; 16]);
        let mut store = MemoryStateStore::new();
        let mut bindings = Bindings::new();
        let mut tree = LocalTree::new(SyncId(2), "root", Some(Fsid(1)));
        let root = tree.root();
        let dir = tree
            .add_or_update(
                root,
                "docs",
                None,
                &FsStat {
                    node_type: NodeType::Folder,
                    size: -1,
                    mtime: 0,
                    fsid: Some(Fsid(2)),
                },
            )
            .unwrap()
            .id;
        let file = tree
            .add_or_update(
                dir,
                "a.txt",
                None,
                &FsStat {
                    node_type: NodeType::File,
                    size: 3,
                    mtime: 9,
                    fsid: Some(Fsid(3)),
                },
            )
            .unwrap()
            .id;
        bindings.bind(file, NodeHandle::from_u64(44));

        assert_eq!(tree.flush_cache(&mut store, "t", &bindings, &master).unwrap(), 3);
        assert!(!tree.cache_pending());

        let records = store.records("t").unwrap();
        let (restored, bound) = LocalTree::restore(SyncId(2), records, &master).unwrap();
        assert_eq!(restored.len(), 3);
        let restored_file = restored.lookup(Path::new("docs/a.txt")).unwrap();
        assert_eq!(bound, vec![(restored_file, NodeHandle::from_u64(44))]);
        assert_eq!(restored.by_fsid(&Fsid(3)), Some(restored_file));
        assert!(!restored.cache_pending());
    }

    #[test]
    fn test_restore_discards_orphans() {
        let master = SymmKey::from([3u8; 16]);
        let root = LocalNode::new(LocalId::new(SyncId(1), 1), None, NodeType::Folder, "r".into());
        let orphan = LocalNode::new(
            LocalId::new(SyncId(1), 2),
            Some(LocalId::new(SyncId(1), 1)),
            NodeType::Folder,
            "lost".into(),
        );
        let records = vec![
            (1, master.encrypt_padded(&root.serialize(0, None).unwrap()).unwrap()),
            (2, master.encrypt_padded(&orphan.serialize(9, None).unwrap()).unwrap()),
        ];
        let (tree, _) = LocalTree::restore(SyncId(1), records, &master).unwrap();
        assert_eq!(tree.len(), 1);
        assert!(tree.cache_pending());
    }
}
