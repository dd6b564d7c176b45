//! Record persistence capability.
//!
//! Records are opaque byte strings grouped in named tables and keyed by a
//! store-assigned sequence id. A single cursor remembers where the remote
//! event stream should resume.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Table holding cached remote node records
pub const NODES_TABLE: &str = "nodes";

/// Table holding the local nodes of one sync
pub fn sync_table(remote_root: &crate::types::NodeHandle) -> String {
    format!("sync_{}", remote_root)
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store error: {0}")]
    Default(#[from] anyhow::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub trait StateStore: Send {
    /// Append a record and return its new id (ids start at 1)
    fn insert(&mut self, table: &str, data: &[u8]) -> Result<u32, StoreError>;

    fn put(&mut self, table: &str, id: u32, data: &[u8]) -> Result<(), StoreError>;

    fn get(&self, table: &str, id: u32) -> Result<Option<Vec<u8>>, StoreError>;

    fn del(&mut self, table: &str, id: u32) -> Result<(), StoreError>;

    fn records(&self, table: &str) -> Result<Vec<(u32, Vec<u8>)>, StoreError>;

    fn truncate(&mut self, table: &str) -> Result<(), StoreError>;

    fn cursor(&self) -> Result<Option<String>, StoreError>;

    fn set_cursor(&mut self, cursor: &str) -> Result<(), StoreError>;

    fn begin(&mut self) -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Table {
    next_id: u32,
    rows: BTreeMap<u32, Vec<u8>>,
}

/// Serializable content of a [`MemoryStateStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    tables: BTreeMap<String, Table>,
    cursor: Option<String>,
}

/// In-memory store.
///
/// Clones share the same content, so a test can keep a handle and hand the
/// same store to a second engine instance to simulate a restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryStateStore {
    inner: Arc<Mutex<StoreSnapshot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        Self {
            inner: Arc::new(Mutex::new(snapshot)),
        }
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.inner.lock().clone()
    }

    pub fn len(&self, table: &str) -> usize {
        self.inner
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.len())
            .unwrap_or(0)
    }
}

impl StateStore for MemoryStateStore {
    fn insert(&mut self, table: &str, data: &[u8]) -> Result<u32, StoreError> {
        let mut inner = self.inner.lock();
        let table = inner.tables.entry(table.to_string()).or_default();
        table.next_id += 1;
        let id = table.next_id;
        table.rows.insert(id, data.to_vec());
        Ok(id)
    }

    fn put(&mut self, table: &str, id: u32, data: &[u8]) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let table = inner.tables.entry(table.to_string()).or_default();
        table.next_id = table.next_id.max(id);
        table.rows.insert(id, data.to_vec());
        Ok(())
    }

    fn get(&self, table: &str, id: u32) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self
            .inner
            .lock()
            .tables
            .get(table)
            .and_then(|t| t.rows.get(&id).cloned()))
    }

    fn del(&mut self, table: &str, id: u32) -> Result<(), StoreError> {
        if let Some(table) = self.inner.lock().tables.get_mut(table) {
            table.rows.remove(&id);
        }
        Ok(())
    }

    fn records(&self, table: &str) -> Result<Vec<(u32, Vec<u8>)>, StoreError> {
        Ok(self
            .inner
            .lock()
            .tables
            .get(table)
            .map(|t| t.rows.iter().map(|(id, data)| (*id, data.clone())).collect())
            .unwrap_or_default())
    }

    fn truncate(&mut self, table: &str) -> Result<(), StoreError> {
        self.inner.lock().tables.remove(table);
        Ok(())
    }

    fn cursor(&self) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().cursor.clone())
    }

    fn set_cursor(&mut self, cursor: &str) -> Result<(), StoreError> {
        self.inner.lock().cursor = Some(cursor.to_string());
        Ok(())
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_ids_are_per_table() {
        let mut store = MemoryStateStore::new();
        assert_eq!(store.insert("a", b"x").unwrap(), 1);
        assert_eq!(store.insert("a", b"y").unwrap(), 2);
        assert_eq!(store.insert("b", b"z").unwrap(), 1);
        store.del("a", 1).unwrap();
        assert_eq!(store.records("a").unwrap(), vec![(2, b"y".to_vec())]);
    }

    #[test]
    fn test_clones_share_content() {
        let mut store = MemoryStateStore::new();
        let other = store.clone();
        store.set_cursor("42").unwrap();
        assert_eq!(other.cursor().unwrap(), Some("42".to_string()));
    }
}
