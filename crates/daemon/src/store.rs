//! On-disk state store.
//!
//! Keeps every table in memory and writes the whole content as one bincode
//! snapshot whenever a transaction that changed something commits. The file
//! is replaced atomically, so a crash leaves either the old or the new state.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use common::persistence::{MemoryStateStore, StateStore, StoreError, StoreSnapshot};

/// Replace `path` with `data` through a temporary file in the same folder
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(data)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    memory: MemoryStateStore,
    dirty: bool,
}

impl FileStateStore {
    /// Open the store at `path`; a missing file is an empty store
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let memory = match fs::read(&path) {
            Ok(data) => {
                let snapshot: StoreSnapshot =
                    bincode::deserialize(&data).map_err(anyhow::Error::from)?;
                MemoryStateStore::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => MemoryStateStore::new(),
            Err(e) => return Err(e.into()),
        };
        tracing::debug!(path = ?path, "state store opened");
        Ok(Self {
            path,
            memory,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records held in `table`
    pub fn len(&self, table: &str) -> usize {
        self.memory.len(table)
    }

    fn write(&mut self) -> Result<(), StoreError> {
        let data = bincode::serialize(&self.memory.snapshot()).map_err(anyhow::Error::from)?;
        write_atomic(&self.path, &data)?;
        self.dirty = false;
        tracing::trace!(path = ?self.path, bytes = data.len(), "state store written");
        Ok(())
    }
}

impl StateStore for FileStateStore {
    fn insert(&mut self, table: &str, data: &[u8]) -> Result<u32, StoreError> {
        self.dirty = true;
        self.memory.insert(table, data)
    }

    fn put(&mut self, table: &str, id: u32, data: &[u8]) -> Result<(), StoreError> {
        self.dirty = true;
        self.memory.put(table, id, data)
    }

    fn get(&self, table: &str, id: u32) -> Result<Option<Vec<u8>>, StoreError> {
        self.memory.get(table, id)
    }

    fn del(&mut self, table: &str, id: u32) -> Result<(), StoreError> {
        self.dirty = true;
        self.memory.del(table, id)
    }

    fn records(&self, table: &str) -> Result<Vec<(u32, Vec<u8>)>, StoreError> {
        self.memory.records(table)
    }

    fn truncate(&mut self, table: &str) -> Result<(), StoreError> {
        self.dirty = true;
        self.memory.truncate(table)
    }

    fn cursor(&self) -> Result<Option<String>, StoreError> {
        self.memory.cursor()
    }

    fn set_cursor(&mut self, cursor: &str) -> Result<(), StoreError> {
        self.dirty = true;
        self.memory.set_cursor(cursor)
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.memory.begin()
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.memory.commit()?;
        if self.dirty {
            self.write()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_committed_records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");

        let mut store = FileStateStore::open(&path).unwrap();
        store.begin().unwrap();
        let id = store.insert("nodes", b"record").unwrap();
        store.set_cursor("42").unwrap();
        store.commit().unwrap();

        let reopened = FileStateStore::open(&path).unwrap();
        assert_eq!(reopened.get("nodes", id).unwrap(), Some(b"record".to_vec()));
        assert_eq!(reopened.cursor().unwrap(), Some("42".to_string()));
    }

    #[test]
    fn test_nothing_written_until_commit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");

        let mut store = FileStateStore::open(&path).unwrap();
        store.begin().unwrap();
        store.insert("nodes", b"pending").unwrap();
        assert!(!path.exists());

        store.commit().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.bin");
        fs::write(&path, [0xff; 3]).unwrap();
        assert!(FileStateStore::open(&path).is_err());
    }

    #[test]
    fn test_write_atomic_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        write_atomic(&path, b"one").unwrap();
        write_atomic(&path, b"two").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }
}
