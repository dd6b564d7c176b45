use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::fs::{DirEntry, FileHandle, FileSystem, FsError, FsStat};
use crate::types::{Fsid, NodeType};

#[derive(Debug, Clone)]
enum Content {
    Dir,
    File(Vec<u8>),
}

#[derive(Debug, Clone)]
struct Entry {
    content: Content,
    mtime: i64,
    fsid: u64,
}

#[derive(Debug, Default)]
struct FsState {
    entries: BTreeMap<PathBuf, Entry>,
    locked: HashSet<PathBuf>,
    changes: Vec<PathBuf>,
    next_fsid: u64,
    no_fsids: bool,
}

impl FsState {
    fn fsid(&mut self) -> u64 {
        self.next_fsid += 1;
        self.next_fsid
    }

    fn check_parent(&self, path: &Path) -> Result<(), FsError> {
        let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return Ok(());
        };
        if parent == Path::new("/") {
            return Ok(());
        }
        match self.entries.get(parent) {
            Some(Entry {
                content: Content::Dir, ..
            }) => Ok(()),
            Some(_) => Err(FsError::NotADirectory(parent.to_path_buf())),
            None => Err(FsError::NotFound(parent.to_path_buf())),
        }
    }

    fn check_lock(&self, path: &Path) -> Result<(), FsError> {
        if self.locked.contains(path) {
            return Err(FsError::Transient {
                path: path.to_path_buf(),
                reason: "locked".to_string(),
            });
        }
        Ok(())
    }

    fn file_mut(&mut self, path: &Path) -> Result<&mut Entry, FsError> {
        match self.entries.get_mut(path) {
            Some(entry) if matches!(entry.content, Content::File(_)) => Ok(entry),
            Some(_) => Err(FsError::Other {
                path: path.to_path_buf(),
                reason: "is a directory".to_string(),
            }),
            None => Err(FsError::NotFound(path.to_path_buf())),
        }
    }

    fn changed(&mut self, path: &Path) {
        self.changes.push(path.to_path_buf());
    }
}

/// In-memory filesystem.
///
/// Paths are absolute. Every entry gets a fresh fsid when it is created;
/// renames keep it. Clones share the same tree, so a test keeps one handle
/// while the engine owns another. Every mutation is recorded as a change
/// notification that [`MemoryFs::take_changes`] hands out.
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    inner: Arc<Mutex<FsState>>,
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report no fsids, like a filesystem without stable inode numbers
    pub fn without_fsids(self) -> Self {
        self.inner.lock().no_fsids = true;
        self
    }

    /// Create or overwrite a file, creating missing parent folders
    pub fn write_file(&self, path: &Path, data: &[u8], mtime: i64) {
        let mut state = self.inner.lock();
        let mut missing = Vec::new();
        let mut cursor = path.parent();
        while let Some(dir) = cursor.filter(|d| *d != Path::new("/") && !d.as_os_str().is_empty()) {
            if state.entries.contains_key(dir) {
                break;
            }
            missing.push(dir.to_path_buf());
            cursor = dir.parent();
        }
        for dir in missing.into_iter().rev() {
            let fsid = state.fsid();
            state.entries.insert(
                dir.clone(),
                Entry {
                    content: Content::Dir,
                    mtime,
                    fsid,
                },
            );
            state.changed(&dir);
        }
        let fsid = match state.entries.get(path) {
            Some(existing) => existing.fsid,
            None => state.fsid(),
        };
        state.entries.insert(
            path.to_path_buf(),
            Entry {
                content: Content::File(data.to_vec()),
                mtime,
                fsid,
            },
        );
        state.changed(path);
    }

    pub fn read_file(&self, path: &Path) -> Option<Vec<u8>> {
        match self.inner.lock().entries.get(path) {
            Some(Entry {
                content: Content::File(data),
                ..
            }) => Some(data.clone()),
            _ => None,
        }
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.inner.lock().entries.contains_key(path)
    }

    /// Delete a file or a whole folder
    pub fn remove_all(&self, path: &Path) {
        let mut state = self.inner.lock();
        state.entries.retain(|p, _| !p.starts_with(path));
        state.changed(path);
    }

    /// Make every open, rename or removal of `path` fail transiently
    pub fn lock(&self, path: &Path) {
        self.inner.lock().locked.insert(path.to_path_buf());
    }

    pub fn unlock(&self, path: &Path) {
        self.inner.lock().locked.remove(path);
    }

    /// Paths changed since the last call
    pub fn take_changes(&self) -> Vec<PathBuf> {
        std::mem::take(&mut self.inner.lock().changes)
    }

    pub fn has_changes(&self) -> bool {
        !self.inner.lock().changes.is_empty()
    }

    /// Every path below `dir`, sorted
    pub fn paths_below(&self, dir: &Path) -> Vec<PathBuf> {
        self.inner
            .lock()
            .entries
            .keys()
            .filter(|p| p.starts_with(dir) && p.as_path() != dir)
            .cloned()
            .collect()
    }

    fn open(&self, path: &Path) -> Box<dyn FileHandle> {
        Box::new(MemoryFile {
            fs: self.clone(),
            path: path.to_path_buf(),
        })
    }
}

impl FileSystem for MemoryFs {
    fn stat(&self, path: &Path) -> Result<FsStat, FsError> {
        let state = self.inner.lock();
        if path == Path::new("/") {
            return Ok(FsStat {
                node_type: NodeType::Folder,
                size: 0,
                mtime: 0,
                fsid: None,
            });
        }
        let entry = state
            .entries
            .get(path)
            .ok_or_else(|| FsError::NotFound(path.to_path_buf()))?;
        let (node_type, size) = match &entry.content {
            Content::Dir => (NodeType::Folder, 0),
            Content::File(data) => (NodeType::File, data.len() as i64),
        };
        Ok(FsStat {
            node_type,
            size,
            mtime: entry.mtime,
            fsid: (!state.no_fsids).then_some(Fsid(entry.fsid)),
        })
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>, FsError> {
        let state = self.inner.lock();
        match state.entries.get(path) {
            Some(Entry {
                content: Content::Dir, ..
            }) => {}
            Some(_) => return Err(FsError::NotADirectory(path.to_path_buf())),
            None if path == Path::new("/") => {}
            None => return Err(FsError::NotFound(path.to_path_buf())),
        }
        Ok(state
            .entries
            .keys()
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name())
            .map(|name| DirEntry {
                name: name.to_string_lossy().into_owned(),
                short_name: None,
            })
            .collect())
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn FileHandle>, FsError> {
        let mut state = self.inner.lock();
        state.check_lock(path)?;
        state.file_mut(path)?;
        drop(state);
        Ok(self.open(path))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn FileHandle>, FsError> {
        let mut state = self.inner.lock();
        state.check_lock(path)?;
        state.check_parent(path)?;
        let fsid = match state.entries.get(path) {
            Some(Entry {
                content: Content::Dir, ..
            }) => {
                return Err(FsError::AlreadyExists(path.to_path_buf()));
            }
            Some(existing) => existing.fsid,
            None => state.fsid(),
        };
        state.entries.insert(
            path.to_path_buf(),
            Entry {
                content: Content::File(Vec::new()),
                mtime: 0,
                fsid,
            },
        );
        state.changed(path);
        drop(state);
        Ok(self.open(path))
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn FileHandle>, FsError> {
        if !self.exists(path) {
            return self.create(path);
        }
        let mut state = self.inner.lock();
        state.check_lock(path)?;
        state.file_mut(path)?;
        drop(state);
        Ok(self.open(path))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        let mut state = self.inner.lock();
        state.check_lock(from)?;
        if !state.entries.contains_key(from) {
            return Err(FsError::NotFound(from.to_path_buf()));
        }
        if state.entries.contains_key(to) {
            return Err(FsError::AlreadyExists(to.to_path_buf()));
        }
        state.check_parent(to)?;
        if to.starts_with(from) {
            return Err(FsError::Other {
                path: to.to_path_buf(),
                reason: "cannot move below itself".to_string(),
            });
        }
        let moved: Vec<PathBuf> = state
            .entries
            .keys()
            .filter(|p| p.starts_with(from))
            .cloned()
            .collect();
        for old in moved {
            let Some(entry) = state.entries.remove(&old) else {
                continue;
            };
            let suffix = old.strip_prefix(from).unwrap_or(Path::new(""));
            let new = if suffix.as_os_str().is_empty() {
                to.to_path_buf()
            } else {
                to.join(suffix)
            };
            state.entries.insert(new, entry);
        }
        state.changed(from);
        state.changed(to);
        Ok(())
    }

    fn remove_file(&self, path: &Path) -> Result<(), FsError> {
        let mut state = self.inner.lock();
        state.check_lock(path)?;
        state.file_mut(path)?;
        state.entries.remove(path);
        state.changed(path);
        Ok(())
    }

    fn remove_dir(&self, path: &Path) -> Result<(), FsError> {
        let mut state = self.inner.lock();
        state.check_lock(path)?;
        match state.entries.get(path) {
            Some(Entry {
                content: Content::Dir, ..
            }) => {}
            Some(_) => return Err(FsError::NotADirectory(path.to_path_buf())),
            None => return Err(FsError::NotFound(path.to_path_buf())),
        }
        if state.entries.keys().any(|p| p.parent() == Some(path)) {
            return Err(FsError::Other {
                path: path.to_path_buf(),
                reason: "directory not empty".to_string(),
            });
        }
        state.entries.remove(path);
        state.changed(path);
        Ok(())
    }

    fn mkdir(&self, path: &Path) -> Result<(), FsError> {
        let mut state = self.inner.lock();
        if state.entries.contains_key(path) {
            return Err(FsError::AlreadyExists(path.to_path_buf()));
        }
        state.check_parent(path)?;
        let fsid = state.fsid();
        state.entries.insert(
            path.to_path_buf(),
            Entry {
                content: Content::Dir,
                mtime: 0,
                fsid,
            },
        );
        state.changed(path);
        Ok(())
    }

    fn set_mtime(&self, path: &Path, mtime: i64) -> Result<(), FsError> {
        let mut state = self.inner.lock();
        let entry = state
            .entries
            .get_mut(path)
            .ok_or_else(|| FsError::NotFound(path.to_path_buf()))?;
        entry.mtime = mtime;
        Ok(())
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        let mut state = self.inner.lock();
        state.check_lock(from)?;
        let entry = state.file_mut(from)?.clone();
        if state.entries.contains_key(to) {
            return Err(FsError::AlreadyExists(to.to_path_buf()));
        }
        state.check_parent(to)?;
        let fsid = state.fsid();
        state.entries.insert(to.to_path_buf(), Entry { fsid, ..entry });
        state.changed(to);
        Ok(())
    }
}

/// Open file of a [`MemoryFs`]; reads and writes go straight to the tree
struct MemoryFile {
    fs: MemoryFs,
    path: PathBuf,
}

impl MemoryFile {
    fn with<T>(&self, f: impl FnOnce(&mut Entry) -> T) -> Result<T, FsError> {
        let mut state = self.fs.inner.lock();
        let entry = state.file_mut(&self.path)?;
        Ok(f(entry))
    }
}

impl FileHandle for MemoryFile {
    fn size(&self) -> i64 {
        self.with(|entry| match &entry.content {
            Content::File(data) => data.len() as i64,
            Content::Dir => 0,
        })
        .unwrap_or(0)
    }

    fn mtime(&self) -> i64 {
        self.with(|entry| entry.mtime).unwrap_or(0)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        self.with(|entry| match &entry.content {
            Content::File(data) => {
                let start = (offset as usize).min(data.len());
                let n = buf.len().min(data.len() - start);
                buf[..n].copy_from_slice(&data[start..start + n]);
                n
            }
            Content::Dir => 0,
        })
    }

    fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<(), FsError> {
        self.with(|entry| {
            if let Content::File(data) = &mut entry.content {
                let end = offset as usize + bytes.len();
                if data.len() < end {
                    data.resize(end, 0);
                }
                data[offset as usize..end].copy_from_slice(bytes);
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_rename_moves_subtree_and_keeps_fsid() {
        let fs = MemoryFs::new();
        fs.write_file(Path::new("/a/b/c.txt"), b"x", 5);
        let before = fs.stat(Path::new("/a/b/c.txt")).unwrap().fsid;
        fs.rename(Path::new("/a/b"), Path::new("/a/d")).unwrap();
        assert_eq!(fs.read_file(Path::new("/a/d/c.txt")).unwrap(), b"x");
        assert_eq!(fs.stat(Path::new("/a/d/c.txt")).unwrap().fsid, before);
        assert!(!fs.exists(Path::new("/a/b")));
    }

    #[test]
    fn test_rename_never_replaces() {
        let fs = MemoryFs::new();
        fs.write_file(Path::new("/a"), b"1", 1);
        fs.write_file(Path::new("/b"), b"2", 1);
        assert!(matches!(
            fs.rename(Path::new("/a"), Path::new("/b")),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_locked_file_is_transient() {
        let fs = MemoryFs::new();
        fs.write_file(Path::new("/a"), b"1", 1);
        fs.lock(Path::new("/a"));
        assert!(matches!(fs.open_read(Path::new("/a")), Err(ref e) if e.is_transient()));
        fs.unlock(Path::new("/a"));
        assert!(fs.open_read(Path::new("/a")).is_ok());
    }

    #[test]
    fn test_handle_writes_through() {
        let fs = MemoryFs::new();
        fs.mkdir(Path::new("/d")).unwrap();
        let mut file = fs.create(Path::new("/d/f")).unwrap();
        file.write_at(3, b"abc").unwrap();
        assert_eq!(fs.read_file(Path::new("/d/f")).unwrap(), b"\0\0\0abc");
        assert_eq!(file.size(), 6);
    }
}
