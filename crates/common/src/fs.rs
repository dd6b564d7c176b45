//! Local filesystem capability consumed by the sync and transfer engines.
//!
//! Paths handed to a [`FileSystem`] are absolute (sync root joined with the
//! relative local path). Implementations classify failures so that locked or
//! temporarily inaccessible objects are retried instead of failing a sync.

use std::path::{Path, PathBuf};

use crate::types::{Fsid, NodeType};

#[derive(Debug, thiserror::Error)]
pub enum FsError {
    #[error("transient error at {path:?}: {reason}")]
    Transient { path: PathBuf, reason: String },
    #[error("not found: {0:?}")]
    NotFound(PathBuf),
    #[error("already exists: {0:?}")]
    AlreadyExists(PathBuf),
    #[error("not a directory: {0:?}")]
    NotADirectory(PathBuf),
    #[error("filesystem error at {path:?}: {reason}")]
    Other { path: PathBuf, reason: String },
}

impl FsError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FsError::Transient { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound(_))
    }
}

/// Result of a stat call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStat {
    pub node_type: NodeType,
    pub size: i64,
    pub mtime: i64,
    pub fsid: Option<Fsid>,
}

/// Directory listing entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// Alternate (short) name, on filesystems that keep one
    pub short_name: Option<String>,
}

/// An open file.
///
/// Dropping the handle closes it.
pub trait FileHandle: Send {
    fn size(&self) -> i64;

    fn mtime(&self) -> i64;

    /// Read up to `buf.len()` bytes at `offset`; returns the number read
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError>;

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), FsError>;
}

pub trait FileSystem: Send {
    fn stat(&self, path: &Path) -> Result<FsStat, FsError>;

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>, FsError>;

    fn open_read(&self, path: &Path) -> Result<Box<dyn FileHandle>, FsError>;

    /// Create (or truncate) a file for writing
    fn create(&self, path: &Path) -> Result<Box<dyn FileHandle>, FsError>;

    /// Open a file for writing without truncating it, creating it if missing
    fn open_write(&self, path: &Path) -> Result<Box<dyn FileHandle>, FsError>;

    /// Rename without replacing: fails with [`FsError::AlreadyExists`] if `to` exists
    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError>;

    fn remove_file(&self, path: &Path) -> Result<(), FsError>;

    /// Remove an empty directory
    fn remove_dir(&self, path: &Path) -> Result<(), FsError>;

    fn mkdir(&self, path: &Path) -> Result<(), FsError>;

    fn set_mtime(&self, path: &Path, mtime: i64) -> Result<(), FsError>;

    fn copy(&self, from: &Path, to: &Path) -> Result<(), FsError>;
}

/// A change report from the notification subsystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsNotification {
    /// Something at this absolute path changed
    Changed(PathBuf),
    /// Too many changes were queued; partial knowledge must not be trusted
    Overflow,
    /// Notifications are permanently unavailable for this sync
    Unavailable,
}

/// Read an entire file through a handle.
pub fn read_to_end(file: &mut dyn FileHandle) -> Result<Vec<u8>, FsError> {
    let size = file.size().max(0) as usize;
    let mut out = vec![0u8; size];
    let mut pos = 0;
    while pos < size {
        let n = file.read_at(pos as u64, &mut out[pos..])?;
        if n == 0 {
            break;
        }
        pos += n;
    }
    out.truncate(pos);
    Ok(out)
}
