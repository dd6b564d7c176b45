//! The real filesystem behind the sync engine.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use common::fs::{DirEntry, FileHandle, FileSystem, FsError, FsStat};
use common::types::{Fsid, NodeType};

/// Classify an I/O failure; locks and permission problems are retried later
fn fs_error(path: &Path, e: io::Error) -> FsError {
    match e.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.to_path_buf()),
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.to_path_buf()),
        io::ErrorKind::PermissionDenied
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::Interrupted
        | io::ErrorKind::TimedOut => FsError::Transient {
            path: path.to_path_buf(),
            reason: e.to_string(),
        },
        _ => FsError::Other {
            path: path.to_path_buf(),
            reason: e.to_string(),
        },
    }
}

/// Filesystem access through `std::fs`; inode numbers serve as fsids
#[derive(Debug, Clone, Copy, Default)]
pub struct DiskFs;

impl DiskFs {
    pub fn new() -> Self {
        Self
    }

    fn open_handle(path: &Path, options: &OpenOptions) -> Result<Box<dyn FileHandle>, FsError> {
        let file = options.open(path).map_err(|e| fs_error(path, e))?;
        Ok(Box::new(DiskFile {
            file,
            path: path.to_path_buf(),
        }))
    }
}

impl FileSystem for DiskFs {
    fn stat(&self, path: &Path) -> Result<FsStat, FsError> {
        let meta = fs::metadata(path).map_err(|e| fs_error(path, e))?;
        let node_type = if meta.is_dir() {
            NodeType::Folder
        } else {
            NodeType::File
        };
        Ok(FsStat {
            node_type,
            size: if meta.is_dir() { 0 } else { meta.len() as i64 },
            mtime: meta.mtime(),
            fsid: Some(Fsid(meta.ino())),
        })
    }

    fn read_dir(&self, path: &Path) -> Result<Vec<DirEntry>, FsError> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(path).map_err(|e| fs_error(path, e))? {
            let entry = entry.map_err(|e| fs_error(path, e))?;
            match entry.file_name().into_string() {
                Ok(name) => entries.push(DirEntry {
                    name,
                    short_name: None,
                }),
                Err(name) => tracing::warn!(dir = ?path, name = ?name, "skipping entry with a non UTF-8 name"),
            }
        }
        Ok(entries)
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn FileHandle>, FsError> {
        Self::open_handle(path, OpenOptions::new().read(true))
    }

    fn create(&self, path: &Path) -> Result<Box<dyn FileHandle>, FsError> {
        Self::open_handle(
            path,
            OpenOptions::new().read(true).write(true).create(true).truncate(true),
        )
    }

    fn open_write(&self, path: &Path) -> Result<Box<dyn FileHandle>, FsError> {
        Self::open_handle(path, OpenOptions::new().read(true).write(true).create(true))
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        if fs::symlink_metadata(to).is_ok() {
            return Err(FsError::AlreadyExists(to.to_path_buf()));
        }
        fs::rename(from, to).map_err(|e| fs_error(from, e))
    }

    fn remove_file(&self, path: &Path) -> Result<(), FsError> {
        fs::remove_file(path).map_err(|e| fs_error(path, e))
    }

    fn remove_dir(&self, path: &Path) -> Result<(), FsError> {
        fs::remove_dir(path).map_err(|e| fs_error(path, e))
    }

    fn mkdir(&self, path: &Path) -> Result<(), FsError> {
        fs::create_dir(path).map_err(|e| fs_error(path, e))
    }

    fn set_mtime(&self, path: &Path, mtime: i64) -> Result<(), FsError> {
        let time = if mtime >= 0 {
            UNIX_EPOCH + Duration::from_secs(mtime as u64)
        } else {
            UNIX_EPOCH - Duration::from_secs(mtime.unsigned_abs())
        };
        let file = OpenOptions::new()
            .write(true)
            .open(path)
            .map_err(|e| fs_error(path, e))?;
        file.set_modified(time).map_err(|e| fs_error(path, e))
    }

    fn copy(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        if fs::symlink_metadata(to).is_ok() {
            return Err(FsError::AlreadyExists(to.to_path_buf()));
        }
        fs::copy(from, to).map(|_| ()).map_err(|e| fs_error(from, e))
    }
}

struct DiskFile {
    file: File,
    path: PathBuf,
}

impl FileHandle for DiskFile {
    fn size(&self) -> i64 {
        self.file.metadata().map(|m| m.len() as i64).unwrap_or(0)
    }

    fn mtime(&self) -> i64 {
        self.file.metadata().map(|m| m.mtime()).unwrap_or(0)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        self.file.read_at(buf, offset).map_err(|e| fs_error(&self.path, e))
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), FsError> {
        self.file
            .write_all_at(data, offset)
            .map_err(|e| fs_error(&self.path, e))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stat_reports_type_size_and_inode() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("a.txt");
        fs::write(&file, b"hello").unwrap();

        let fs = DiskFs::new();
        let stat = fs.stat(&file).unwrap();
        assert_eq!(stat.node_type, NodeType::File);
        assert_eq!(stat.size, 5);
        assert!(stat.fsid.is_some());
        assert_eq!(fs.stat(dir.path()).unwrap().node_type, NodeType::Folder);
        assert!(fs.stat(&dir.path().join("missing")).unwrap_err().is_not_found());
    }

    #[test]
    fn test_rename_keeps_fsid_and_refuses_to_replace() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        fs::write(&a, b"1").unwrap();
        fs::write(&b, b"2").unwrap();

        let fs = DiskFs::new();
        let before = fs.stat(&a).unwrap().fsid;
        assert!(matches!(fs.rename(&a, &b), Err(FsError::AlreadyExists(_))));

        let c = dir.path().join("c");
        fs.rename(&a, &c).unwrap();
        assert_eq!(fs.stat(&c).unwrap().fsid, before);
    }

    #[test]
    fn test_handles_read_and_write_at_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let fs = DiskFs::new();

        let mut out = fs.create(&path).unwrap();
        out.write_at(4, b"tail").unwrap();
        out.write_at(0, b"head").unwrap();
        drop(out);

        let mut input = fs.open_read(&path).unwrap();
        assert_eq!(input.size(), 8);
        assert_eq!(common::fs::read_to_end(&mut *input).unwrap(), b"headtail");
    }

    #[test]
    fn test_set_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("old");
        fs::write(&path, b"x").unwrap();

        let fs = DiskFs::new();
        fs.set_mtime(&path, 1_500_000_000).unwrap();
        assert_eq!(fs.stat(&path).unwrap().mtime, 1_500_000_000);
    }

    #[test]
    fn test_read_dir_lists_names() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("f"), b"").unwrap();

        let mut names: Vec<String> = DiskFs::new()
            .read_dir(dir.path())
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        names.sort();
        assert_eq!(names, vec!["f".to_string(), "sub".to_string()]);
    }
}
