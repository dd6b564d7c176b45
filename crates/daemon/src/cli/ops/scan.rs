use std::path::{Path, PathBuf};

use clap::Args;

use common::fingerprint::FileFingerprint;
use common::fs::{FileSystem, FsError};
use common::types::NodeType;
use cumulus_daemon::DiskFs;

/// Print the fingerprint of every file below a folder, as the engine computes them
#[derive(Args, Debug, Clone)]
pub struct Scan {
    pub path: PathBuf,

    /// Folder name to leave out, as the engine leaves out its debris folder
    #[arg(long, default_value = ".debris")]
    pub skip: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    #[error("scan failed: {0}")]
    Fs(#[from] FsError),
}

fn walk(
    fs: &DiskFs,
    root: &Path,
    dir: &Path,
    skip: &str,
    lines: &mut Vec<String>,
) -> Result<(), FsError> {
    let mut entries = fs.read_dir(dir)?;
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    for entry in entries {
        let path = dir.join(&entry.name);
        let stat = match fs.stat(&path) {
            Ok(stat) => stat,
            // vanished while scanning
            Err(e) if e.is_not_found() => continue,
            Err(e) => return Err(e),
        };
        match stat.node_type {
            NodeType::Folder if dir == root && entry.name == skip => {}
            NodeType::Folder => walk(fs, root, &path, skip, lines)?,
            NodeType::File => {
                let mut file = fs.open_read(&path)?;
                let fp = FileFingerprint::generate(&mut *file)?;
                let rel = path.strip_prefix(root).unwrap_or(&path);
                lines.push(format!(
                    "{} {:>12} {:>12} {}",
                    hex::encode(fp.crc),
                    fp.size,
                    fp.mtime,
                    rel.display()
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

#[async_trait::async_trait]
impl crate::cli::op::Op for Scan {
    type Error = ScanError;
    type Output = String;

    async fn execute(&self, _ctx: &crate::cli::op::OpContext) -> Result<Self::Output, Self::Error> {
        let fs = DiskFs::new();
        let mut lines = Vec::new();
        walk(&fs, &self.path, &self.path, &self.skip, &mut lines)?;
        lines.push(format!("{} files", lines.len()));
        Ok(lines.join("\n"))
    }
}
