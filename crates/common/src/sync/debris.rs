//! Non-destructive relocation of superseded content.
//!
//! Local files go to `<sync root>/<local debris>/<yyyy-mm-dd>/`, remote
//! nodes to `<rubbish root>/<debris folder>/<yyyy-mm-dd>/`. Repeated runs on
//! the same day reuse the same folders.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use super::new_folder_node;
use crate::backoff::BackoffTimer;
use crate::config::EngineConfig;
use crate::crypto::KeyRing;
use crate::fs::{FileSystem, FsError};
use crate::node_graph::{NodeGraph, SyncDeleted};
use crate::transport::NewNode;
use crate::types::{Ds, NodeHandle, NodeType};

/// Day variants tried when the plain day folder already holds the name
const DAY_VARIANTS: u32 = 96;

pub fn day_folder_name(local_time: &NaiveDateTime) -> String {
    local_time.format("%Y-%m-%d").to_string()
}

pub(crate) fn ensure_dir(fs: &dyn FileSystem, path: &Path) -> Result<(), FsError> {
    match fs.mkdir(path) {
        Ok(()) | Err(FsError::AlreadyExists(_)) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Move `source` into the local debris folder of the sync rooted at `root`.
///
/// Returns where it ended up. A transient error aborts the attempt so the
/// caller can retry later.
pub fn move_to_local_debris(
    fs: &dyn FileSystem,
    root: &Path,
    debris: &str,
    local_time: &NaiveDateTime,
    source: &Path,
) -> Result<PathBuf, FsError> {
    let name = source.file_name().ok_or_else(|| FsError::Other {
        path: source.to_path_buf(),
        reason: "no file name".to_string(),
    })?;
    let base = root.join(debris);
    ensure_dir(fs, &base)?;

    let stamp = local_time.format("%Y-%m-%d %H.%M.%S").to_string();
    let candidates = std::iter::once(day_folder_name(local_time))
        .chain((0..DAY_VARIANTS).map(|n| format!("{}.{:02}", stamp, n)));
    for candidate in candidates {
        let dir = base.join(candidate);
        ensure_dir(fs, &dir)?;
        let target = dir.join(name);
        match fs.stat(&target) {
            Ok(_) => continue,
            Err(FsError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        fs.rename(source, &target)?;
        tracing::info!(from = ?source, to = ?target, "moved to local debris");
        return Ok(target);
    }
    Err(FsError::Other {
        path: source.to_path_buf(),
        reason: "no free local debris folder".to_string(),
    })
}

/// A request the remote debris queue wants posted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebrisStep {
    CreateFolders {
        parent: NodeHandle,
        nodes: Vec<NewNode>,
    },
    Move {
        node: NodeHandle,
        parent: NodeHandle,
    },
}

/// Nodes waiting to be moved into the dated remote debris folder
#[derive(Debug)]
pub struct RemoteDebris {
    queue: BTreeSet<NodeHandle>,
    folders_inflight: bool,
    bt: BackoffTimer,
}

impl RemoteDebris {
    pub fn new(backoff_cap: Ds) -> Self {
        Self {
            queue: BTreeSet::new(),
            folders_inflight: false,
            bt: BackoffTimer::new(backoff_cap),
        }
    }

    pub fn add(&mut self, node: NodeHandle, graph: &mut NodeGraph) {
        if let Some(n) = graph.get_mut(&node) {
            n.sync_deleted = SyncDeleted::Deleted;
            tracing::debug!(node = %node, "queued for remote debris");
            self.queue.insert(node);
        }
    }

    pub fn remove(&mut self, node: &NodeHandle) {
        self.queue.remove(node);
    }

    pub fn contains(&self, node: &NodeHandle) -> bool {
        self.queue.contains(node)
    }

    pub fn is_idle(&self) -> bool {
        self.queue.is_empty() && !self.folders_inflight
    }

    /// Folder creation finished; `ok` is false when it failed
    pub fn folders_done(&mut self, ok: bool, now: Ds) {
        self.folders_inflight = false;
        if ok {
            self.bt.reset();
        } else {
            self.bt.backoff(now);
        }
    }

    /// A move failed; try the node again later
    pub fn requeue(&mut self, node: NodeHandle, graph: &mut NodeGraph, now: Ds) {
        self.add(node, graph);
        self.bt.backoff(now);
    }

    pub fn next_wakeup(&self, wake_at: &mut Option<Ds>) {
        if !self.queue.is_empty() && !self.folders_inflight {
            self.bt.update(wake_at);
        }
    }

    /// Work out what to post next
    pub fn step(
        &mut self,
        graph: &mut NodeGraph,
        config: &EngineConfig,
        keyring: &KeyRing,
        local_time: &NaiveDateTime,
        now: Ds,
        next_temp: &mut u64,
    ) -> Vec<DebrisStep> {
        self.queue.retain(|node| graph.contains(node));
        if self.queue.is_empty() || self.folders_inflight || !self.bt.armed(now) {
            return Vec::new();
        }

        let Some(rubbish) = graph.root(NodeType::Rubbish) else {
            self.mark(graph, SyncDeleted::Bin);
            return Vec::new();
        };
        let day_name = day_folder_name(local_time);
        let debris = find_folder(graph, &rubbish, &config.debris_folder);
        let day = debris.and_then(|debris| find_folder(graph, &debris, &day_name));

        let Some(day) = day else {
            let mut nodes = Vec::new();
            let parent = match debris {
                Some(debris) => {
                    self.mark(graph, SyncDeleted::DebrisDay);
                    debris
                }
                None => {
                    self.mark(graph, SyncDeleted::Debris);
                    let temp = next_temp_handle(next_temp);
                    match new_folder_node(temp, None, &config.debris_folder, keyring) {
                        Ok(node) => nodes.push(node),
                        Err(e) => {
                            tracing::warn!("cannot prepare debris folder: {}", e);
                            self.bt.backoff(now);
                            return Vec::new();
                        }
                    }
                    rubbish
                }
            };
            let parent_temp = nodes.first().map(|n| n.temp);
            let temp = next_temp_handle(next_temp);
            match new_folder_node(temp, parent_temp, &day_name, keyring) {
                Ok(node) => nodes.push(node),
                Err(e) => {
                    tracing::warn!("cannot prepare debris day folder: {}", e);
                    self.bt.backoff(now);
                    return Vec::new();
                }
            }
            tracing::info!(day = %day_name, "creating remote debris folders");
            self.folders_inflight = true;
            return vec![DebrisStep::CreateFolders { parent, nodes }];
        };

        let queued: Vec<NodeHandle> = self.queue.iter().copied().collect();
        let mut steps = Vec::new();
        for node in &queued {
            let nested = queued
                .iter()
                .any(|other| other != node && graph.is_below(node, other));
            if let Some(n) = graph.get_mut(node) {
                n.sync_deleted = if nested {
                    SyncDeleted::None
                } else {
                    SyncDeleted::InFlight
                };
            }
            if !nested {
                steps.push(DebrisStep::Move {
                    node: *node,
                    parent: day,
                });
            }
        }
        self.queue.clear();
        steps
    }

    fn mark(&self, graph: &mut NodeGraph, state: SyncDeleted) {
        for node in &self.queue {
            if let Some(n) = graph.get_mut(node) {
                n.sync_deleted = state;
            }
        }
    }
}

fn find_folder(graph: &NodeGraph, parent: &NodeHandle, name: &str) -> Option<NodeHandle> {
    graph
        .children(parent)
        .find(|n| n.node_type == NodeType::Folder && n.name() == Some(name))
        .map(|n| n.handle)
}

/// Placeholder handles live at the top of the handle space, clear of real ones
pub(crate) fn next_temp_handle(next_temp: &mut u64) -> NodeHandle {
    *next_temp += 1;
    NodeHandle::from_u64(0xfff0_0000_0000 + *next_temp)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fs::FsStat;
    use crate::testkit::MemoryFs;
    use chrono::NaiveDate;

    fn noon() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(12, 30, 5)
            .unwrap()
    }

    #[test]
    fn test_local_debris_uses_day_folder_then_variants() {
        let fs = MemoryFs::new();
        fs.mkdir(Path::new("/sync")).unwrap();
        fs.write_file(Path::new("/sync/a.txt"), b"one", 10);
        let first = move_to_local_debris(&fs, Path::new("/sync"), ".debris", &noon(), Path::new("/sync/a.txt")).unwrap();
        assert_eq!(first, PathBuf::from("/sync/.debris/2024-03-09/a.txt"));

        fs.write_file(Path::new("/sync/a.txt"), b"two", 11);
        let second = move_to_local_debris(&fs, Path::new("/sync"), ".debris", &noon(), Path::new("/sync/a.txt")).unwrap();
        assert_eq!(
            second,
            PathBuf::from("/sync/.debris/2024-03-09 12.30.05.00/a.txt")
        );
        assert_eq!(fs.read_file(&first).unwrap(), b"one");
        assert_eq!(fs.read_file(&second).unwrap(), b"two");
        assert!(matches!(fs.stat(Path::new("/sync/a.txt")), Err(FsError::NotFound(_))));
    }

    #[test]
    fn test_transient_error_aborts() {
        let fs = MemoryFs::new();
        fs.mkdir(Path::new("/sync")).unwrap();
        fs.write_file(Path::new("/sync/a.txt"), b"one", 10);
        fs.lock(Path::new("/sync/a.txt"));
        let result = move_to_local_debris(&fs, Path::new("/sync"), ".debris", &noon(), Path::new("/sync/a.txt"));
        assert!(matches!(result, Err(ref e) if e.is_transient()));
        let stat: FsStat = fs.stat(Path::new("/sync/a.txt")).unwrap();
        assert_eq!(stat.size, 3);
    }
}
