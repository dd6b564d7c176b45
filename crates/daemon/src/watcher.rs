//! Filesystem change notifications for the sync roots.
//!
//! `notify` delivers events on its own thread; they are translated into
//! [`FsNotification`]s and handed over through a `flume` channel that the
//! event loop awaits.

use std::path::PathBuf;

use notify::event::EventKind;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher as _};

use common::fs::FsNotification;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),
}

pub struct Watcher {
    // dropping the watcher stops delivery
    _inner: Option<RecommendedWatcher>,
    // keeps the channel open when there is no watcher
    _idle: Option<flume::Sender<FsNotification>>,
    rx: flume::Receiver<FsNotification>,
}

impl Watcher {
    /// Watch every root recursively
    pub fn new(roots: &[PathBuf]) -> Result<Self, WatchError> {
        let (tx, rx) = flume::unbounded();
        let mut inner = notify::recommended_watcher(move |result: notify::Result<Event>| {
            for notification in translate(result) {
                if tx.send(notification).is_err() {
                    return;
                }
            }
        })?;
        for root in roots {
            inner.watch(root, RecursiveMode::Recursive)?;
            tracing::debug!(root = ?root, "watching");
        }
        Ok(Self {
            _inner: Some(inner),
            _idle: None,
            rx,
        })
    }

    /// A watcher that never reports anything
    pub fn disabled() -> Self {
        let (tx, rx) = flume::unbounded();
        Self {
            _inner: None,
            _idle: Some(tx),
            rx,
        }
    }

    pub fn receiver(&self) -> flume::Receiver<FsNotification> {
        self.rx.clone()
    }
}

fn translate(result: notify::Result<Event>) -> Vec<FsNotification> {
    match result {
        Err(e) => {
            tracing::warn!("watcher error, rescanning: {}", e);
            vec![FsNotification::Overflow]
        }
        Ok(event) if event.need_rescan() => vec![FsNotification::Overflow],
        Ok(event) => match event.kind {
            EventKind::Access(_) => Vec::new(),
            _ => event.paths.into_iter().map(FsNotification::Changed).collect(),
        },
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use notify::event::{AccessKind, CreateKind, Flag};

    #[test]
    fn test_changes_become_path_notifications() {
        let event = Event::new(EventKind::Create(CreateKind::File)).add_path(PathBuf::from("/sync/a"));
        assert_eq!(
            translate(Ok(event)),
            vec![FsNotification::Changed(PathBuf::from("/sync/a"))]
        );
    }

    #[test]
    fn test_access_is_ignored() {
        let event = Event::new(EventKind::Access(AccessKind::Any)).add_path(PathBuf::from("/sync/a"));
        assert!(translate(Ok(event)).is_empty());
    }

    #[test]
    fn test_rescan_flag_and_errors_overflow() {
        let event = Event::new(EventKind::Other).set_flag(Flag::Rescan);
        assert_eq!(translate(Ok(event)), vec![FsNotification::Overflow]);
        assert_eq!(
            translate(Err(notify::Error::generic("queue full"))),
            vec![FsNotification::Overflow]
        );
    }

    #[tokio::test]
    async fn test_file_write_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let watcher = Watcher::new(&[root.clone()]).unwrap();
        std::fs::write(root.join("new.txt"), b"x").unwrap();

        let rx = watcher.receiver();
        let got = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match rx.recv_async().await {
                    Ok(FsNotification::Changed(path)) if path.ends_with("new.txt") => return true,
                    Ok(_) => continue,
                    Err(_) => return false,
                }
            }
        })
        .await;
        assert!(matches!(got, Ok(true)));
    }
}
