pub mod daemon;
pub mod disk_fs;
pub mod process;
pub mod state;
pub mod store;
pub mod version;
pub mod watcher;

pub use daemon::{Daemon, DaemonError};
pub use disk_fs::DiskFs;
pub use state::{AppConfig, AppState, StateError};
pub use store::FileStateStore;
pub use watcher::Watcher;
