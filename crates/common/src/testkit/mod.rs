/// In-process test harness for engine integration tests
///
/// Everything the client needs from the outside world has an in-memory
/// stand-in here: a filesystem that records its own change notifications,
/// a sink that remembers every callback, and a [`Harness`] that wires them
/// to a [`crate::loopback::LoopbackService`] session and drives the client
/// on a manual clock.
///
/// # Example
///
/// ```rust,ignore
/// use common::testkit::Harness;
///
/// #[test]
/// fn test_upload_reaches_service() {
///     let mut device = Harness::new();
///     device.load();
///     let root = device.service.root();
///     device.add_sync("/sync", root);
///
///     device.write("/sync/notes.txt", b"hello", 100);
///     device.run_until_idle();
///
///     assert_eq!(device.remote_file("notes.txt").unwrap(), b"hello");
/// }
/// ```
mod fs;
mod harness;
mod sink;

pub use fs::MemoryFs;
pub use harness::Harness;
pub use sink::RecordingSink;

pub use crate::clock::ManualClock;
pub use crate::persistence::MemoryStateStore;
