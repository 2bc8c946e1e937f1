mod platforms;

pub mod library;
pub mod options;
pub mod paths;
pub mod registry;
pub mod simple;
pub mod stream;
pub mod watcher;

use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use thiserror::Error;

pub use library::{reloader, DynamicLibrary, LibraryListener, ReloadHandler, Reloader};
pub use options::WatchOptions;
pub use registry::{Registration, WatchRegistry};
pub use simple::{simple_watcher, BoxedCallback, Callback, SimpleWatcher};
pub use stream::{watch_stream, StreamForwarder};
pub use watcher::Watcher;

#[derive(Error, Debug, Clone)]
pub enum WatchError {
    #[error("cannot watch non-existent path {0:?}")]
    PathNotFound(PathBuf),

    #[error("file system error {0}")]
    FileSystemError(String),

    #[error("unable to start the watch dispatcher: {0}")]
    DispatcherError(String),

    #[error("dynamic library error: {0}")]
    LibraryError(String),
}

impl From<io::Error> for WatchError {
    fn from(value: io::Error) -> Self {
        WatchError::FileSystemError(value.to_string())
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for WatchError {
    fn from(value: nix::errno::Errno) -> Self {
        WatchError::FileSystemError(value.to_string())
    }
}

impl From<libloading::Error> for WatchError {
    fn from(value: libloading::Error) -> Self {
        WatchError::LibraryError(value.to_string())
    }
}

/// Platform-independent classification of a filesystem change.
///
/// Not every backend produces every kind. ReadDirectoryChangesW cannot tell
/// metadata changes apart from content changes and reports both as
/// [`ChangeKind::Modified`]; it never reports `Accessed`, `MetadataChanged`,
/// `HandleClosed` or `Opened`. FSEvents never reports `Accessed`,
/// `HandleClosed` or `Opened` either.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum ChangeKind {
    Accessed,
    MetadataChanged,
    HandleClosed,
    Created,
    Deleted,
    Modified,
    Moved,
    Opened,
    Other,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 9] = [
        ChangeKind::Accessed,
        ChangeKind::MetadataChanged,
        ChangeKind::HandleClosed,
        ChangeKind::Created,
        ChangeKind::Deleted,
        ChangeKind::Modified,
        ChangeKind::Moved,
        ChangeKind::Opened,
        ChangeKind::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Accessed => "accessed",
            ChangeKind::MetadataChanged => "metadata_changed",
            ChangeKind::HandleClosed => "handle_closed",
            ChangeKind::Created => "created",
            ChangeKind::Deleted => "deleted",
            ChangeKind::Modified => "modified",
            ChangeKind::Moved => "moved",
            ChangeKind::Opened => "opened",
            ChangeKind::Other => "other",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Absolute path of the affected entry. May be a child of the watched
    /// directory, or the watched path itself.
    pub path: PathBuf,
}

impl ChangeEvent {
    pub fn new(kind: ChangeKind, path: PathBuf) -> Self {
        ChangeEvent { kind, path }
    }
}

/// Receives the events of one [`Watcher`].
///
/// Every method runs on the registry's dispatcher thread, never on the thread
/// that started the watcher. Implementors either override the per-kind
/// methods they care about or override [`ChangeHandler::handle`] itself.
pub trait ChangeHandler: Send + Sync + 'static {
    fn on_accessed(&self, _path: &Path) {}

    fn on_metadata_changed(&self, _path: &Path) {}

    fn on_handle_closed(&self, _path: &Path) {}

    fn on_created(&self, _path: &Path) {}

    fn on_deleted(&self, _path: &Path) {}

    fn on_modified(&self, _path: &Path) {}

    fn on_moved(&self, _path: &Path) {}

    fn on_opened(&self, _path: &Path) {}

    fn on_other(&self, _path: &Path) {}

    /// Entry point used by the dispatcher. Called once per canonical event.
    fn handle(&self, event: &ChangeEvent) {
        let path = event.path.as_path();
        match event.kind {
            ChangeKind::Accessed => self.on_accessed(path),
            ChangeKind::MetadataChanged => self.on_metadata_changed(path),
            ChangeKind::HandleClosed => self.on_handle_closed(path),
            ChangeKind::Created => self.on_created(path),
            ChangeKind::Deleted => self.on_deleted(path),
            ChangeKind::Modified => self.on_modified(path),
            ChangeKind::Moved => self.on_moved(path),
            ChangeKind::Opened => self.on_opened(path),
            ChangeKind::Other => self.on_other(path),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        path::{Path, PathBuf},
        sync::Arc,
        time::{Duration, Instant},
    };

    use parking_lot::Mutex;

    use crate::{ChangeEvent, ChangeHandler, ChangeKind};

    /// Records every event it receives.
    #[derive(Default)]
    pub struct Recorder {
        events: Mutex<Vec<ChangeEvent>>,
    }

    impl Recorder {
        pub fn events(&self) -> Vec<ChangeEvent> {
            self.events.lock().clone()
        }

        pub fn count(&self, kind: ChangeKind, path: &Path) -> usize {
            self.events
                .lock()
                .iter()
                .filter(|e| e.kind == kind && e.path == path)
                .count()
        }

        pub fn clear(&self) {
            self.events.lock().clear();
        }
    }

    impl ChangeHandler for Recorder {
        fn handle(&self, event: &ChangeEvent) {
            self.events.lock().push(event.clone());
        }
    }

    impl ChangeHandler for Arc<Recorder> {
        fn handle(&self, event: &ChangeEvent) {
            self.as_ref().handle(event)
        }
    }

    pub const FAST_POLL: Duration = Duration::from_millis(20);

    /// Polls `condition` until it holds or two seconds pass.
    pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    /// Lets a few dispatcher cycles pass.
    pub fn settle() {
        std::thread::sleep(FAST_POLL * 10);
    }

    /// Routes `tracing` output through the test harness. Safe to call from
    /// every test.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    }

    pub fn canonical_tempdir() -> (tempfile::TempDir, PathBuf) {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = crate::paths::normalize(dir.path()).expect("normalize tempdir");
        (dir, path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counting {
        seen: parking_lot::Mutex<Vec<ChangeKind>>,
    }

    impl ChangeHandler for Counting {
        fn on_created(&self, _path: &Path) {
            self.seen.lock().push(ChangeKind::Created);
        }

        fn on_moved(&self, _path: &Path) {
            self.seen.lock().push(ChangeKind::Moved);
        }
    }

    #[test]
    fn handle_dispatches_to_the_matching_method_only() {
        let handler = Counting {
            seen: parking_lot::Mutex::new(Vec::new()),
        };
        for kind in ChangeKind::ALL {
            handler.handle(&ChangeEvent::new(kind, PathBuf::from("/tmp/x")));
        }
        assert_eq!(
            *handler.seen.lock(),
            vec![ChangeKind::Created, ChangeKind::Moved]
        );
    }

    #[test]
    fn kind_names_are_distinct() {
        let names: std::collections::HashSet<_> =
            ChangeKind::ALL.iter().map(|k| k.to_string()).collect();
        assert_eq!(names.len(), ChangeKind::ALL.len());
        assert_eq!(ChangeKind::MetadataChanged.to_string(), "metadata_changed");
    }

    #[test]
    fn io_errors_become_file_system_errors() {
        let err: WatchError = io::Error::new(io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, WatchError::FileSystemError(msg) if msg.contains("boom")));
    }
}
