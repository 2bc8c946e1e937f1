use std::time::Duration;

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;
pub const MIN_BUFFER_SIZE: usize = 1024;

/// Settings for a [`WatchRegistry`](crate::WatchRegistry) and the backends
/// opened by a [`Watcher`](crate::Watcher).
///
/// `poll_interval` is read by the registry when it is created; `buffer_size`
/// and `recursive` are read each time a watcher opens a backend.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchOptions {
    /// How long the dispatcher sleeps between drain cycles.
    pub poll_interval: Duration,
    /// Size of the scratch buffer ReadDirectoryChangesW writes into.
    pub buffer_size: usize,
    /// Also report changes below the direct children of a watched directory.
    pub recursive: bool,
}

impl Default for WatchOptions {
    fn default() -> Self {
        WatchOptions {
            poll_interval: DEFAULT_POLL_INTERVAL,
            buffer_size: DEFAULT_BUFFER_SIZE,
            recursive: false,
        }
    }
}

impl WatchOptions {
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size.max(MIN_BUFFER_SIZE);
        self
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }
}
