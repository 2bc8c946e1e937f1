use std::path::Path;

use crate::{ChangeEvent, WatchError, WatchOptions};

/// A native change-notification channel bound to one watched path.
///
/// `drain` is only ever called from the registry's dispatcher thread and must
/// not block. Dropping the backend releases every native resource; a backend
/// with outstanding native I/O cancels it and waits for the cancellation
/// before the memory that I/O writes into is freed.
pub(crate) trait NativeBackend: Send {
    fn open(path: &Path, options: &WatchOptions) -> Result<Self, WatchError>
    where
        Self: Sized;

    /// Hands every pending event to `sink`, in the order the OS reported them.
    fn drain(&mut self, sink: &mut dyn FnMut(ChangeEvent));
}

#[cfg(any(target_os = "linux", target_os = "android"))]
pub mod linux;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use linux::inotify::InotifyBackend as PlatformBackend;

#[cfg(target_os = "windows")]
pub mod windows;

#[cfg(target_os = "windows")]
pub(crate) use windows::readdirectorychangesw::ReadDirectoryChangesBackend as PlatformBackend;

#[cfg(target_os = "macos")]
pub mod darwin;

#[cfg(target_os = "macos")]
pub(crate) use darwin::fsevents::FSEventsBackend as PlatformBackend;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "windows",
    target_os = "macos"
)))]
pub mod unsupported;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "windows",
    target_os = "macos"
)))]
pub(crate) use unsupported::UnsupportedBackend as PlatformBackend;

pub(crate) const SUPPORTED: bool = cfg!(any(
    target_os = "linux",
    target_os = "android",
    target_os = "windows",
    target_os = "macos"
));
