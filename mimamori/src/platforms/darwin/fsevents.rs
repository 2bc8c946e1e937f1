use std::{
    collections::VecDeque,
    ffi::{CStr, OsStr},
    mem,
    os::unix::ffi::OsStrExt,
    path::{Path, PathBuf},
    ptr,
    sync::Arc,
};

use libc::c_void;
use parking_lot::Mutex;
use tracing::trace;

use super::core_foundation::{
    self as CoreFoundation,
    types::{
        self as CFTypes, EventPaths, FSEventStreamCreateFlags as CreateFlags,
        FSEventStreamEventFlags as EventFlags, FSEventStreamRef,
    },
};
use crate::{paths, platforms::NativeBackend, ChangeEvent, ChangeKind, WatchError, WatchOptions};

type Records = Mutex<VecDeque<(PathBuf, EventFlags)>>;

/// Watches a path with an FSEvents stream scheduled on a private dispatch
/// queue.
///
/// FSEvents pushes records from the queue's thread; they are buffered until
/// the registry drains them. FSEvents always watches a whole tree and reports
/// resolved paths, so records are rebased onto the path the caller asked for
/// and filtered down to what a non-recursive watch would see.
pub struct FSEventsBackend {
    stream: FSEventStreamRef,
    queue: CFTypes::dispatch_queue_t,
    records: Arc<Records>,
    /// Resolved directory the stream watches.
    canonical: PathBuf,
    /// The same directory as the caller spelled it.
    directory: PathBuf,
    /// Name of the watched file when a single file is watched.
    file_name: Option<PathBuf>,
    recursive: bool,
}

// The stream and queue are only touched by the thread that owns the backend.
unsafe impl Send for FSEventsBackend {}

extern "C" fn callback(
    _stream_ref: FSEventStreamRef,
    info: *mut c_void,
    num_events: usize,
    event_paths: *mut c_void,
    event_flags: *const EventFlags,
    _event_ids: *const CFTypes::FSEventStreamId,
) {
    // SAFETY: `info` is the `Arc<Records>` handed over in `open`, kept alive
    // until the stream's release callback runs.
    let records = unsafe { &*(info as *const Records) };
    let event_paths = event_paths as EventPaths;

    let mut records = records.lock();
    for idx in 0..num_events {
        let (path, flags) = unsafe {
            let path = CStr::from_ptr(*event_paths.add(idx));
            (
                PathBuf::from(OsStr::from_bytes(path.to_bytes())),
                *event_flags.add(idx),
            )
        };
        records.push_back((path, flags));
    }
}

extern "C" fn release_records(info: *const c_void) {
    // SAFETY: balances the `Arc::into_raw` in `open`.
    drop(unsafe { Arc::from_raw(info as *const Records) });
}

/// FSEvents coalesces changes, so one record can carry several of these.
const TRANSLATIONS: [(EventFlags, ChangeKind); 6] = [
    (EventFlags::kFSEventStreamEventFlagItemCreated, ChangeKind::Created),
    (EventFlags::kFSEventStreamEventFlagItemModified, ChangeKind::Modified),
    (
        EventFlags::kFSEventStreamEventFlagItemInodeMetaMod
            .union(EventFlags::kFSEventStreamEventFlagItemChangeOwner)
            .union(EventFlags::kFSEventStreamEventFlagItemXattrMod)
            .union(EventFlags::kFSEventStreamEventFlagItemFinderInfoMod),
        ChangeKind::MetadataChanged,
    ),
    (EventFlags::kFSEventStreamEventFlagItemRenamed, ChangeKind::Moved),
    (EventFlags::kFSEventStreamEventFlagItemRemoved, ChangeKind::Deleted),
    (
        EventFlags::kFSEventStreamEventFlagMustScanSubDirs
            .union(EventFlags::kFSEventStreamEventFlagUserDropped)
            .union(EventFlags::kFSEventStreamEventFlagKernelDropped)
            .union(EventFlags::kFSEventStreamEventFlagRootChanged)
            .union(EventFlags::kFSEventStreamEventFlagMount)
            .union(EventFlags::kFSEventStreamEventFlagUnmount),
        ChangeKind::Other,
    ),
];

pub(crate) fn translate(flags: EventFlags) -> Vec<ChangeKind> {
    TRANSLATIONS
        .iter()
        .filter(|(bits, _)| flags.intersects(*bits))
        .map(|(_, kind)| *kind)
        .collect()
}

impl NativeBackend for FSEventsBackend {
    fn open(path: &Path, options: &WatchOptions) -> Result<Self, WatchError> {
        let (directory, file_name) = if path.is_dir() {
            (path.to_path_buf(), None)
        } else {
            match (path.parent(), path.file_name()) {
                (Some(parent), Some(name)) => (parent.to_path_buf(), Some(PathBuf::from(name))),
                _ => return Err(WatchError::PathNotFound(path.to_path_buf())),
            }
        };

        let canonical = directory.canonicalize()?;
        let Some(canonical_str) = canonical.to_str() else {
            return Err(WatchError::FileSystemError(format!(
                "{canonical:?} is not valid UTF-8"
            )));
        };

        let paths_to_watch = unsafe { CoreFoundation::path_array(canonical_str) };
        if paths_to_watch.is_null() {
            return Err(WatchError::FileSystemError(format!(
                "unable to build FSEvents path list for {canonical:?}"
            )));
        }

        let records: Arc<Records> = Arc::new(Mutex::new(VecDeque::new()));
        let context = CFTypes::FSEventStreamContext {
            version: 0,
            info: Arc::into_raw(records.clone()) as *mut c_void,
            retain: None,
            release: Some(release_records),
            copy_description: None,
        };

        let flags = CreateFlags::kFSEventStreamCreateFlagFileEvents
            | CreateFlags::kFSEventStreamCreateFlagNoDefer
            | CreateFlags::kFSEventStreamCreateFlagWatchRoot;

        let stream = unsafe {
            let stream = CoreFoundation::FSEventStreamCreate(
                CFTypes::kCFAllocatorDefault,
                callback,
                &context,
                paths_to_watch,
                CFTypes::kFSEventStreamEventIdSinceNow,
                0.0,
                flags,
            );
            CoreFoundation::CFRelease(paths_to_watch);
            stream
        };

        if stream.is_null() {
            // The stream never took ownership of the context.
            release_records(context.info);
            return Err(WatchError::FileSystemError(format!(
                "unable to create FSEvents stream for {canonical:?}"
            )));
        }

        let queue = unsafe {
            CoreFoundation::dispatch_queue_create(ptr::null(), CFTypes::DISPATCH_QUEUE_SERIAL)
        };

        let backend = FSEventsBackend {
            stream,
            queue,
            records,
            canonical,
            directory,
            file_name,
            recursive: options.recursive,
        };

        let started = unsafe {
            CoreFoundation::FSEventStreamSetDispatchQueue(backend.stream, backend.queue);
            CoreFoundation::FSEventStreamStart(backend.stream)
        };
        if started == 0 {
            return Err(WatchError::FileSystemError(format!(
                "unable to start FSEvents stream for {:?}",
                backend.canonical
            )));
        }

        Ok(backend)
    }

    fn drain(&mut self, sink: &mut dyn FnMut(ChangeEvent)) {
        let records = mem::take(&mut *self.records.lock());

        for (reported, flags) in records {
            let kinds = translate(flags);
            if kinds.is_empty() {
                trace!("skipping FSEvents record {flags:?} for {reported:?}");
                continue;
            }

            let Some(path) = self.rebase(&reported) else {
                continue;
            };

            for kind in kinds {
                sink(ChangeEvent::new(kind, path.clone()));
            }
        }
    }
}

impl FSEventsBackend {
    /// Maps a reported path onto the caller's spelling of the watched path,
    /// or `None` if a non-recursive or single-file watch should not see it.
    fn rebase(&self, reported: &Path) -> Option<PathBuf> {
        let relative = reported.strip_prefix(&self.canonical).ok()?;

        match &self.file_name {
            Some(name) if relative != name.as_path() => return None,
            None if !self.recursive && relative.components().count() > 1 => return None,
            _ => {}
        }

        Some(paths::resolve(relative.as_os_str(), &self.directory))
    }
}

impl Drop for FSEventsBackend {
    fn drop(&mut self) {
        // Invalidating waits for any callback already running on the queue.
        unsafe {
            CoreFoundation::FSEventStreamStop(self.stream);
            CoreFoundation::FSEventStreamInvalidate(self.stream);
            CoreFoundation::FSEventStreamRelease(self.stream);
            CoreFoundation::dispatch_release(self.queue);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn coalesced_flags_yield_every_kind() {
        let flags = EventFlags::kFSEventStreamEventFlagItemCreated
            | EventFlags::kFSEventStreamEventFlagItemRemoved
            | EventFlags::kFSEventStreamEventFlagItemIsFile;
        assert_eq!(
            translate(flags),
            vec![ChangeKind::Created, ChangeKind::Deleted]
        );
        assert_eq!(
            translate(EventFlags::kFSEventStreamEventFlagItemXattrMod),
            vec![ChangeKind::MetadataChanged]
        );
        assert!(translate(EventFlags::kFSEventStreamEventFlagItemIsDir).is_empty());
    }

    #[test]
    fn created_files_are_drained_under_the_callers_path() {
        let (_dir, root) = crate::testing::canonical_tempdir();
        let mut backend = FSEventsBackend::open(&root, &WatchOptions::default()).unwrap();

        let file = root.join("foo.txt");
        fs::write(&file, b"x").unwrap();

        let mut events = Vec::new();
        assert!(crate::testing::wait_until(|| {
            backend.drain(&mut |e| events.push(e));
            events
                .iter()
                .any(|e| e.kind == ChangeKind::Created && e.path == file)
        }));
    }

    #[test]
    fn nested_changes_are_hidden_without_recursion() {
        let (_dir, root) = crate::testing::canonical_tempdir();
        let nested = root.join("nested");
        fs::create_dir(&nested).unwrap();

        let backend = FSEventsBackend::open(&root, &WatchOptions::default()).unwrap();
        let canonical = root.canonicalize().unwrap();
        assert_eq!(
            backend.rebase(&canonical.join("nested")),
            Some(nested.clone())
        );
        assert_eq!(backend.rebase(&canonical.join("nested").join("deep")), None);
    }
}
