use std::{
    collections::{HashMap, HashSet, VecDeque},
    fs,
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use nix::{
    errno::Errno,
    sys::inotify::{AddWatchFlags, InitFlags, Inotify, InotifyEvent, WatchDescriptor},
};
use tracing::{trace, warn};

use crate::{paths, platforms::NativeBackend, ChangeEvent, ChangeKind, WatchError, WatchOptions};

// nix reads at most 4096 bytes per call; bound the reads so one busy
// directory cannot hold the dispatcher forever.
const MAX_READS_PER_DRAIN: usize = 64;

pub struct InotifyBackend {
    inotify: Inotify,
    root: PathBuf,
    recursive: bool,
    watch_descriptors: HashMap<WatchDescriptor, PathBuf>,
}

fn watch_mask() -> AddWatchFlags {
    AddWatchFlags::IN_ACCESS
        | AddWatchFlags::IN_ATTRIB
        | AddWatchFlags::IN_CLOSE
        | AddWatchFlags::IN_CREATE
        | AddWatchFlags::IN_DELETE
        | AddWatchFlags::IN_DELETE_SELF
        | AddWatchFlags::IN_MODIFY
        | AddWatchFlags::IN_MOVE
        | AddWatchFlags::IN_MOVE_SELF
        | AddWatchFlags::IN_OPEN
}

/// Maps an inotify mask onto canonical kinds, most specific first. One record
/// normally carries a single event bit, but every set bit is honoured.
pub(crate) fn translate(mask: AddWatchFlags) -> Vec<ChangeKind> {
    let table = [
        (AddWatchFlags::IN_ACCESS, ChangeKind::Accessed),
        (AddWatchFlags::IN_ATTRIB, ChangeKind::MetadataChanged),
        (AddWatchFlags::IN_CLOSE, ChangeKind::HandleClosed),
        (AddWatchFlags::IN_CREATE, ChangeKind::Created),
        (AddWatchFlags::IN_MODIFY, ChangeKind::Modified),
        (AddWatchFlags::IN_OPEN, ChangeKind::Opened),
        (
            AddWatchFlags::IN_MOVE | AddWatchFlags::IN_MOVE_SELF,
            ChangeKind::Moved,
        ),
        (
            AddWatchFlags::IN_DELETE | AddWatchFlags::IN_DELETE_SELF,
            ChangeKind::Deleted,
        ),
        (
            AddWatchFlags::IN_UNMOUNT | AddWatchFlags::IN_Q_OVERFLOW,
            ChangeKind::Other,
        ),
    ];

    table
        .into_iter()
        .filter(|(bits, _)| mask.intersects(*bits))
        .map(|(_, kind)| kind)
        .collect()
}

impl NativeBackend for InotifyBackend {
    fn open(path: &Path, options: &WatchOptions) -> Result<Self, WatchError> {
        let inotify = Inotify::init(InitFlags::IN_CLOEXEC | InitFlags::IN_NONBLOCK)?;

        let mut backend = InotifyBackend {
            inotify,
            root: path.to_path_buf(),
            recursive: options.recursive,
            watch_descriptors: HashMap::new(),
        };

        backend.mark(path)?;
        if backend.recursive && path.is_dir() {
            backend.mark_tree(path);
        }

        Ok(backend)
    }

    fn drain(&mut self, sink: &mut dyn FnMut(ChangeEvent)) {
        for _ in 0..MAX_READS_PER_DRAIN {
            let records = match self.inotify.read_events() {
                Ok(records) => records,
                Err(Errno::EAGAIN) => return,
                Err(e) => {
                    warn!("inotify read failed for {:?}: {e}", self.root);
                    return;
                }
            };

            if records.is_empty() {
                return;
            }

            for record in records {
                self.dispatch(record, sink);
            }
        }
    }
}

impl InotifyBackend {
    fn dispatch(&mut self, record: InotifyEvent, sink: &mut dyn FnMut(ChangeEvent)) {
        if record.mask.contains(AddWatchFlags::IN_IGNORED) {
            self.watch_descriptors.remove(&record.wd);
        }

        let kinds = translate(record.mask);
        if kinds.is_empty() {
            trace!("skipping inotify record with mask {:?}", record.mask);
            return;
        }

        // The overflow record carries wd -1, which is never in the map.
        let base = self
            .watch_descriptors
            .get(&record.wd)
            .map(PathBuf::as_path)
            .unwrap_or(self.root.as_path());

        let path = match &record.name {
            Some(name) => paths::resolve(name, base),
            None => base.to_path_buf(),
        };

        if self.recursive && record.mask.contains(AddWatchFlags::IN_ISDIR) {
            // A directory moved away keeps its watches; drop them so nothing
            // outside the tree is reported under its old path. One moved
            // within the tree is marked again by its IN_MOVED_TO.
            if record.mask.contains(AddWatchFlags::IN_MOVED_FROM) {
                self.unmark_tree(&path);
            }

            if record
                .mask
                .intersects(AddWatchFlags::IN_CREATE | AddWatchFlags::IN_MOVED_TO)
            {
                match self.mark(&path) {
                    Ok(()) => self.mark_tree(&path),
                    Err(e) => warn!("unable to watch new directory {path:?}: {e}"),
                }
            }
        }

        for kind in kinds {
            sink(ChangeEvent::new(kind, path.clone()));
        }
    }

    fn mark(&mut self, path: &Path) -> Result<(), WatchError> {
        let wd = self.inotify.add_watch(path, watch_mask())?;
        self.watch_descriptors.insert(wd, path.to_path_buf());
        Ok(())
    }

    /// Watches every directory below `top`, which must already be marked.
    /// Directories that cannot be watched are logged and skipped.
    fn mark_tree(&mut self, top: &Path) {
        let mut traversal_queue = VecDeque::from([top.to_path_buf()]);
        let mut visited = HashSet::<u64>::new();

        while let Some(next_dir) = traversal_queue.pop_front() {
            let Ok(dir_items) = fs::read_dir(&next_dir) else {
                continue;
            };

            for dir_item in dir_items.flatten() {
                let Ok(metadata) = fs::symlink_metadata(dir_item.path()) else {
                    continue;
                };

                if metadata.is_dir() && visited.insert(metadata.ino()) {
                    let path = dir_item.path();
                    match self.mark(&path) {
                        Ok(()) => traversal_queue.push_back(path),
                        Err(e) => warn!("unable to watch directory {path:?}: {e}"),
                    }
                }
            }
        }
    }

    /// Removes the watches on `top` and everything below it.
    fn unmark_tree(&mut self, top: &Path) {
        let inotify = &self.inotify;
        self.watch_descriptors.retain(|wd, path| {
            if !path.starts_with(top) {
                return true;
            }
            // The kernel may already have dropped it.
            let _ = inotify.rm_watch(*wd);
            false
        });
    }
}

impl Drop for InotifyBackend {
    fn drop(&mut self) {
        for wd in self.watch_descriptors.keys() {
            // Fails harmlessly for watches the kernel already dropped.
            let _ = self.inotify.rm_watch(*wd);
        }
        // The inotify descriptor itself is closed when `inotify` drops.
    }
}
