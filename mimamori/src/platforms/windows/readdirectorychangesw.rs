use std::{
    ffi::OsString,
    io, iter, mem,
    os::windows::ffi::{OsStrExt, OsStringExt},
    path::{Path, PathBuf},
    ptr,
};

use tracing::{trace, warn};
use windows_sys::Win32::{
    Foundation::{
        CloseHandle, GetLastError, ERROR_IO_INCOMPLETE, ERROR_NOTIFY_ENUM_DIR, HANDLE,
        INVALID_HANDLE_VALUE,
    },
    Storage::FileSystem::{
        CreateFileW, ReadDirectoryChangesW, FILE_ACTION_ADDED, FILE_ACTION_MODIFIED,
        FILE_ACTION_REMOVED, FILE_ACTION_RENAMED_NEW_NAME, FILE_ACTION_RENAMED_OLD_NAME,
        FILE_FLAG_BACKUP_SEMANTICS, FILE_FLAG_OVERLAPPED, FILE_LIST_DIRECTORY,
        FILE_NOTIFY_CHANGE_ATTRIBUTES, FILE_NOTIFY_CHANGE_CREATION, FILE_NOTIFY_CHANGE_DIR_NAME,
        FILE_NOTIFY_CHANGE_FILE_NAME, FILE_NOTIFY_CHANGE_LAST_ACCESS,
        FILE_NOTIFY_CHANGE_LAST_WRITE, FILE_NOTIFY_CHANGE_SECURITY, FILE_NOTIFY_CHANGE_SIZE,
        FILE_SHARE_DELETE, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
    },
    System::{
        Threading::CreateEventW,
        IO::{CancelIoEx, GetOverlappedResult, OVERLAPPED},
    },
};

use crate::{paths, platforms::NativeBackend, ChangeEvent, ChangeKind, WatchError, WatchOptions};

const MAX_COMPLETIONS_PER_DRAIN: usize = 64;

// NextEntryOffset, Action, FileNameLength.
const HEADER_LEN: usize = 12;

const NOTIFY_FILTER: u32 = FILE_NOTIFY_CHANGE_FILE_NAME
    | FILE_NOTIFY_CHANGE_DIR_NAME
    | FILE_NOTIFY_CHANGE_ATTRIBUTES
    | FILE_NOTIFY_CHANGE_SIZE
    | FILE_NOTIFY_CHANGE_LAST_WRITE
    | FILE_NOTIFY_CHANGE_LAST_ACCESS
    | FILE_NOTIFY_CHANGE_CREATION
    | FILE_NOTIFY_CHANGE_SECURITY;

/// Watches a directory with an overlapped `ReadDirectoryChangesW` read that is
/// polled, never waited on, from `drain`.
///
/// A single file is watched through its parent directory, keeping only the
/// records naming that file.
pub struct ReadDirectoryChangesBackend {
    handle: HANDLE,
    // Both are written by the kernel while a read is pending, so they live on
    // the heap and must outlive any pending read.
    overlapped: Box<OVERLAPPED>,
    buffer: Vec<u32>,
    directory: PathBuf,
    target: Option<PathBuf>,
    recursive: bool,
    pending: bool,
}

// The handles are only touched by the thread that owns the backend.
unsafe impl Send for ReadDirectoryChangesBackend {}

/// ReadDirectoryChangesW folds metadata and content changes into
/// `FILE_ACTION_MODIFIED`, so only five actions exist.
pub(crate) fn translate(action: u32) -> Option<ChangeKind> {
    match action {
        FILE_ACTION_ADDED => Some(ChangeKind::Created),
        FILE_ACTION_REMOVED => Some(ChangeKind::Deleted),
        FILE_ACTION_MODIFIED => Some(ChangeKind::Modified),
        FILE_ACTION_RENAMED_OLD_NAME | FILE_ACTION_RENAMED_NEW_NAME => Some(ChangeKind::Moved),
        _ => None,
    }
}

fn read_u32(buffer: &[u8], at: usize) -> Option<u32> {
    let bytes = buffer.get(at..at + 4)?;
    Some(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

/// Splits a buffer of `FILE_NOTIFY_INFORMATION` records into
/// `(action, wide name)` pairs. A truncated record ends the walk.
pub(crate) fn parse_notifications(buffer: &[u8]) -> Vec<(u32, Vec<u16>)> {
    let mut records = Vec::new();
    let mut offset = 0usize;

    loop {
        let (Some(next), Some(action), Some(name_len)) = (
            read_u32(buffer, offset),
            read_u32(buffer, offset + 4),
            read_u32(buffer, offset + 8),
        ) else {
            break;
        };

        let start = offset + HEADER_LEN;
        let Some(name) = buffer.get(start..start + name_len as usize) else {
            break;
        };

        let wide = name
            .chunks_exact(2)
            .map(|pair| u16::from_ne_bytes([pair[0], pair[1]]))
            .collect();
        records.push((action, wide));

        if next == 0 {
            break;
        }
        offset += next as usize;
    }

    records
}

impl NativeBackend for ReadDirectoryChangesBackend {
    fn open(path: &Path, options: &WatchOptions) -> Result<Self, WatchError> {
        let (directory, target) = if path.is_dir() {
            (path.to_path_buf(), None)
        } else {
            let parent = path
                .parent()
                .ok_or_else(|| WatchError::PathNotFound(path.to_path_buf()))?;
            (parent.to_path_buf(), Some(path.to_path_buf()))
        };

        let wide: Vec<u16> = directory
            .as_os_str()
            .encode_wide()
            .chain(iter::once(0))
            .collect();

        let handle = unsafe {
            CreateFileW(
                wide.as_ptr(),
                FILE_LIST_DIRECTORY,
                FILE_SHARE_READ | FILE_SHARE_WRITE | FILE_SHARE_DELETE,
                ptr::null(),
                OPEN_EXISTING,
                FILE_FLAG_BACKUP_SEMANTICS | FILE_FLAG_OVERLAPPED,
                ptr::null_mut(),
            )
        };
        if handle == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error().into());
        }

        let event = unsafe { CreateEventW(ptr::null(), 1, 0, ptr::null()) };
        if event.is_null() {
            let e = io::Error::last_os_error();
            unsafe { CloseHandle(handle) };
            return Err(e.into());
        }

        let mut overlapped: Box<OVERLAPPED> = Box::new(unsafe { mem::zeroed() });
        overlapped.hEvent = event;

        let mut backend = ReadDirectoryChangesBackend {
            handle,
            overlapped,
            buffer: vec![0u32; options.buffer_size / mem::size_of::<u32>()],
            directory,
            target,
            recursive: options.recursive,
            pending: false,
        };

        backend.arm()?;
        Ok(backend)
    }

    fn drain(&mut self, sink: &mut dyn FnMut(ChangeEvent)) {
        for _ in 0..MAX_COMPLETIONS_PER_DRAIN {
            if !self.pending {
                if let Err(e) = self.arm() {
                    warn!("unable to re-arm watch on {:?}: {e}", self.directory);
                    return;
                }
            }

            let mut transferred = 0u32;
            let done = unsafe {
                GetOverlappedResult(self.handle, &*self.overlapped, &mut transferred, 0)
            };

            if done == 0 {
                let code = unsafe { GetLastError() };
                if code == ERROR_IO_INCOMPLETE {
                    return;
                }

                self.pending = false;
                if code == ERROR_NOTIFY_ENUM_DIR {
                    sink(ChangeEvent::new(ChangeKind::Other, self.root()));
                    continue;
                }

                warn!(
                    "ReadDirectoryChangesW failed on {:?}: os error {code}",
                    self.directory
                );
                return;
            }

            self.pending = false;

            // Copy the records out before the buffer is handed back to the
            // kernel, then re-arm so nothing is missed while dispatching.
            let records = if transferred == 0 {
                None
            } else {
                Some(parse_notifications(self.filled(transferred)))
            };

            if let Err(e) = self.arm() {
                warn!("unable to re-arm watch on {:?}: {e}", self.directory);
            }

            match records {
                // A zero-length completion means the buffer overflowed.
                None => sink(ChangeEvent::new(ChangeKind::Other, self.root())),
                Some(records) => {
                    for (action, name) in records {
                        self.dispatch(action, &name, sink);
                    }
                }
            }
        }
    }
}

impl ReadDirectoryChangesBackend {
    fn arm(&mut self) -> Result<(), WatchError> {
        let ok = unsafe {
            ReadDirectoryChangesW(
                self.handle,
                self.buffer.as_mut_ptr().cast(),
                (self.buffer.len() * mem::size_of::<u32>()) as u32,
                i32::from(self.recursive),
                NOTIFY_FILTER,
                ptr::null_mut(),
                &mut *self.overlapped,
                None,
            )
        };

        if ok == 0 {
            self.pending = false;
            return Err(io::Error::last_os_error().into());
        }

        self.pending = true;
        Ok(())
    }

    fn filled(&self, transferred: u32) -> &[u8] {
        let len = (transferred as usize).min(self.buffer.len() * mem::size_of::<u32>());
        // SAFETY: the read has completed, so the kernel no longer writes into
        // the buffer, and `len` is within its allocation.
        unsafe { std::slice::from_raw_parts(self.buffer.as_ptr().cast::<u8>(), len) }
    }

    fn root(&self) -> PathBuf {
        self.target.clone().unwrap_or_else(|| self.directory.clone())
    }

    fn dispatch(&self, action: u32, name: &[u16], sink: &mut dyn FnMut(ChangeEvent)) {
        let Some(kind) = translate(action) else {
            trace!("skipping unknown directory change action {action}");
            return;
        };

        let path = paths::resolve(&OsString::from_wide(name), &self.directory);
        if let Some(target) = &self.target {
            if &path != target {
                return;
            }
        }

        sink(ChangeEvent::new(kind, path));
    }
}

impl Drop for ReadDirectoryChangesBackend {
    fn drop(&mut self) {
        if self.pending {
            let mut transferred = 0u32;
            unsafe {
                CancelIoEx(self.handle, &*self.overlapped);
                // Blocks until the cancelled read has really finished with
                // `overlapped` and `buffer`.
                GetOverlappedResult(self.handle, &*self.overlapped, &mut transferred, 1);
            }
        }

        unsafe {
            CloseHandle(self.overlapped.hEvent);
            CloseHandle(self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    fn record(next: u32, action: u32, name: &str) -> Vec<u8> {
        let wide: Vec<u16> = name.encode_utf16().collect();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&next.to_ne_bytes());
        bytes.extend_from_slice(&action.to_ne_bytes());
        bytes.extend_from_slice(&((wide.len() * 2) as u32).to_ne_bytes());
        for unit in wide {
            bytes.extend_from_slice(&unit.to_ne_bytes());
        }
        bytes
    }

    #[test]
    fn actions_follow_the_support_matrix() {
        assert_eq!(translate(FILE_ACTION_ADDED), Some(ChangeKind::Created));
        assert_eq!(translate(FILE_ACTION_MODIFIED), Some(ChangeKind::Modified));
        assert_eq!(translate(FILE_ACTION_RENAMED_OLD_NAME), Some(ChangeKind::Moved));
        assert_eq!(translate(FILE_ACTION_RENAMED_NEW_NAME), Some(ChangeKind::Moved));
        assert_eq!(translate(FILE_ACTION_REMOVED), Some(ChangeKind::Deleted));
        assert_eq!(translate(0x42), None);
    }

    #[test]
    fn linked_records_are_walked_in_order() {
        let mut first = record(0, FILE_ACTION_RENAMED_OLD_NAME, "old.txt");
        while first.len() % 4 != 0 {
            first.push(0);
        }
        let next = first.len() as u32;
        first[0..4].copy_from_slice(&next.to_ne_bytes());
        first.extend(record(0, FILE_ACTION_RENAMED_NEW_NAME, "new.txt"));

        let parsed = parse_notifications(&first);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].0, FILE_ACTION_RENAMED_OLD_NAME);
        assert_eq!(String::from_utf16(&parsed[1].1).unwrap(), "new.txt");
    }

    #[test]
    fn truncated_records_are_dropped() {
        let mut bytes = record(0, FILE_ACTION_ADDED, "cut.txt");
        bytes.truncate(bytes.len() - 3);
        assert!(parse_notifications(&bytes).is_empty());
    }

    #[test]
    fn created_files_are_drained() {
        let dir = tempfile::tempdir().unwrap();
        let root = crate::paths::normalize(dir.path()).unwrap();
        let mut backend =
            ReadDirectoryChangesBackend::open(&root, &WatchOptions::default()).unwrap();

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
}
