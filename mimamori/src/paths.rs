//! Path resolution used by the backends.
//!
//! Only lexical work happens here: nothing touches the disk, so symlinks are
//! not resolved and the result of resolving a deleted entry's name is still
//! well-defined.

use std::{
    ffi::OsStr,
    io,
    path::{self, Component, Path, PathBuf},
};

/// Makes `path` absolute against the current directory and collapses `.` and
/// `..` components.
pub fn normalize(path: &Path) -> io::Result<PathBuf> {
    Ok(collapse(&path::absolute(path)?))
}

/// Resolves a name reported by the OS against the directory it was reported
/// for. An empty name refers to `base` itself.
pub fn resolve(raw_name: &OsStr, base: &Path) -> PathBuf {
    if raw_name.is_empty() {
        return base.to_path_buf();
    }

    let raw = Path::new(raw_name);
    if raw.is_absolute() {
        collapse(raw)
    } else {
        collapse(&base.join(raw))
    }
}

fn collapse(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
