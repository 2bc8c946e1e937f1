use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    sync::Arc,
};

use libloading::Library;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{paths, ChangeHandler, WatchError, Watcher};

/// Notified when a [`DynamicLibrary`] is opened, closed or reloaded. Called
/// from whichever thread triggered the change, including the watch
/// dispatcher when driven by a [`Reloader`].
pub trait LibraryListener: Send + Sync {
    fn library_opened(&self, _success: bool) {}

    fn library_closed(&self) {}

    /// Sent instead of a close/open pair when the library is reloaded.
    fn library_reloaded(&self, _success: bool) {}
}

#[derive(Default)]
struct LibraryState {
    library: Option<Library>,
    file: Option<PathBuf>,
    name: Option<OsString>,
}

/// A loaded shared library that can be closed and reloaded in place.
#[derive(Default)]
pub struct DynamicLibrary {
    state: Mutex<LibraryState>,
    listeners: Mutex<Vec<Arc<dyn LibraryListener>>>,
}

/// Bare names get the platform prefix and suffix; anything that looks like a
/// path or already has an extension is used verbatim.
fn library_file_name(name_or_path: &str) -> OsString {
    let path = Path::new(name_or_path);
    if path.components().count() > 1 || path.extension().is_some() {
        OsString::from(name_or_path)
    } else {
        libloading::library_filename(name_or_path)
    }
}

impl DynamicLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_new(name_or_path: &str) -> Result<Self, WatchError> {
        let library = Self::new();
        library.open(name_or_path)?;
        Ok(library)
    }

    pub fn add_listener(&self, listener: Arc<dyn LibraryListener>) {
        self.listeners.lock().push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn LibraryListener>) {
        self.listeners
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().library.is_some()
    }

    /// The file the library was loaded from, when it was opened by path.
    /// Libraries found through the loader's search path have none.
    pub fn file(&self) -> Option<PathBuf> {
        self.state.lock().file.clone()
    }

    /// Opens the library, closing any previously opened one first.
    pub fn open(&self, name_or_path: &str) -> Result<(), WatchError> {
        let result = self.open_quietly(name_or_path);
        self.notify(|l| l.library_opened(result.is_ok()));
        result
    }

    pub fn close(&self) {
        if self.close_quietly() {
            self.notify(|l| l.library_closed());
        }
    }

    /// Closes and reopens the library from the same file.
    pub fn reload(&self) -> Result<(), WatchError> {
        let (file, name) = {
            let state = self.state.lock();
            if state.library.is_none() {
                return Err(WatchError::LibraryError("library is not open".to_owned()));
            }
            (state.file.clone(), state.name.clone())
        };

        if let Some(file) = &file {
            if !file.exists() {
                return Err(WatchError::PathNotFound(file.clone()));
            }
        }

        let target = file
            .map(PathBuf::into_os_string)
            .or(name)
            .unwrap_or_default();
        let result = match target.to_str() {
            Some(target) => self.open_quietly(target),
            None => Err(WatchError::LibraryError(format!(
                "library path {target:?} is not valid UTF-8"
            ))),
        };

        self.notify(|l| l.library_reloaded(result.is_ok()));
        result
    }

    fn open_quietly(&self, name_or_path: &str) -> Result<(), WatchError> {
        self.close_quietly();

        if name_or_path.is_empty() {
            return Err(WatchError::LibraryError("empty library name".to_owned()));
        }

        let file_name = library_file_name(name_or_path);
        let file = if Path::new(&file_name).components().count() > 1 {
            Some(paths::normalize(Path::new(&file_name))?)
        } else {
            None
        };

        let target = match &file {
            Some(file) => file.as_os_str(),
            None => file_name.as_os_str(),
        };

        // SAFETY: loading runs the library's initialisers; callers choose
        // which libraries to trust.
        let library = unsafe { Library::new(target) }?;
        debug!("opened library {file_name:?}");

        let mut state = self.state.lock();
        state.library = Some(library);
        state.file = file;
        state.name = Some(file_name);
        Ok(())
    }

    fn close_quietly(&self) -> bool {
        let library = self.state.lock().library.take();
        match library {
            Some(library) => {
                if let Err(e) = library.close() {
                    warn!("closing library failed: {e}");
                }
                true
            }
            None => false,
        }
    }

    fn notify(&self, f: impl Fn(&dyn LibraryListener)) {
        let listeners = self.listeners.lock().clone();
        for listener in listeners {
            f(listener.as_ref());
        }
    }
}

/// Closes the library when its file is deleted and reloads it when the file
/// is modified.
pub struct ReloadHandler {
    library: Arc<DynamicLibrary>,
}

impl ReloadHandler {
    pub fn new(library: Arc<DynamicLibrary>) -> Self {
        ReloadHandler { library }
    }

    pub fn library(&self) -> &Arc<DynamicLibrary> {
        &self.library
    }
}

impl ChangeHandler for ReloadHandler {
    fn on_deleted(&self, _path: &Path) {
        self.library.close();
    }

    fn on_modified(&self, path: &Path) {
        if let Err(e) = self.library.reload() {
            warn!("reloading library after change to {path:?} failed: {e}");
        }
    }
}

pub type Reloader = Watcher<ReloadHandler>;

/// Watches the file behind `library` on the shared registry.
pub fn reloader(library: Arc<DynamicLibrary>) -> Result<Reloader, WatchError> {
    let file = library.file().ok_or_else(|| {
        WatchError::LibraryError("library has no backing file to watch".to_owned())
    })?;
    Watcher::new(file, ReloadHandler::new(library))
}
