use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{debug, warn};

use crate::{
    paths,
    platforms::{NativeBackend, PlatformBackend, SUPPORTED},
    registry::{Registration, WatchRegistry},
    ChangeHandler, WatchError, WatchOptions,
};

/// Watches one file or directory and forwards its changes to a
/// [`ChangeHandler`].
///
/// A running watcher owns exactly one native backend, registered with a
/// [`WatchRegistry`]. Events are delivered on the registry's dispatcher
/// thread. After [`stop`](Watcher::stop) returns, the backend has been
/// released and the handler receives nothing further from it.
pub struct Watcher<H: ChangeHandler> {
    handler: Arc<H>,
    registry: Arc<WatchRegistry>,
    options: WatchOptions,
    watched_path: Option<PathBuf>,
    registration: Option<Registration>,
}

impl<H: ChangeHandler> Watcher<H> {
    /// Starts watching `path` on the shared registry.
    ///
    /// Fails if `path` does not exist or the OS refuses the watch. On a
    /// platform without a backend this returns an inactive watcher instead.
    pub fn new(path: impl AsRef<Path>, handler: H) -> Result<Self, WatchError> {
        Self::with_registry(
            path,
            handler,
            WatchRegistry::shared(),
            WatchOptions::default(),
        )
    }

    pub fn with_registry(
        path: impl AsRef<Path>,
        handler: H,
        registry: Arc<WatchRegistry>,
        options: WatchOptions,
    ) -> Result<Self, WatchError> {
        let mut watcher = Self::inactive_with_registry(handler, registry, options);
        if !SUPPORTED {
            return Ok(watcher);
        }

        let path = paths::normalize(path.as_ref())?;
        if !path.exists() {
            return Err(WatchError::PathNotFound(path));
        }

        watcher.registration = Some(watcher.open(&path)?);
        watcher.watched_path = Some(path);
        Ok(watcher)
    }

    /// A watcher with no path and no native resources.
    pub fn inactive(handler: H) -> Self {
        Self::inactive_with_registry(handler, WatchRegistry::shared(), WatchOptions::default())
    }

    pub fn inactive_with_registry(
        handler: H,
        registry: Arc<WatchRegistry>,
        options: WatchOptions,
    ) -> Self {
        Watcher {
            handler: Arc::new(handler),
            registry,
            options,
            watched_path: None,
            registration: None,
        }
    }

    pub fn supported_by_system() -> bool {
        SUPPORTED
    }

    /// Restarts watching the current path. Returns whether the watcher is
    /// running afterwards; a running watcher is left untouched.
    pub fn start(&mut self) -> bool {
        if self.is_running() {
            return true;
        }

        let Some(path) = self.watched_path.clone() else {
            return false;
        };

        if !SUPPORTED || !path.exists() {
            return false;
        }

        match self.open(&path) {
            Ok(registration) => self.registration = Some(registration),
            Err(e) => warn!("unable to start watching {path:?}: {e}"),
        }

        self.is_running()
    }

    /// Watches `new_path` instead of the current path.
    ///
    /// The same path behaves like [`start`](Watcher::start). Otherwise the
    /// watcher is stopped first, and stays stopped (keeping its old path) if
    /// `new_path` does not exist.
    pub fn start_path(&mut self, new_path: impl AsRef<Path>) -> bool {
        if !SUPPORTED {
            return false;
        }

        let new_path = match paths::normalize(new_path.as_ref()) {
            Ok(path) => path,
            Err(e) => {
                warn!("unable to resolve {:?}: {e}", new_path.as_ref());
                return false;
            }
        };

        if self.watched_path.as_deref() == Some(new_path.as_path()) {
            return self.start();
        }

        self.stop();

        if !new_path.exists() {
            return false;
        }

        self.watched_path = Some(new_path);
        self.start()
    }

    pub fn stop(&mut self) {
        if let Some(registration) = self.registration.take() {
            debug!("stopping watch on {:?}", self.watched_path);
            registration.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.registration.is_some()
    }

    /// The path last given at construction or to
    /// [`start_path`](Watcher::start_path), whether or not it is running.
    pub fn watched_path(&self) -> Option<&Path> {
        self.watched_path.as_deref()
    }

    pub fn handler(&self) -> &Arc<H> {
        &self.handler
    }

    pub fn registry(&self) -> &Arc<WatchRegistry> {
        &self.registry
    }

    fn open(&self, path: &Path) -> Result<Registration, WatchError> {
        let backend = PlatformBackend::open(path, &self.options)?;
        debug!("watching {path:?}");
        self.registry.add(Box::new(backend), self.handler.clone())
    }
}

impl<H: ChangeHandler> Drop for Watcher<H> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Recorder;

    #[test]
    fn inactive_watcher_has_no_path() {
        let watcher = Watcher::inactive(Recorder::default());
        assert!(!watcher.is_running());
        assert!(watcher.watched_path().is_none());
    }

    #[test]
    fn inactive_watcher_cannot_start_without_a_path() {
        let mut watcher = Watcher::inactive(Recorder::default());
        assert!(!watcher.start());
        assert!(!watcher.is_running());
    }

    #[test]
    fn start_path_to_a_missing_path_stays_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = Watcher::inactive(Recorder::default());
        assert!(!watcher.start_path(dir.path().join("nope")));
        assert!(!watcher.is_running());
        assert!(watcher.watched_path().is_none());
    }

    #[test]
    fn support_matches_the_compiled_backend() {
        assert_eq!(
            Watcher::<Recorder>::supported_by_system(),
            cfg!(any(
                target_os = "linux",
                target_os = "android",
                target_os = "windows",
                target_os = "macos"
            ))
        );
    }
}
