use std::path::Path;

use crate::{ChangeHandler, WatchError, Watcher};

pub type BoxedCallback = Box<dyn Fn(&Path) + Send + Sync>;

/// Forwards all nine kinds of change to one function of the affected path.
pub struct Callback<F> {
    callback: F,
}

impl<F> Callback<F>
where
    F: Fn(&Path) + Send + Sync + 'static,
{
    pub fn new(callback: F) -> Self {
        Callback { callback }
    }
}

impl Callback<BoxedCallback> {
    /// Panics on `None`: a watcher without a callback is a programming error.
    pub fn from_boxed(callback: Option<BoxedCallback>) -> Self {
        match callback {
            Some(callback) => Callback { callback },
            None => panic!("SimpleWatcher requires a callback"),
        }
    }
}

impl<F> ChangeHandler for Callback<F>
where
    F: Fn(&Path) + Send + Sync + 'static,
{
    fn on_accessed(&self, path: &Path) {
        (self.callback)(path)
    }

    fn on_metadata_changed(&self, path: &Path) {
        (self.callback)(path)
    }

    fn on_handle_closed(&self, path: &Path) {
        (self.callback)(path)
    }

    fn on_created(&self, path: &Path) {
        (self.callback)(path)
    }

    fn on_deleted(&self, path: &Path) {
        (self.callback)(path)
    }

    fn on_modified(&self, path: &Path) {
        (self.callback)(path)
    }

    fn on_moved(&self, path: &Path) {
        (self.callback)(path)
    }

    fn on_opened(&self, path: &Path) {
        (self.callback)(path)
    }

    fn on_other(&self, path: &Path) {
        (self.callback)(path)
    }
}

pub type SimpleWatcher = Watcher<Callback<BoxedCallback>>;

/// Watches `path` on the shared registry, calling `callback` for every change.
pub fn simple_watcher<F>(
    path: impl AsRef<Path>,
    callback: F,
) -> Result<Watcher<Callback<F>>, WatchError>
where
    F: Fn(&Path) + Send + Sync + 'static,
{
    Watcher::new(path, Callback::new(callback))
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
    };

    use super::*;
    use crate::{ChangeEvent, ChangeKind};

    #[test]
    fn every_kind_reaches_the_callback() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = Callback::new(move |path: &Path| {
            assert_eq!(path, Path::new("/watched/file"));
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for kind in ChangeKind::ALL {
            handler.handle(&ChangeEvent::new(kind, PathBuf::from("/watched/file")));
        }
        assert_eq!(calls.load(Ordering::SeqCst), ChangeKind::ALL.len());
    }

    #[test]
    fn boxed_callbacks_are_accepted() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let handler = Callback::from_boxed(Some(Box::new(move |_: &Path| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        handler.on_other(Path::new("/x"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "requires a callback")]
    fn missing_callback_panics() {
        let _ = Callback::from_boxed(None);
    }
}
