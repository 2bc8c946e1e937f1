use std::{
    cell::Cell,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{platforms::NativeBackend, ChangeHandler, WatchError, WatchOptions};

static SHARED: OnceCell<Arc<WatchRegistry>> = OnceCell::new();

thread_local! {
    // Address of the registry whose drain cycle is running on this thread.
    static DRAINING: Cell<usize> = const { Cell::new(0) };
}

/// Multiplexes every registered backend onto one dispatcher thread.
///
/// The thread exists exactly while at least one backend is registered: the
/// first [`add`](WatchRegistry::add) spawns it and the removal that empties
/// the set stops it. Each cycle drains every backend while holding the state
/// lock, then sleeps for the configured poll interval.
pub struct WatchRegistry {
    state: Mutex<RegistryState>,
    deferred: Mutex<Vec<Deferred>>,
    options: WatchOptions,
    next_id: AtomicU64,
    registrations: AtomicU64,
    generations: AtomicU64,
    // Mirrors of `state`, readable from inside a drain cycle.
    slot_count: AtomicUsize,
    dispatching: AtomicBool,
}

#[derive(Default)]
struct RegistryState {
    slots: Vec<Slot>,
    dispatcher: Option<Dispatcher>,
}

struct Slot {
    id: u64,
    backend: Box<dyn NativeBackend>,
    handler: Arc<dyn ChangeHandler>,
    retired: Arc<AtomicBool>,
}

struct Dispatcher {
    generation: u64,
    token: CancellationToken,
    thread: JoinHandle<()>,
}

// Requested from inside a handler, applied once the current cycle ends.
enum Deferred {
    Add(Slot),
    Remove(u64),
}

/// Keeps a backend registered. Dropping it (or calling
/// [`cancel`](Registration::cancel)) removes the backend and closes it.
pub struct Registration {
    id: u64,
    retired: Arc<AtomicBool>,
    registry: Arc<WatchRegistry>,
}

impl Registration {
    pub fn cancel(self) {
        drop(self);
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.retired.store(true, Ordering::SeqCst);
        self.registry.remove(self.id);
    }
}

impl Slot {
    fn drain(&mut self) {
        let handler = &self.handler;
        let retired = &self.retired;
        let id = self.id;

        self.backend.drain(&mut |event| {
            if retired.load(Ordering::SeqCst) {
                return;
            }
            let delivered = panic::catch_unwind(AssertUnwindSafe(|| handler.handle(&event)));
            if delivered.is_err() {
                error!(
                    "change handler for backend {id} panicked on {} {:?}",
                    event.kind, event.path
                );
            }
        });
    }
}

impl WatchRegistry {
    /// The process-wide registry, created with default options on first use.
    pub fn shared() -> Arc<WatchRegistry> {
        SHARED
            .get_or_init(|| WatchRegistry::new(WatchOptions::default()))
            .clone()
    }

    pub fn new(options: WatchOptions) -> Arc<WatchRegistry> {
        Arc::new(WatchRegistry {
            state: Mutex::new(RegistryState::default()),
            deferred: Mutex::new(Vec::new()),
            options,
            next_id: AtomicU64::new(1),
            registrations: AtomicU64::new(0),
            generations: AtomicU64::new(0),
            slot_count: AtomicUsize::new(0),
            dispatching: AtomicBool::new(false),
        })
    }

    pub fn poll_interval(&self) -> Duration {
        self.options.poll_interval
    }

    /// Number of registered backends.
    pub fn len(&self) -> usize {
        self.slot_count.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the dispatcher thread currently exists.
    pub fn is_dispatching(&self) -> bool {
        self.dispatching.load(Ordering::SeqCst)
    }

    /// Total number of successful registrations over the registry's lifetime.
    pub fn registrations(&self) -> u64 {
        self.registrations.load(Ordering::SeqCst)
    }

    pub(crate) fn add(
        self: &Arc<Self>,
        backend: Box<dyn NativeBackend>,
        handler: Arc<dyn ChangeHandler>,
    ) -> Result<Registration, WatchError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let retired = Arc::new(AtomicBool::new(false));
        let slot = Slot {
            id,
            backend,
            handler,
            retired: retired.clone(),
        };

        if self.is_draining_here() {
            self.deferred.lock().push(Deferred::Add(slot));
        } else {
            let mut state = self.state.lock();
            state.slots.push(slot);

            if state.dispatcher.is_none() {
                match self.spawn_dispatcher() {
                    Ok(dispatcher) => state.dispatcher = Some(dispatcher),
                    Err(e) => {
                        let slot = state.slots.pop();
                        self.publish(&state);
                        drop(state);
                        drop(slot);
                        return Err(e);
                    }
                }
            }
            self.publish(&state);
        }

        self.registrations.fetch_add(1, Ordering::SeqCst);
        debug!("registered backend {id}");

        Ok(Registration {
            id,
            retired,
            registry: self.clone(),
        })
    }

    fn remove(&self, id: u64) {
        if self.is_draining_here() {
            self.deferred.lock().push(Deferred::Remove(id));
            return;
        }

        let (slot, stopped) = {
            let mut state = self.state.lock();
            let idx = state.slots.iter().position(|s| s.id == id);
            let slot = idx.map(|idx| state.slots.remove(idx));
            let stopped = if state.slots.is_empty() {
                state.dispatcher.take()
            } else {
                None
            };
            self.publish(&state);
            (slot, stopped)
        };

        // Closing happens outside the lock, after any drain of this slot.
        drop(slot);
        debug!("unregistered backend {id}");

        if let Some(dispatcher) = stopped {
            dispatcher.token.cancel();
            if dispatcher.thread.thread().id() == thread::current().id() {
                // Reached while releasing slots on the dispatcher itself.
                return;
            }
            if dispatcher.thread.join().is_err() {
                warn!("watch dispatcher thread panicked");
            }
            debug!("watch dispatcher {} joined", dispatcher.generation);
        }
    }

    fn publish(&self, state: &RegistryState) {
        self.slot_count.store(state.slots.len(), Ordering::SeqCst);
        self.dispatching
            .store(state.dispatcher.is_some(), Ordering::SeqCst);
    }

    fn is_draining_here(&self) -> bool {
        DRAINING.with(|d| d.get() == self as *const _ as usize)
    }

    fn spawn_dispatcher(self: &Arc<Self>) -> Result<Dispatcher, WatchError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| WatchError::DispatcherError(e.to_string()))?;

        let generation = self.generations.fetch_add(1, Ordering::SeqCst);
        let token = CancellationToken::new();
        let registry = Arc::downgrade(self);
        let interval = self.options.poll_interval;
        let cancel = token.clone();

        let thread = thread::Builder::new()
            .name("mimamori-dispatch".to_owned())
            .spawn(move || runtime.block_on(dispatch(registry, generation, cancel, interval)))
            .map_err(|e| WatchError::DispatcherError(e.to_string()))?;

        debug!("watch dispatcher {generation} started");
        Ok(Dispatcher {
            generation,
            token,
            thread,
        })
    }

    /// Runs one drain cycle. Returns false once the dispatcher should exit.
    fn drain_cycle(&self, generation: u64, token: &CancellationToken) -> bool {
        let mut state = self.state.lock();
        if token.is_cancelled() {
            return false;
        }

        DRAINING.with(|d| d.set(self as *const _ as usize));
        for slot in state.slots.iter_mut() {
            if !slot.retired.load(Ordering::SeqCst) {
                slot.drain();
            }
        }
        DRAINING.with(|d| d.set(0));

        let released = self.apply_deferred(&mut state);

        let keep_running = if state.slots.is_empty() {
            // Emptied from inside a handler: this thread cannot join itself,
            // so it detaches and exits.
            if state
                .dispatcher
                .as_ref()
                .is_some_and(|d| d.generation == generation)
            {
                state.dispatcher = None;
                debug!("watch dispatcher {generation} detached");
            }
            false
        } else {
            true
        };

        self.publish(&state);
        drop(state);
        drop(released);
        keep_running
    }

    fn apply_deferred(&self, state: &mut RegistryState) -> Vec<Slot> {
        let mut released = Vec::new();
        for op in self.deferred.lock().drain(..) {
            match op {
                Deferred::Add(slot) => state.slots.push(slot),
                Deferred::Remove(id) => {
                    if let Some(idx) = state.slots.iter().position(|s| s.id == id) {
                        released.push(state.slots.remove(idx));
                        debug!("unregistered backend {id}");
                    }
                }
            }
        }
        released
    }
}

async fn dispatch(
    registry: Weak<WatchRegistry>,
    generation: u64,
    token: CancellationToken,
    interval: Duration,
) {
    loop {
        let Some(registry) = registry.upgrade() else {
            break;
        };

        if !registry.drain_cycle(generation, &token) {
            break;
        }
        drop(registry);

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        testing::{settle, wait_until, Recorder, FAST_POLL},
        ChangeEvent, ChangeKind,
    };

    /// Emits the same event every cycle and counts how often it was dropped.
    struct Ticking {
        path: PathBuf,
        drops: Arc<AtomicUsize>,
    }

    impl NativeBackend for Ticking {
        fn open(path: &std::path::Path, _options: &WatchOptions) -> Result<Self, WatchError> {
            Ok(Ticking {
                path: path.to_path_buf(),
                drops: Arc::new(AtomicUsize::new(0)),
            })
        }

        fn drain(&mut self, sink: &mut dyn FnMut(ChangeEvent)) {
            sink(ChangeEvent::new(ChangeKind::Modified, self.path.clone()));
        }
    }

    impl Drop for Ticking {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn ticking(path: &str) -> (Box<Ticking>, Arc<AtomicUsize>) {
        let backend = Ticking::open(std::path::Path::new(path), &WatchOptions::default()).unwrap();
        let drops = backend.drops.clone();
        (Box::new(backend), drops)
    }

    fn registry() -> Arc<WatchRegistry> {
        WatchRegistry::new(WatchOptions::default().with_poll_interval(FAST_POLL))
    }

    #[test]
    fn thread_follows_registrations() {
        let registry = registry();
        assert!(!registry.is_dispatching());

        let (backend, drops) = ticking("/a");
        let recorder = Arc::new(Recorder::default());
        let registration = registry.add(backend, recorder.clone()).unwrap();
        assert!(registry.is_dispatching());
        assert_eq!(registry.len(), 1);
        assert!(wait_until(|| !recorder.events().is_empty()));

        registration.cancel();
        assert!(!registry.is_dispatching());
        assert!(registry.is_empty());
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        recorder.clear();
        settle();
        assert!(recorder.events().is_empty());

        let (backend, _) = ticking("/b");
        let _registration = registry.add(backend, recorder.clone()).unwrap();
        assert!(registry.is_dispatching());
        assert!(wait_until(|| recorder.count(ChangeKind::Modified, "/b".as_ref()) > 0));
        assert_eq!(registry.registrations(), 2);
    }

    #[test]
    fn slots_do_not_cross_talk() {
        let registry = registry();
        let (first, second) = (Arc::new(Recorder::default()), Arc::new(Recorder::default()));
        let a = registry.add(ticking("/one").0, first.clone()).unwrap();
        let b = registry.add(ticking("/two").0, second.clone()).unwrap();
        assert_ne!(a.id(), b.id());

        assert!(wait_until(|| !first.events().is_empty() && !second.events().is_empty()));
        assert!(first.events().iter().all(|e| e.path == PathBuf::from("/one")));
        assert!(second.events().iter().all(|e| e.path == PathBuf::from("/two")));
    }

    struct Panicking;

    impl ChangeHandler for Panicking {
        fn handle(&self, _event: &ChangeEvent) {
            panic!("handler failure");
        }
    }

    #[test]
    fn handler_panics_do_not_stop_the_dispatcher() {
        let registry = registry();
        let recorder = Arc::new(Recorder::default());
        let _bad = registry.add(ticking("/bad").0, Arc::new(Panicking)).unwrap();
        let _good = registry.add(ticking("/good").0, recorder.clone()).unwrap();

        assert!(wait_until(|| recorder.events().len() >= 3));
        assert!(registry.is_dispatching());
    }

    /// Drops its own registration from inside the handler.
    struct SelfStopping {
        registration: Mutex<Option<Registration>>,
        calls: AtomicUsize,
    }

    impl ChangeHandler for SelfStopping {
        fn handle(&self, _event: &ChangeEvent) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.registration.lock().take();
        }
    }

    #[test]
    fn removal_from_a_handler_is_deferred() {
        let registry = registry();
        let handler = Arc::new(SelfStopping {
            registration: Mutex::new(None),
            calls: AtomicUsize::new(0),
        });

        let (backend, drops) = ticking("/self");
        let registration = registry.add(backend, handler.clone()).unwrap();
        *handler.registration.lock() = Some(registration);

        assert!(wait_until(|| drops.load(Ordering::SeqCst) == 1));
        assert!(wait_until(|| !registry.is_dispatching()));
        settle();
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_empty());

        // A fresh dispatcher can still be started afterwards.
        let recorder = Arc::new(Recorder::default());
        let _again = registry.add(ticking("/again").0, recorder.clone()).unwrap();
        assert!(wait_until(|| !recorder.events().is_empty()));
    }

    #[test]
    fn shared_registry_is_a_single_instance() {
        let a = WatchRegistry::shared();
        let b = WatchRegistry::shared();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.poll_interval(), Duration::from_millis(250));
    }
}
