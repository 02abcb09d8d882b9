use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

type Task = Box<dyn FnOnce() + Send>;

/// A state path read by an observer, stamped with the tree epoch it was
/// read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub path: Vec<String>,
    pub stamp: u64,
}

// Thread-local stack of observers currently collecting reads.
thread_local! {
    static OBSERVER_STACK: RefCell<Vec<Vec<Dependency>>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` as an observer, returning its result and every state read it made.
///
/// Reads are also forwarded to the enclosing observer, so a memo computed
/// inside another memo makes the outer one depend on the same paths.
pub fn track<F, R>(f: F) -> (R, Vec<Dependency>)
where
    F: FnOnce() -> R,
{
    OBSERVER_STACK.with(|stack| stack.borrow_mut().push(Vec::new()));

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));

    let deps = OBSERVER_STACK
        .with(|stack| stack.borrow_mut().pop())
        .unwrap_or_default();

    match result {
        Ok(r) => {
            record_all(&deps);
            (r, deps)
        }
        Err(e) => std::panic::resume_unwind(e),
    }
}

/// Record a read against the current observer, if any.
pub fn record(dep: Dependency) {
    OBSERVER_STACK.with(|stack| {
        if let Some(frame) = stack.borrow_mut().last_mut() {
            frame.push(dep);
        }
    });
}

/// Forward a set of previously collected reads to the current observer.
pub fn record_all(deps: &[Dependency]) {
    OBSERVER_STACK.with(|stack| {
        if let Some(frame) = stack.borrow_mut().last_mut() {
            frame.extend(deps.iter().cloned());
        }
    });
}

/// Run `f` without collecting its reads into the current observer.
pub fn untracked<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    OBSERVER_STACK.with(|stack| stack.borrow_mut().push(Vec::new()));
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f));
    OBSERVER_STACK.with(|stack| stack.borrow_mut().pop());
    match result {
        Ok(r) => r,
        Err(e) => std::panic::resume_unwind(e),
    }
}

/// Handle to the reactive runtime a store is built on.
///
/// The runtime must be installed exactly once before any store is created
/// against it. Installation is idempotent: a second [`install`] call reports
/// the mistake and leaves the runtime untouched.
///
/// The runtime also owns the "next tick" queue used to defer teardown of
/// replaced reactive roots until the current notification cycle is over.
///
/// # Examples
///
/// ```
/// use larder::runtime::ReactiveRuntime;
///
/// let runtime = ReactiveRuntime::new();
/// assert!(runtime.install());
/// assert!(!runtime.install());
/// assert!(runtime.is_installed());
/// ```
///
/// [`install`]: ReactiveRuntime::install
pub struct ReactiveRuntime {
    installed: AtomicBool,
    flushing: AtomicBool,
    next_id: AtomicUsize,
    ticks: Mutex<Vec<Task>>,
}

impl ReactiveRuntime {
    /// Create a new, not yet installed runtime.
    pub fn new() -> Arc<Self> {
        Arc::new(ReactiveRuntime {
            installed: AtomicBool::new(false),
            flushing: AtomicBool::new(false),
            next_id: AtomicUsize::new(0),
            ticks: Mutex::new(Vec::new()),
        })
    }

    /// Create and install a runtime in one step.
    pub fn installed() -> Arc<Self> {
        let runtime = Self::new();
        runtime.install();
        runtime
    }

    /// Get or create the global runtime.
    ///
    /// The global runtime installs itself on first use; stores built without
    /// an explicit runtime fall back to it.
    pub fn global() -> Arc<Self> {
        static RUNTIME: OnceLock<Arc<ReactiveRuntime>> = OnceLock::new();
        Arc::clone(RUNTIME.get_or_init(Self::installed))
    }

    /// Mark this runtime as installed.
    ///
    /// Returns `false` (and logs an error) if it already was.
    pub fn install(&self) -> bool {
        if self.installed.swap(true, Ordering::SeqCst) {
            tracing::error!("reactive runtime already installed; install should be called only once");
            return false;
        }
        tracing::debug!("reactive runtime installed");
        true
    }

    pub fn is_installed(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Generate the next unique ID for a reactive root or watcher.
    pub fn next_id(&self) -> usize {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Queue `task` to run on the next [`flush`](ReactiveRuntime::flush).
    pub fn next_tick<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.ticks.lock().push(Box::new(task));
    }

    /// Number of tasks waiting for the next tick.
    pub fn pending_ticks(&self) -> usize {
        self.ticks.lock().len()
    }

    /// Drain the next-tick queue.
    ///
    /// Tasks queued while flushing run in the same pass. A nested call made
    /// from inside a task is a no-op; the outer pass picks up its work.
    pub fn flush(&self) {
        if self.flushing.swap(true, Ordering::SeqCst) {
            return;
        }
        loop {
            let tasks = std::mem::take(&mut *self.ticks.lock());
            if tasks.is_empty() {
                break;
            }
            for task in tasks {
                task();
            }
        }
        self.flushing.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn track_collects_reads() {
        let (value, deps) = track(|| {
            record(Dependency { path: vec!["a".into()], stamp: 1 });
            record(Dependency { path: vec!["b".into()], stamp: 2 });
            7
        });
        assert_eq!(value, 7);
        assert_eq!(deps.len(), 2);
        assert_eq!(deps[1].path, vec!["b".to_string()]);
    }

    #[test]
    fn nested_reads_reach_outer_observer() {
        let (_, outer) = track(|| {
            let (_, inner) = track(|| record(Dependency { path: vec![], stamp: 0 }));
            assert_eq!(inner.len(), 1);
        });
        assert_eq!(outer.len(), 1);
    }

    #[test]
    fn untracked_reads_are_dropped() {
        let (_, deps) = track(|| {
            untracked(|| record(Dependency { path: vec![], stamp: 0 }));
        });
        assert!(deps.is_empty());
    }

    #[test]
    fn next_tick_runs_on_flush() {
        let runtime = ReactiveRuntime::installed();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        runtime.next_tick(move || {
            hits_clone.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(runtime.pending_ticks(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        runtime.flush();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(runtime.pending_ticks(), 0);
    }
}
