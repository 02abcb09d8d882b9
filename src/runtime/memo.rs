use std::sync::Arc;

use parking_lot::Mutex;

use super::context::{self, Dependency};
use super::tree::StateTree;

struct Cached<T> {
    value: T,
    deps: Vec<Dependency>,
}

/// A lazily evaluated, memoized computed value.
///
/// The computation runs on first read and records the state paths it reads.
/// Later reads return the cached value until one of those paths changes.
/// Reading a memo from inside another observer forwards the memo's
/// dependencies, so memos built on memos invalidate transitively.
pub struct Memo<T> {
    compute: Arc<dyn Fn() -> T + Send + Sync>,
    tree: StateTree,
    cached: Mutex<Option<Cached<T>>>,
}

impl<T: Clone> Memo<T> {
    /// Create a new memo over `tree` with the given computation function.
    pub fn new<F>(tree: StateTree, compute: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self {
            compute: Arc::new(compute),
            tree,
            cached: Mutex::new(None),
        }
    }

    /// Get the current value, recomputing if necessary.
    pub fn get(&self) -> T {
        {
            let cached = self.cached.lock();
            if let Some(cached) = cached.as_ref() {
                if self.tree.is_fresh(&cached.deps) {
                    context::record_all(&cached.deps);
                    return cached.value.clone();
                }
            }
        }

        // The lock is not held while computing; the computation may read
        // other memos.
        let (value, deps) = context::track(|| (self.compute)());
        *self.cached.lock() = Some(Cached {
            value: value.clone(),
            deps,
        });
        value
    }

    /// Returns true if the next read will recompute.
    pub fn is_dirty(&self) -> bool {
        match self.cached.lock().as_ref() {
            Some(cached) => !self.tree.is_fresh(&cached.deps),
            None => true,
        }
    }

    /// Drop the cached value.
    pub fn invalidate(&self) {
        *self.cached.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(k: &str) -> Vec<String> {
        vec![k.to_string()]
    }

    #[test]
    fn memo_basic() {
        let tree = StateTree::new(json!({ "count": 5 }));
        let doubled = Memo::new(tree.clone(), {
            let tree = tree.clone();
            move || tree.get(&key("count")).as_i64().unwrap_or(0) * 2
        });

        assert_eq!(doubled.get(), 10);

        tree.set(&key("count"), json!(10)).unwrap();
        assert_eq!(doubled.get(), 20);
    }

    #[test]
    fn memo_computes_once_per_change() {
        let tree = StateTree::new(json!({ "count": 1, "other": 0 }));
        let runs = Arc::new(AtomicUsize::new(0));
        let memo = Memo::new(tree.clone(), {
            let tree = tree.clone();
            let runs = runs.clone();
            move || {
                runs.fetch_add(1, Ordering::SeqCst);
                tree.get(&key("count"))
            }
        });

        memo.get();
        memo.get();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tree.set(&key("other"), json!(1)).unwrap();
        memo.get();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tree.set(&key("count"), json!(2)).unwrap();
        assert!(memo.is_dirty());
        assert_eq!(memo.get(), json!(2));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn complex_reactive_chain() {
        let tree = StateTree::new(json!({ "input": 1 }));
        let doubled = Arc::new(Memo::new(tree.clone(), {
            let tree = tree.clone();
            move || tree.get(&key("input")).as_i64().unwrap_or(0) * 2
        }));
        let quadrupled = Memo::new(tree.clone(), {
            let doubled = doubled.clone();
            move || doubled.get() * 2
        });

        assert_eq!(quadrupled.get(), 4);

        // Warm the inner memo so the outer one relies on forwarded deps.
        tree.set(&key("input"), json!(5)).unwrap();
        assert_eq!(doubled.get(), 10);
        assert_eq!(quadrupled.get(), 20);
    }

    #[test]
    fn invalidate_forces_recompute() {
        let tree = StateTree::new(Value::Null);
        let memo = Memo::new(tree.clone(), || 1);
        memo.get();
        assert!(!memo.is_dirty());
        memo.invalidate();
        assert!(memo.is_dirty());
    }
}
