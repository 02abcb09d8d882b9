use parking_lot::Mutex;
use serde_json::Value;

use super::context::Getters;
use super::store::Store;
use crate::runtime::{track, Dependency};

type Selector = dyn Fn(&Value, &Getters) -> Value + Send + Sync;
type Callback = dyn Fn(&Value, &Value) + Send + Sync;

/// Options for [`Store::watch_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WatchOptions {
    /// Call the callback once right away, with `null` as the old value.
    pub immediate: bool,
}

struct Observed {
    value: Value,
    deps: Vec<Dependency>,
}

/// A selector over the store plus the callback to run when its result
/// changes.
pub(crate) struct Watcher {
    selector: Box<Selector>,
    callback: Box<Callback>,
    last: Mutex<Option<Observed>>,
}

impl Watcher {
    pub(crate) fn new<S, F>(selector: S, callback: F) -> Self
    where
        S: Fn(&Value, &Getters) -> Value + Send + Sync + 'static,
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        Self {
            selector: Box::new(selector),
            callback: Box::new(callback),
            last: Mutex::new(None),
        }
    }

    fn evaluate(&self, store: &Store) -> Observed {
        let (value, deps) = track(|| (self.selector)(&store.state(), &store.getters()));
        Observed { value, deps }
    }

    /// Evaluate the selector and remember the result as the baseline.
    pub(crate) fn prime(&self, store: &Store) -> Value {
        let observed = self.evaluate(store);
        let value = observed.value.clone();
        *self.last.lock() = Some(observed);
        value
    }

    pub(crate) fn fire(&self, new: &Value, old: &Value) {
        (self.callback)(new, old);
    }

    /// Re-evaluate if anything the selector read has changed, and run the
    /// callback if the result differs. Returns true if the callback ran.
    pub(crate) fn check(&self, store: &Store) -> bool {
        let stale = match self.last.lock().as_ref() {
            Some(last) => !store.inner.tree.is_fresh(&last.deps),
            None => true,
        };
        if !stale {
            return false;
        }

        let observed = self.evaluate(store);
        let new = observed.value.clone();
        let old = self.last.lock().replace(observed).map(|last| last.value);

        match old {
            Some(old) if old != new => {
                self.fire(&new, &old);
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn check_fires_only_on_change() {
        let store = Store::new(
            Module::new()
                .state(json!({ "a": 1, "b": 1 }))
                .mutation("bump_b", |state, _| state["b"] = json!(2)),
        )
        .unwrap();

        let fired = Arc::new(Mutex::new(Vec::new()));
        let fired_clone = fired.clone();
        let watcher = Watcher::new(
            |state, _| state["a"].clone(),
            move |new, old| fired_clone.lock().push((new.clone(), old.clone())),
        );
        assert_eq!(watcher.prime(&store), json!(1));

        // Nothing written since priming.
        assert!(!watcher.check(&store));

        // Written, but the selected value is the same.
        store.commit("bump_b", Value::Null);
        assert!(!watcher.check(&store));
        assert!(fired.lock().is_empty());

        store.state_tree().set(&["a".to_string()], json!(3)).unwrap();
        assert!(watcher.check(&store));
        assert_eq!(*fired.lock(), vec![(json!(3), json!(1))]);
    }
}
