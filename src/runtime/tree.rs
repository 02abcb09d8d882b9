use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};
use serde_json::{Map, Value};

use super::context::{self, Dependency};
use crate::error::{Result, StoreError};

/// Synchronous deep observer of every write to a [`StateTree`].
///
/// Receives the written path. Returning an error does not undo the write;
/// the error is handed back to whoever performed it.
pub type SyncHook = dyn Fn(&[String]) -> Result<()> + Send + Sync;

// Version stamps per path. `assigned` is the last epoch a write landed
// exactly here, `subtree` the last epoch a write landed here or below.
#[derive(Default)]
struct Stamp {
    assigned: u64,
    subtree: u64,
    children: HashMap<String, Stamp>,
}

struct TreeInner {
    value: RwLock<Value>,
    stamps: Mutex<Stamp>,
    epoch: AtomicU64,
    next_hook: AtomicUsize,
    hooks: Mutex<Vec<(usize, Arc<SyncHook>)>>,
    // consulted before a whole-tree replace; an error vetoes the write
    replace_guards: Mutex<Vec<(usize, Arc<SyncHook>)>>,
}

/// Observable, shape-varying state tree.
///
/// All reads made through [`get`](StateTree::get) or
/// [`with`](StateTree::with) while an observer is active are recorded as
/// dependencies, stamped with the current epoch. Every write bumps the
/// epoch and stamps the written path, so a dependency can later be checked
/// for staleness without diffing values.
#[derive(Clone)]
pub struct StateTree {
    inner: Arc<TreeInner>,
}

impl StateTree {
    /// Create a tree holding `initial`.
    pub fn new(initial: Value) -> Self {
        Self {
            inner: Arc::new(TreeInner {
                value: RwLock::new(initial),
                stamps: Mutex::new(Stamp::default()),
                epoch: AtomicU64::new(0),
                next_hook: AtomicUsize::new(0),
                hooks: Mutex::new(Vec::new()),
                replace_guards: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Epoch of the most recent write.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    /// Get a clone of the value at `path` (or `Null` if absent), tracking the read.
    pub fn get(&self, path: &[String]) -> Value {
        self.with(path, |value| value.cloned().unwrap_or(Value::Null))
    }

    /// Read the value at `path` without cloning, tracking the read.
    pub fn with<R>(&self, path: &[String], f: impl FnOnce(Option<&Value>) -> R) -> R {
        context::record(Dependency {
            path: path.to_vec(),
            stamp: self.epoch(),
        });
        let value = self.inner.value.read();
        f(resolve(&value, path))
    }

    /// Get a clone of the value at `path` without tracking the read.
    pub fn peek(&self, path: &[String]) -> Value {
        let value = self.inner.value.read();
        resolve(&value, path).cloned().unwrap_or(Value::Null)
    }

    /// Returns true if a value exists at `path`.
    pub fn contains(&self, path: &[String]) -> bool {
        resolve(&self.inner.value.read(), path).is_some()
    }

    /// Replace the value at `path`. An empty path replaces the whole tree.
    pub fn set(&self, path: &[String], value: Value) -> Result<()> {
        match path.split_last() {
            None => self.replace(value),
            Some((key, parent)) => self.set_property(parent, key, value).map(|_| ()),
        }
    }

    /// Replace the whole tree.
    ///
    /// Replace guards run first; if one rejects, the tree is left as it was.
    pub fn replace(&self, value: Value) -> Result<()> {
        let guards = snapshot(&self.inner.replace_guards);
        for guard in guards {
            guard(&[])?;
        }
        *self.inner.value.write() = value;
        self.written(&[])
    }

    /// Add or overwrite property `key` on the object at `parent`.
    ///
    /// A `Null` parent is turned into an empty object first. Returns true if
    /// an existing property was overwritten.
    pub fn set_property(&self, parent: &[String], key: &str, value: Value) -> Result<bool> {
        let existed = {
            let mut root = self.inner.value.write();
            let target = resolve_mut(&mut root, parent)
                .ok_or_else(|| StoreError::InvalidState(parent.to_vec()))?;
            if target.is_null() {
                *target = Value::Object(Map::new());
            }
            let object = target
                .as_object_mut()
                .ok_or_else(|| StoreError::InvalidState(parent.to_vec()))?;
            object.insert(key.to_string(), value).is_some()
        };
        let mut path = parent.to_vec();
        path.push(key.to_string());
        self.written(&path)?;
        Ok(existed)
    }

    /// Remove property `key` from the object at `parent`, returning it.
    pub fn remove_property(&self, parent: &[String], key: &str) -> Result<Option<Value>> {
        let removed = {
            let mut root = self.inner.value.write();
            resolve_mut(&mut root, parent)
                .and_then(Value::as_object_mut)
                .and_then(|object| object.remove(key))
        };
        let mut path = parent.to_vec();
        path.push(key.to_string());
        self.written(&path)?;
        Ok(removed)
    }

    /// Mutate the value at `path` in place.
    ///
    /// The path is stamped as written even if `f` panics part way through.
    pub fn update<F>(&self, path: &[String], f: F) -> Result<()>
    where
        F: FnOnce(&mut Value),
    {
        let outcome = {
            let mut root = self.inner.value.write();
            let target =
                resolve_mut(&mut root, path).ok_or_else(|| StoreError::InvalidState(path.to_vec()))?;
            panic::catch_unwind(AssertUnwindSafe(|| f(target)))
        };
        let written = self.written(path);
        match outcome {
            Ok(()) => written,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Mark `path` as written without changing it, invalidating every
    /// dependency on it.
    pub fn touch(&self, path: &[String]) -> Result<()> {
        self.written(path)
    }

    /// Returns true if a write after `stamp` landed on `path`, one of its
    /// ancestors, or one of its descendants.
    pub fn changed_since(&self, path: &[String], stamp: u64) -> bool {
        let stamps = self.inner.stamps.lock();
        let mut node = &*stamps;
        if node.assigned > stamp {
            return true;
        }
        for segment in path {
            match node.children.get(segment) {
                Some(child) => {
                    if child.assigned > stamp {
                        return true;
                    }
                    node = child;
                }
                None => return false,
            }
        }
        node.subtree > stamp
    }

    /// Returns true if none of `deps` has changed since it was read.
    pub fn is_fresh(&self, deps: &[Dependency]) -> bool {
        deps.iter().all(|dep| !self.changed_since(&dep.path, dep.stamp))
    }

    /// Install a synchronous deep observer. It stays active until the
    /// returned guard is dropped.
    pub fn watch_sync<F>(&self, hook: F) -> WatchGuard
    where
        F: Fn(&[String]) -> Result<()> + Send + Sync + 'static,
    {
        self.add_hook(Arc::new(hook), |tree| &tree.hooks)
    }

    /// Install a check run before every whole-tree [`replace`](StateTree::replace).
    /// Returning an error rejects the replace. Active until the guard is dropped.
    pub fn guard_replace<F>(&self, check: F) -> WatchGuard
    where
        F: Fn(&[String]) -> Result<()> + Send + Sync + 'static,
    {
        self.add_hook(Arc::new(check), |tree| &tree.replace_guards)
    }

    fn add_hook(
        &self,
        hook: Arc<SyncHook>,
        list: fn(&TreeInner) -> &Mutex<Vec<(usize, Arc<SyncHook>)>>,
    ) -> WatchGuard {
        let id = self.inner.next_hook.fetch_add(1, Ordering::SeqCst);
        list(&self.inner).lock().push((id, hook));

        let tree: Weak<TreeInner> = Arc::downgrade(&self.inner);
        WatchGuard::new(move || {
            if let Some(tree) = tree.upgrade() {
                list(&tree).lock().retain(|(hook_id, _)| *hook_id != id);
            }
        })
    }

    fn written(&self, path: &[String]) -> Result<()> {
        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut stamps = self.inner.stamps.lock();
            let mut node = &mut *stamps;
            node.subtree = epoch;
            for segment in path {
                node = node.children.entry(segment.clone()).or_default();
                node.subtree = epoch;
            }
            node.assigned = epoch;
            node.children.clear();
        }

        let hooks = snapshot(&self.inner.hooks);
        for hook in hooks {
            hook(path)?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for StateTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateTree")
            .field("epoch", &self.epoch())
            .field("value", &*self.inner.value.read())
            .finish()
    }
}

fn snapshot(list: &Mutex<Vec<(usize, Arc<SyncHook>)>>) -> Vec<Arc<SyncHook>> {
    list.lock().iter().map(|(_, hook)| Arc::clone(hook)).collect()
}

/// Resolve `path` against `root`, walking object keys.
pub fn resolve<'a>(root: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter().try_fold(root, |value, key| value.get(key.as_str()))
}

fn resolve_mut<'a>(root: &'a mut Value, path: &[String]) -> Option<&'a mut Value> {
    path.iter()
        .try_fold(root, |value, key| value.get_mut(key.as_str()))
}

/// RAII guard for watchers.
///
/// Dropping the guard removes the watcher it was returned for.
#[must_use = "the watcher is removed as soon as the guard is dropped"]
pub struct WatchGuard {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl WatchGuard {
    pub(crate) fn new<F>(remove: F) -> Self
    where
        F: FnOnce() + Send + Sync + 'static,
    {
        Self {
            remove: Some(Box::new(remove)),
        }
    }

    /// Remove the watcher now.
    pub fn unwatch(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::track;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn get_and_set_nested() {
        let tree = StateTree::new(json!({ "cart": { "items": [] } }));
        tree.set(&path(&["cart", "total"]), json!(12)).unwrap();
        assert_eq!(tree.get(&path(&["cart", "total"])), json!(12));
        assert_eq!(tree.get(&path(&["missing"])), Value::Null);
    }

    #[test]
    fn set_property_reports_overwrite() {
        let tree = StateTree::new(json!({ "a": 1 }));
        assert!(tree.set_property(&[], "a", json!(2)).unwrap());
        assert!(!tree.set_property(&[], "b", json!(3)).unwrap());
    }

    #[test]
    fn set_property_on_scalar_fails() {
        let tree = StateTree::new(json!({ "a": 1 }));
        let err = tree.set_property(&path(&["a"]), "b", json!(2)).unwrap_err();
        assert_eq!(err, StoreError::InvalidState(path(&["a"])));
    }

    #[test]
    fn sibling_writes_keep_dependency_fresh() {
        let tree = StateTree::new(json!({ "a": { "n": 1 }, "b": { "n": 1 } }));
        let (_, deps) = track(|| tree.get(&path(&["a"])));

        tree.update(&path(&["b"]), |b| b["n"] = json!(2)).unwrap();
        assert!(tree.is_fresh(&deps));

        tree.update(&path(&["a", "n"]), |n| *n = json!(5)).unwrap();
        assert!(!tree.is_fresh(&deps));
    }

    #[test]
    fn ancestor_write_invalidates_descendant_read() {
        let tree = StateTree::new(json!({ "a": { "n": 1 } }));
        let (_, deps) = track(|| tree.get(&path(&["a", "n"])));
        tree.replace(json!({ "a": { "n": 1 } })).unwrap();
        assert!(!tree.is_fresh(&deps));
    }

    #[test]
    fn removed_property_invalidates_reads() {
        let tree = StateTree::new(json!({ "a": { "n": 1 } }));
        let (_, deps) = track(|| tree.get(&path(&["a", "n"])));
        let removed = tree.remove_property(&[], "a").unwrap();
        assert_eq!(removed, Some(json!({ "n": 1 })));
        assert!(!tree.is_fresh(&deps));
        assert!(!tree.contains(&path(&["a"])));
    }

    #[test]
    fn sync_hook_sees_writes_until_dropped() {
        let tree = StateTree::new(json!({}));
        let hits = Arc::new(AtomicUsize::new(0));
        let hits_clone = hits.clone();
        let guard = tree.watch_sync(move |_| {
            hits_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        tree.set(&path(&["x"]), json!(1)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        drop(guard);
        tree.set(&path(&["x"]), json!(2)).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hook_error_reaches_writer() {
        let tree = StateTree::new(json!({}));
        let _guard = tree.watch_sync(|written| Err(StoreError::IllegalMutation(written.to_vec())));
        let err = tree.set(&path(&["x"]), json!(1)).unwrap_err();
        assert_eq!(err, StoreError::IllegalMutation(path(&["x"])));
        // The write itself is not rolled back.
        assert_eq!(tree.peek(&path(&["x"])), json!(1));
    }

    #[test]
    fn replace_guard_vetoes_before_writing() {
        let tree = StateTree::new(json!({ "a": 1 }));
        let guard = tree.guard_replace(|_| Err(StoreError::DirectStateReplace));
        assert_eq!(
            tree.replace(json!({ "a": 2 })).unwrap_err(),
            StoreError::DirectStateReplace
        );
        assert_eq!(tree.peek(&[]), json!({ "a": 1 }));

        // Writes below the root are not guarded.
        tree.set(&path(&["a"]), json!(3)).unwrap();

        drop(guard);
        tree.replace(json!({ "a": 4 })).unwrap();
        assert_eq!(tree.peek(&[]), json!({ "a": 4 }));
    }

    #[test]
    fn panicking_update_still_stamps_the_path() {
        let tree = StateTree::new(json!({ "n": 1 }));
        let (_, deps) = track(|| tree.get(&path(&["n"])));

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            tree.update(&path(&["n"]), |n| {
                *n = json!(2);
                panic!("handler failure");
            })
        }));
        assert!(result.is_err());
        assert_eq!(tree.peek(&path(&["n"])), json!(2));
        assert!(!tree.is_fresh(&deps));
    }
}
