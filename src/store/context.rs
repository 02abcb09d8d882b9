use std::sync::{Arc, Weak};

use futures::future::{self, FutureExt};
use indexmap::IndexMap;
use serde_json::{Map, Value};

use super::store::{Store, StoreInner};
use crate::error::Diagnostic;
use crate::module::ActionFuture;

/// Options for local `commit_with` / `dispatch_with`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommitOptions {
    /// Address the global type instead of prefixing the local namespace.
    pub root: bool,
}

/// Per-module facade over the store.
///
/// Types passed to `commit` and `dispatch` are prefixed with the module's
/// namespace, `getters` only exposes getters of that namespace (re-keyed
/// without the prefix), and `state` resolves the module's own slice of the
/// aggregate state on every read.
#[derive(Clone)]
pub struct LocalContext {
    store: Weak<StoreInner>,
    namespace: String,
    path: Vec<String>,
}

impl LocalContext {
    pub(crate) fn new(store: Weak<StoreInner>, namespace: String, path: Vec<String>) -> Self {
        Self {
            store,
            namespace,
            path,
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn path(&self) -> &[String] {
        &self.path
    }

    pub(crate) fn store_ref(&self) -> &Weak<StoreInner> {
        &self.store
    }

    fn store(&self) -> Option<Store> {
        let store = self.store.upgrade().map(|inner| Store { inner });
        if store.is_none() {
            tracing::warn!(namespace = %self.namespace, "local context used after its store was dropped");
        }
        store
    }

    pub fn commit(&self, kind: &str, payload: Value) {
        self.commit_with(kind, payload, CommitOptions::default());
    }

    pub fn commit_with(&self, kind: &str, payload: Value, options: CommitOptions) {
        let Some(store) = self.store() else {
            return;
        };
        if self.namespace.is_empty() || options.root {
            return store.commit(kind, payload);
        }

        let global = format!("{}{}", self.namespace, kind);
        if !store.inner.registry.read().mutations.contains_key(&global) {
            store.inner.report(Diagnostic::UnknownMutation { kind: global });
            return;
        }
        store.commit(&global, payload);
    }

    pub fn dispatch(&self, kind: &str, payload: Value) -> ActionFuture {
        self.dispatch_with(kind, payload, CommitOptions::default())
    }

    pub fn dispatch_with(&self, kind: &str, payload: Value, options: CommitOptions) -> ActionFuture {
        let Some(store) = self.store() else {
            return future::ready(Ok(Value::Null)).boxed();
        };
        if self.namespace.is_empty() || options.root {
            return store.dispatch(kind, payload);
        }

        let global = format!("{}{}", self.namespace, kind);
        if !store.inner.registry.read().actions.contains_key(&global) {
            store.inner.report(Diagnostic::UnknownAction { kind: global });
            return future::ready(Ok(Value::Null)).boxed();
        }
        store.dispatch(&global, payload)
    }

    /// The module's own state, read from the current state tree.
    pub fn state(&self) -> Value {
        match self.store.upgrade() {
            Some(inner) => inner.tree.get(&self.path),
            None => Value::Null,
        }
    }

    /// Getters of this module's namespace, keyed by their local name.
    pub fn getters(&self) -> Getters {
        let Some(store) = self.store() else {
            return Getters::empty();
        };
        if self.namespace.is_empty() {
            store.getters()
        } else {
            store.local_getters(&self.namespace)
        }
    }
}

/// Context handed to action handlers.
#[derive(Clone)]
pub struct ActionContext {
    local: LocalContext,
    store: Store,
}

impl ActionContext {
    pub(crate) fn new(local: LocalContext, store: Store) -> Self {
        Self { local, store }
    }

    pub fn commit(&self, kind: &str, payload: Value) {
        self.local.commit(kind, payload);
    }

    pub fn commit_with(&self, kind: &str, payload: Value, options: CommitOptions) {
        self.local.commit_with(kind, payload, options);
    }

    pub fn dispatch(&self, kind: &str, payload: Value) -> ActionFuture {
        self.local.dispatch(kind, payload)
    }

    pub fn dispatch_with(&self, kind: &str, payload: Value, options: CommitOptions) -> ActionFuture {
        self.local.dispatch_with(kind, payload, options)
    }

    pub fn state(&self) -> Value {
        self.local.state()
    }

    pub fn getters(&self) -> Getters {
        self.local.getters()
    }

    pub fn root_state(&self) -> Value {
        self.store.state()
    }

    pub fn root_getters(&self) -> Getters {
        self.store.getters()
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

/// Context handed to getter handlers. Every accessor is resolved on call
/// and tracked as a dependency of the getter.
pub struct GetterContext {
    local: LocalContext,
    store: Store,
}

impl GetterContext {
    pub(crate) fn new(local: LocalContext, store: Store) -> Self {
        Self { local, store }
    }

    pub fn state(&self) -> Value {
        self.local.state()
    }

    pub fn getters(&self) -> Getters {
        self.local.getters()
    }

    pub fn root_state(&self) -> Value {
        self.store.state()
    }

    pub fn root_getters(&self) -> Getters {
        self.store.getters()
    }
}

/// Read-only view over the store's getters.
///
/// Values are computed lazily and memoized; a getter recomputes only after
/// state it read has changed.
#[derive(Clone)]
pub struct Getters {
    store: Option<Store>,
    // local key -> global key; `None` means the unfiltered root view
    view: Option<Arc<IndexMap<String, String>>>,
}

impl Getters {
    pub(crate) fn root(store: Store) -> Self {
        Self {
            store: Some(store),
            view: None,
        }
    }

    pub(crate) fn local(store: Store, view: Arc<IndexMap<String, String>>) -> Self {
        Self {
            store: Some(store),
            view: Some(view),
        }
    }

    fn empty() -> Self {
        Self {
            store: None,
            view: None,
        }
    }

    /// Evaluate the getter named `key`, or `None` if there is no such getter.
    pub fn get(&self, key: &str) -> Option<Value> {
        let store = self.store.as_ref()?;
        match &self.view {
            None => store.getter(key),
            Some(view) => store.getter(view.get(key)?),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        match (&self.store, &self.view) {
            (None, _) => false,
            (Some(store), None) => store.getter_keys().iter().any(|k| k == key),
            (Some(_), Some(view)) => view.contains_key(key),
        }
    }

    pub fn keys(&self) -> Vec<String> {
        match (&self.store, &self.view) {
            (None, _) => Vec::new(),
            (Some(store), None) => store.getter_keys(),
            (Some(_), Some(view)) => view.keys().cloned().collect(),
        }
    }

    /// Evaluate every getter in the view into a JSON object.
    pub fn to_map(&self) -> Map<String, Value> {
        self.keys()
            .into_iter()
            .filter_map(|key| self.get(&key).map(|value| (key, value)))
            .collect()
    }
}

/// Build the namespace view over `keys`: every key starting with
/// `namespace`, re-keyed by the remaining suffix.
pub(crate) fn namespace_view(namespace: &str, keys: &[String]) -> IndexMap<String, String> {
    keys.iter()
        .filter_map(|key| {
            key.strip_prefix(namespace)
                .map(|local| (local.to_string(), key.clone()))
        })
        .collect()
}
