use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{self, join_all, FutureExt};
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;

use super::context::{namespace_view, Getters};
use super::install::{install_module, reset_store, reset_store_vm, Projection, Registry};
use super::subscribe::{
    Action, ActionSubscriber, Mutation, MutationSubscriber, SubscribeOptions, SubscriberList,
    Unsubscribe,
};
use super::watch::{WatchOptions, Watcher};
use crate::config::StoreOptions;
use crate::error::{ActionError, Diagnostic, Result, StoreError, SubscriberPhase};
use crate::module::{ActionFuture, Module, ModuleCollection};
use crate::plugin::DevtoolsHook;
use crate::runtime::{ReactiveRuntime, StateTree, WatchGuard};

const MAX_DIAGNOSTICS: usize = 256;
const MAX_WATCH_PASSES: usize = 100;

/// Shared state behind every [`Store`] handle.
pub(crate) struct StoreInner {
    pub(crate) runtime: Arc<ReactiveRuntime>,
    pub(crate) tree: StateTree,
    pub(crate) modules: RwLock<ModuleCollection>,
    pub(crate) registry: RwLock<Registry>,
    pub(crate) vm: RwLock<Option<Arc<Projection>>>,
    // number of open commit scopes, across all threads
    pub(crate) committing: Arc<AtomicUsize>,
    pub(crate) local_getters_cache: Mutex<HashMap<String, Arc<IndexMap<String, String>>>>,
    pub(crate) strict: bool,
    pub(crate) dev_mode: bool,
    pub(crate) devtools: Option<Arc<dyn DevtoolsHook>>,
    subscribers: Arc<SubscriberList<MutationSubscriber>>,
    action_subscribers: Arc<SubscriberList<ActionSubscriber>>,
    watchers: Arc<SubscriberList<Watcher>>,
    flushing: AtomicBool,
    diagnostics: Mutex<VecDeque<Diagnostic>>,
    // State of unregistered modules, keyed by path. An entry lives until
    // the path or one of its ancestors is registered again.
    detached: Mutex<HashMap<Vec<String>, Value>>,
    // rejects whole-tree replaces outside a commit scope in dev mode
    replace_guard: Mutex<Option<WatchGuard>>,
}

impl StoreInner {
    /// Log a recovered condition and keep it for `take_diagnostics`.
    pub(crate) fn report(&self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::DuplicateNamespace { namespace, path } => {
                tracing::error!(namespace = %namespace, path = ?path, "duplicate namespace")
            }
            Diagnostic::DuplicateGetter { key } => {
                tracing::error!(key = %key, "duplicate getter key")
            }
            Diagnostic::StateFieldOverridden { path } => {
                tracing::warn!(path = ?path, "module state overrides a field of its parent state")
            }
            Diagnostic::HotUpdateAdded { path } => {
                tracing::warn!(path = ?path, "new module added during hot update; manual reload required")
            }
            Diagnostic::HotUpdateRemoved { path } => {
                tracing::warn!(path = ?path, "module removed during hot update; manual reload required")
            }
            Diagnostic::UnknownMutation { kind } => {
                tracing::error!(kind = %kind, "unknown mutation type")
            }
            Diagnostic::UnknownAction { kind } => {
                tracing::error!(kind = %kind, "unknown action type")
            }
            Diagnostic::SubscriberPanicked { phase, kind } => {
                tracing::error!(phase = %phase, kind = %kind, "subscriber panicked")
            }
            Diagnostic::NotRegistered { path } => {
                tracing::warn!(path = ?path, "module to unregister is not registered")
            }
        }

        let mut log = self.diagnostics.lock();
        if log.len() == MAX_DIAGNOSTICS {
            log.pop_front();
        }
        log.push_back(diagnostic);
    }

    /// Run `f` inside a commit scope. Scopes nest and may overlap across
    /// threads; the scope is closed even if `f` panics.
    pub(crate) fn with_commit<R>(&self, f: impl FnOnce() -> R) -> R {
        self.committing.fetch_add(1, Ordering::SeqCst);
        let _close = CloseCommitScope {
            open: &self.committing,
        };
        f()
    }

    fn guarded<R>(&self, phase: SubscriberPhase, kind: &str, f: impl FnOnce() -> R) -> Option<R> {
        match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(result) => Some(result),
            Err(_) => {
                self.report(Diagnostic::SubscriberPanicked {
                    phase,
                    kind: kind.to_string(),
                });
                None
            }
        }
    }
}

struct CloseCommitScope<'a> {
    open: &'a AtomicUsize,
}

impl Drop for CloseCommitScope<'_> {
    fn drop(&mut self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A centralized state container built from a tree of modules.
///
/// State only changes through registered mutations, committed by type.
/// Actions orchestrate asynchronous work and commit mutations; getters are
/// memoized derivations of state. Handles are cheap to clone and all refer
/// to the same store.
///
/// # Examples
///
/// ```
/// use larder::{Module, Store};
/// use serde_json::json;
///
/// let store = Store::new(
///     Module::new()
///         .state(json!({ "count": 0 }))
///         .mutation("increment", |state, _| {
///             state["count"] = json!(state["count"].as_i64().unwrap_or(0) + 1);
///         })
///         .getter("doubled", |ctx| json!(ctx.state()["count"].as_i64().unwrap_or(0) * 2)),
/// )
/// .unwrap();
///
/// store.commit("increment", json!(null));
/// store.commit("increment", json!(null));
/// assert_eq!(store.state()["count"], json!(2));
/// assert_eq!(store.getters().get("doubled"), Some(json!(4)));
/// ```
#[derive(Clone)]
pub struct Store {
    pub(crate) inner: Arc<StoreInner>,
}

impl Store {
    /// Create a store with default options.
    pub fn new(root: Module) -> Result<Self> {
        Self::with_options(root, StoreOptions::default())
    }

    /// Create a store from a root module.
    ///
    /// Installs every module, builds the getter projection and finally
    /// hands the store to each plugin, in order.
    pub fn with_options(root: Module, options: StoreOptions) -> Result<Self> {
        let StoreOptions {
            strict,
            dev_mode,
            devtools,
            plugins,
            runtime,
        } = options;

        let runtime = runtime.unwrap_or_else(ReactiveRuntime::global);
        if dev_mode && !runtime.is_installed() {
            return Err(StoreError::NotInstalled);
        }

        let modules = ModuleCollection::new(&root);
        let tree = StateTree::new(modules.root().state.clone());

        let inner = Arc::new(StoreInner {
            runtime,
            tree,
            modules: RwLock::new(modules),
            registry: RwLock::new(Registry::default()),
            vm: RwLock::new(None),
            committing: Arc::new(AtomicUsize::new(0)),
            local_getters_cache: Mutex::new(HashMap::new()),
            strict,
            dev_mode,
            devtools,
            subscribers: SubscriberList::new(),
            action_subscribers: SubscriberList::new(),
            watchers: SubscriberList::new(),
            flushing: AtomicBool::new(false),
            diagnostics: Mutex::new(VecDeque::new()),
            detached: Mutex::new(HashMap::new()),
            replace_guard: Mutex::new(None),
        });

        if dev_mode {
            let committing = Arc::clone(&inner.committing);
            let guard = inner.tree.guard_replace(move |_| {
                if committing.load(Ordering::SeqCst) == 0 {
                    return Err(StoreError::DirectStateReplace);
                }
                Ok(())
            });
            *inner.replace_guard.lock() = Some(guard);
        }

        {
            let mut modules = inner.modules.write();
            let mut registry = inner.registry.write();
            install_module(&inner, &mut modules, &mut registry, &[], false)?;
        }
        reset_store_vm(&inner, false);
        tracing::debug!(strict, dev_mode, plugins = plugins.len(), "store created");

        let store = Store { inner };
        for plugin in plugins {
            plugin(&store);
        }
        Ok(store)
    }

    /// The whole state tree. The read is tracked, so getters and watchers
    /// calling this depend on every part of the state.
    pub fn state(&self) -> Value {
        self.inner.tree.get(&[])
    }

    /// The observable tree backing the store.
    ///
    /// Writing through it bypasses mutations; under strict mode such a
    /// write returns [`StoreError::IllegalMutation`]. In dev mode replacing
    /// the root returns [`StoreError::DirectStateReplace`] and leaves the
    /// state untouched; use [`Store::replace_state`] instead.
    pub fn state_tree(&self) -> StateTree {
        self.inner.tree.clone()
    }

    pub fn getters(&self) -> Getters {
        Getters::root(self.clone())
    }

    pub(crate) fn getter(&self, key: &str) -> Option<Value> {
        let vm = self.inner.vm.read().clone()?;
        vm.get(key)
    }

    pub(crate) fn getter_keys(&self) -> Vec<String> {
        match self.inner.vm.read().as_ref() {
            Some(vm) => vm.keys(),
            None => Vec::new(),
        }
    }

    pub(crate) fn local_getters(&self, namespace: &str) -> Getters {
        if let Some(view) = self.inner.local_getters_cache.lock().get(namespace) {
            return Getters::local(self.clone(), Arc::clone(view));
        }

        let view = Arc::new(namespace_view(namespace, &self.getter_keys()));
        self.inner
            .local_getters_cache
            .lock()
            .insert(namespace.to_string(), Arc::clone(&view));
        Getters::local(self.clone(), view)
    }

    /// Apply every mutation registered under `kind`, in registration
    /// order, then notify subscribers.
    ///
    /// An unknown type is reported and ignored.
    pub fn commit(&self, kind: &str, payload: Value) {
        let handlers = self.inner.registry.read().mutations.get(kind).cloned();
        let Some(handlers) = handlers else {
            self.inner.report(Diagnostic::UnknownMutation {
                kind: kind.to_string(),
            });
            return;
        };

        tracing::trace!(kind, handlers = handlers.len(), "commit");
        self.inner.with_commit(|| {
            for handler in &handlers {
                handler(&payload);
            }
        });

        let mutation = Mutation::new(kind, payload);
        let state = self.inner.tree.peek(&[]);
        for subscriber in self.inner.subscribers.snapshot() {
            self.inner
                .guarded(SubscriberPhase::Mutation, kind, || subscriber(&mutation, &state));
        }

        self.flush();
    }

    /// Object-style form of [`commit`](Store::commit).
    pub fn commit_mutation(&self, mutation: Mutation) {
        self.commit(&mutation.kind, mutation.payload);
    }

    /// Run every action registered under `kind`.
    ///
    /// `before` subscribers run before this returns. The returned future
    /// settles once every handler has settled: with the single handler's
    /// value, or an array of values when several handlers share the type.
    /// If any handler fails the future fails with the first error in
    /// registration order, after `error` subscribers have seen it.
    ///
    /// An unknown type is reported and resolves to `null`.
    pub fn dispatch(&self, kind: &str, payload: Value) -> ActionFuture {
        let handlers = self.inner.registry.read().actions.get(kind).cloned();
        let Some(handlers) = handlers else {
            self.inner.report(Diagnostic::UnknownAction {
                kind: kind.to_string(),
            });
            return future::ready(Ok(Value::Null)).boxed();
        };

        tracing::trace!(kind, handlers = handlers.len(), "dispatch");
        let action = Action::new(kind, payload.clone());
        let subscribers = self.inner.action_subscribers.snapshot();

        let state = self.inner.tree.peek(&[]);
        for subscriber in &subscribers {
            if let Some(before) = &subscriber.before {
                self.inner
                    .guarded(SubscriberPhase::Before, kind, || before(&action, &state));
            }
        }

        let pending: Vec<ActionFuture> = handlers
            .iter()
            .map(|handler| handler(payload.clone()))
            .collect();
        let store = self.clone();

        async move {
            let result = match <[ActionFuture; 1]>::try_from(pending) {
                Ok([single]) => single.await,
                Err(pending) => join_all(pending)
                    .await
                    .into_iter()
                    .collect::<std::result::Result<Vec<Value>, ActionError>>()
                    .map(Value::Array),
            };

            let state = store.inner.tree.peek(&[]);
            match &result {
                Ok(_) => {
                    for subscriber in &subscribers {
                        if let Some(after) = &subscriber.after {
                            store.inner.guarded(SubscriberPhase::After, &action.kind, || {
                                after(&action, &state)
                            });
                        }
                    }
                }
                Err(err) => {
                    tracing::debug!(kind = %action.kind, error = %err, "action failed");
                    for subscriber in &subscribers {
                        if let Some(on_error) = &subscriber.error {
                            store.inner.guarded(SubscriberPhase::Error, &action.kind, || {
                                on_error(&action, &state, err)
                            });
                        }
                    }
                }
            }

            store.flush();
            result
        }
        .boxed()
    }

    /// Object-style form of [`dispatch`](Store::dispatch).
    pub fn dispatch_action(&self, action: Action) -> ActionFuture {
        self.dispatch(&action.kind, action.payload)
    }

    /// Call `f` with every committed mutation and the state after it.
    pub fn subscribe<F>(&self, f: F) -> Unsubscribe
    where
        F: Fn(&Mutation, &Value) + Send + Sync + 'static,
    {
        self.subscribe_with(f, SubscribeOptions::default())
    }

    pub fn subscribe_with<F>(&self, f: F, options: SubscribeOptions) -> Unsubscribe
    where
        F: Fn(&Mutation, &Value) + Send + Sync + 'static,
    {
        let subscriber: Arc<MutationSubscriber> = Arc::new(f);
        self.inner.subscribers.add(subscriber, options)
    }

    pub fn subscribe_action(&self, subscriber: ActionSubscriber) -> Unsubscribe {
        self.subscribe_action_with(subscriber, SubscribeOptions::default())
    }

    pub fn subscribe_action_with(
        &self,
        subscriber: ActionSubscriber,
        options: SubscribeOptions,
    ) -> Unsubscribe {
        self.inner.action_subscribers.add(Arc::new(subscriber), options)
    }

    /// Watch a value derived from state and getters.
    ///
    /// `callback` receives `(new, old)` whenever the selected value changes.
    /// Changes are delivered once the store operation that caused them
    /// finishes. Dropping the guard stops the watch.
    pub fn watch<S, F>(&self, selector: S, callback: F) -> WatchGuard
    where
        S: Fn(&Value, &Getters) -> Value + Send + Sync + 'static,
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        self.watch_with(selector, callback, WatchOptions::default())
    }

    pub fn watch_with<S, F>(&self, selector: S, callback: F, options: WatchOptions) -> WatchGuard
    where
        S: Fn(&Value, &Getters) -> Value + Send + Sync + 'static,
        F: Fn(&Value, &Value) + Send + Sync + 'static,
    {
        let watcher = Arc::new(Watcher::new(selector, callback));
        let initial = watcher.prime(self);
        if options.immediate {
            self.inner.guarded(SubscriberPhase::Watch, "watch", || {
                watcher.fire(&initial, &Value::Null)
            });
        }

        let handle = self.inner.watchers.add(watcher, SubscribeOptions::default());
        WatchGuard::new(move || handle.unsubscribe())
    }

    /// Replace the whole state tree.
    pub fn replace_state(&self, state: Value) -> Result<()> {
        self.inner.with_commit(|| self.inner.tree.replace(state))?;
        tracing::debug!("state replaced");
        self.flush();
        Ok(())
    }

    pub fn register_module(&self, path: impl ModulePath, module: Module) -> Result<()> {
        self.register_module_with(path, module, RegisterOptions::default())
    }

    /// Register `module` at `path` after construction.
    ///
    /// The parent must already be registered. With `preserve_state` the
    /// module keeps state already at `path`, including state it held before
    /// being unregistered; otherwise it starts from its initial state.
    pub fn register_module_with(
        &self,
        path: impl ModulePath,
        module: Module,
        options: RegisterOptions,
    ) -> Result<()> {
        let path = path.into_segments();
        if path.is_empty() {
            return Err(StoreError::RootRegistration);
        }

        self.inner.modules.write().register(&path, &module)?;

        let installed = self.install_registered(&path, options.preserve_state);
        if let Err(err) = installed {
            if let Err(rollback) = self.inner.modules.write().unregister(&path) {
                tracing::warn!(path = ?path, error = %rollback, "failed to roll back registration");
            }
            return Err(err);
        }

        reset_store_vm(&self.inner, false);
        self.flush();
        Ok(())
    }

    fn install_registered(&self, path: &[String], preserve_state: bool) -> Result<()> {
        let detached = {
            let mut stash = self.inner.detached.lock();
            let own = stash.remove(path);
            // Stashes below `path` belong to modules that no longer exist.
            stash.retain(|stashed, _| !stashed.starts_with(path));
            own
        };
        let mut hot = false;
        if preserve_state {
            if let Some(state) = detached {
                if !self.inner.tree.contains(path) {
                    self.inner.with_commit(|| self.inner.tree.set(path, state))?;
                }
            }
            hot = self.inner.tree.contains(path);
        }

        let mut modules = self.inner.modules.write();
        let mut registry = self.inner.registry.write();
        install_module(&self.inner, &mut modules, &mut registry, path, hot)
    }

    /// Remove the module at `path` along with its state and handlers.
    pub fn unregister_module(&self, path: impl ModulePath) -> Result<()> {
        let path = path.into_segments();
        let removed = self.inner.modules.write().unregister(&path)?;
        if removed.is_none() {
            self.inner.report(Diagnostic::NotRegistered { path });
            return Ok(());
        }

        if let Some((key, parent)) = path.split_last() {
            let state = self
                .inner
                .with_commit(|| self.inner.tree.remove_property(parent, key))?;
            if let Some(state) = state {
                self.inner.detached.lock().insert(path.clone(), state);
            }
        }

        reset_store(&self.inner, false)?;
        self.flush();
        Ok(())
    }

    pub fn has_module(&self, path: impl ModulePath) -> bool {
        self.inner.modules.read().is_registered(&path.into_segments())
    }

    /// Swap in new handlers without touching state.
    ///
    /// Only modules already registered are updated; modules present on one
    /// side only are reported and left as they are.
    pub fn hot_update(&self, root: Module) -> Result<()> {
        let diagnostics = self.inner.modules.write().update(&root);
        for diagnostic in diagnostics {
            self.inner.report(diagnostic);
        }
        reset_store(&self.inner, true)?;
        self.flush();
        Ok(())
    }

    /// Drain the recovered conditions reported so far, oldest first.
    pub fn take_diagnostics(&self) -> Vec<Diagnostic> {
        self.inner.diagnostics.lock().drain(..).collect()
    }

    /// Deliver pending watch callbacks, then run deferred runtime work.
    pub(crate) fn flush(&self) {
        if self.inner.flushing.swap(true, Ordering::SeqCst) {
            return;
        }

        for pass in 0..MAX_WATCH_PASSES {
            let mut fired = false;
            for watcher in self.inner.watchers.snapshot() {
                let changed = self
                    .inner
                    .guarded(SubscriberPhase::Watch, "watch", || watcher.check(self));
                fired |= changed.unwrap_or(false);
            }
            if !fired {
                break;
            }
            if pass + 1 == MAX_WATCH_PASSES {
                tracing::error!(
                    passes = MAX_WATCH_PASSES,
                    "watch callbacks keep changing state; possible infinite update loop"
                );
            }
        }

        self.inner.flushing.store(false, Ordering::SeqCst);
        self.inner.runtime.flush();
    }
}

impl fmt::Debug for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Store")
            .field("state", &self.inner.tree.peek(&[]))
            .field("strict", &self.inner.strict)
            .finish_non_exhaustive()
    }
}

/// Options for [`Store::register_module_with`].
#[derive(Debug, Clone, Copy, Default)]
pub struct RegisterOptions {
    /// Keep state already present at the module's path instead of
    /// installing the module's initial state.
    pub preserve_state: bool,
}

/// A module path: a single key or a sequence of keys from the root.
pub trait ModulePath {
    fn into_segments(self) -> Vec<String>;
}

impl ModulePath for &str {
    fn into_segments(self) -> Vec<String> {
        vec![self.to_string()]
    }
}

impl ModulePath for String {
    fn into_segments(self) -> Vec<String> {
        vec![self]
    }
}

impl ModulePath for Vec<String> {
    fn into_segments(self) -> Vec<String> {
        self
    }
}

impl ModulePath for Vec<&str> {
    fn into_segments(self) -> Vec<String> {
        self.into_iter().map(str::to_string).collect()
    }
}

impl ModulePath for &[&str] {
    fn into_segments(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}

impl ModulePath for &[String] {
    fn into_segments(self) -> Vec<String> {
        self.to_vec()
    }
}

impl<const N: usize> ModulePath for [&str; N] {
    fn into_segments(self) -> Vec<String> {
        self.iter().map(|s| s.to_string()).collect()
    }
}
