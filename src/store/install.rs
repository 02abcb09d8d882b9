//! Installing the module tree into a store.
//!
//! Installation walks the module tree depth-first, wires each module's
//! state into the aggregate state tree and flattens its mutations, actions
//! and getters into global tables keyed by namespaced type. Resetting
//! clears those tables and installs everything again, then swaps in a new
//! reactive projection of the getters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{self, FutureExt};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde_json::Value;

use super::context::{ActionContext, GetterContext, LocalContext};
use super::store::{Store, StoreInner};
use crate::error::{ActionError, Diagnostic, Result, StoreError};
use crate::module::{ActionFn, ActionFuture, GetterFn, ModuleCollection, MutationFn};
use crate::plugin::ACTION_ERROR_EVENT;
use crate::runtime::{Memo, WatchGuard};

pub(crate) type WrappedMutation = Arc<dyn Fn(&Value) + Send + Sync>;
pub(crate) type WrappedAction = Arc<dyn Fn(Value) -> ActionFuture + Send + Sync>;
pub(crate) type WrappedGetter = Arc<dyn Fn(&Store) -> Value + Send + Sync>;

/// Flat handler tables, keyed by fully-qualified type.
#[derive(Default)]
pub(crate) struct Registry {
    pub(crate) mutations: HashMap<String, Vec<WrappedMutation>>,
    pub(crate) actions: HashMap<String, Vec<WrappedAction>>,
    pub(crate) getters: IndexMap<String, WrappedGetter>,
    // namespace -> path of the module that owns it
    pub(crate) namespaces: HashMap<String, Vec<String>>,
}

/// Reactive projection of the registered getters.
///
/// Replaced wholesale on every reset; the previous projection is torn down
/// on the next tick so reads already in flight against it complete.
pub(crate) struct Projection {
    pub(crate) id: usize,
    computed: IndexMap<String, Memo<Value>>,
    strict_guard: Mutex<Option<WatchGuard>>,
    destroyed: AtomicBool,
}

impl Projection {
    pub(crate) fn get(&self, key: &str) -> Option<Value> {
        self.computed.get(key).map(Memo::get)
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        self.computed.keys().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.strict_guard.lock().take();
        for memo in self.computed.values() {
            memo.invalidate();
        }
    }
}

/// Install `path` and everything below it.
///
/// With `hot` set the state tree is left untouched: the module's state is
/// assumed to be in place already.
pub(crate) fn install_module(
    inner: &Arc<StoreInner>,
    modules: &mut ModuleCollection,
    registry: &mut Registry,
    path: &[String],
    hot: bool,
) -> Result<()> {
    let namespace = modules.namespace(path);
    let local = LocalContext::new(Arc::downgrade(inner), namespace.clone(), path.to_vec());

    let node = modules
        .get_mut(path)
        .ok_or_else(|| StoreError::ModuleNotFound(path.to_vec()))?;

    if node.namespaced {
        if registry.namespaces.get(&namespace).is_some_and(|owner| owner != path) {
            inner.report(Diagnostic::DuplicateNamespace {
                namespace: namespace.clone(),
                path: path.to_vec(),
            });
        }
        registry.namespaces.insert(namespace.clone(), path.to_vec());
    }

    if !hot {
        if let Some((key, parent)) = path.split_last() {
            let state = node.state.clone();
            let overridden = inner.with_commit(|| inner.tree.set_property(parent, key, state))?;
            if overridden {
                inner.report(Diagnostic::StateFieldOverridden { path: path.to_vec() });
            }
        }
    }

    node.context = Some(local.clone());

    for (key, handler) in node.mutations() {
        register_mutation(registry, format!("{namespace}{key}"), Arc::clone(handler), &local);
    }

    for (key, action) in node.actions() {
        let kind = if action.root {
            key.clone()
        } else {
            format!("{namespace}{key}")
        };
        register_action(registry, kind, Arc::clone(&action.handler), &local);
    }

    for (key, getter) in node.getters() {
        let kind = format!("{namespace}{key}");
        if registry.getters.contains_key(&kind) {
            inner.report(Diagnostic::DuplicateGetter { key: kind });
            continue;
        }
        registry
            .getters
            .insert(kind, wrap_getter(Arc::clone(getter), &local));
    }

    let children: Vec<String> = node.children().map(|(key, _)| key.clone()).collect();
    for key in children {
        let mut child_path = path.to_vec();
        child_path.push(key);
        install_module(inner, modules, registry, &child_path, hot)?;
    }

    Ok(())
}

fn register_mutation(
    registry: &mut Registry,
    kind: String,
    handler: Arc<MutationFn>,
    local: &LocalContext,
) {
    let local = local.clone();
    let wrapped: WrappedMutation = Arc::new(move |payload: &Value| {
        let tree = match local_store(&local) {
            Some(inner) => inner.tree.clone(),
            None => return,
        };
        if let Err(err) = tree.update(local.path(), |state| handler(state, payload)) {
            tracing::warn!(path = ?local.path(), error = %err, "mutation skipped");
        }
    });
    registry.mutations.entry(kind).or_default().push(wrapped);
}

fn register_action(registry: &mut Registry, kind: String, handler: Arc<ActionFn>, local: &LocalContext) {
    let local = local.clone();
    let wrapped: WrappedAction = Arc::new(move |payload: Value| -> ActionFuture {
        let Some(inner) = local_store(&local) else {
            return future::ready(Err(ActionError::msg("store dropped before action ran"))).boxed();
        };
        let store = Store { inner };
        let devtools = store.inner.devtools.clone();
        let result = handler(ActionContext::new(local.clone(), store), payload);

        match devtools {
            Some(hook) => async move {
                let result = result.await;
                if let Err(err) = &result {
                    hook.emit(ACTION_ERROR_EVENT, err);
                }
                result
            }
            .boxed(),
            None => result,
        }
    });
    registry.actions.entry(kind).or_default().push(wrapped);
}

fn wrap_getter(getter: Arc<GetterFn>, local: &LocalContext) -> WrappedGetter {
    let local = local.clone();
    Arc::new(move |store: &Store| getter(&GetterContext::new(local.clone(), store.clone())))
}

fn local_store(local: &LocalContext) -> Option<Arc<StoreInner>> {
    local.store_ref().upgrade()
}

/// Clear every table and reinstall the whole tree without touching state,
/// then rebuild the projection.
pub(crate) fn reset_store(inner: &Arc<StoreInner>, hot: bool) -> Result<()> {
    {
        let mut modules = inner.modules.write();
        let mut registry = inner.registry.write();
        *registry = Registry::default();
        install_module(inner, &mut modules, &mut registry, &[], true)?;
    }
    reset_store_vm(inner, hot);
    Ok(())
}

/// Swap in a fresh projection of the current getter table.
pub(crate) fn reset_store_vm(inner: &Arc<StoreInner>, hot: bool) {
    let computed: IndexMap<String, Memo<Value>> = inner
        .registry
        .read()
        .getters
        .iter()
        .map(|(key, getter)| {
            let store = Arc::downgrade(inner);
            let getter = Arc::clone(getter);
            let memo = Memo::new(inner.tree.clone(), move || match store.upgrade() {
                Some(inner) => getter(&Store { inner }),
                None => Value::Null,
            });
            (key.clone(), memo)
        })
        .collect();

    let projection = Arc::new(Projection {
        id: inner.runtime.next_id(),
        computed,
        strict_guard: Mutex::new(None),
        destroyed: AtomicBool::new(false),
    });

    inner.local_getters_cache.lock().clear();

    if inner.strict {
        let committing = Arc::clone(&inner.committing);
        let dev_mode = inner.dev_mode;
        let guard = inner.tree.watch_sync(move |path| {
            if dev_mode && committing.load(Ordering::SeqCst) == 0 {
                return Err(StoreError::IllegalMutation(path.to_vec()));
            }
            Ok(())
        });
        *projection.strict_guard.lock() = Some(guard);
    }

    tracing::debug!(projection = projection.id, hot, "store projection reset");
    let old = inner.vm.write().replace(projection);

    if let Some(old) = old {
        if hot {
            // Force every dependent to re-evaluate against the new handlers.
            if let Err(err) = inner.with_commit(|| inner.tree.touch(&[])) {
                tracing::warn!(error = %err, "hot reset touch rejected");
            }
        }
        inner.runtime.next_tick(move || old.destroy());
    }
}
