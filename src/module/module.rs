use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use indexmap::IndexMap;
use serde_json::{Map, Value};

use crate::error::ActionError;
use crate::store::{ActionContext, GetterContext, LocalContext};

/// Future returned by every action handler.
pub type ActionFuture = BoxFuture<'static, Result<Value, ActionError>>;

/// Synchronous state transition: `(local_state, payload)`.
pub type MutationFn = dyn Fn(&mut Value, &Value) + Send + Sync;

/// Asynchronous workflow: `(context, payload)`.
pub type ActionFn = dyn Fn(ActionContext, Value) -> ActionFuture + Send + Sync;

/// Pure derivation of state and other getters.
pub type GetterFn = dyn Fn(&GetterContext) -> Value + Send + Sync;

/// Initial state of a module: a value cloned on every instantiation, or a
/// factory called on every instantiation.
#[derive(Clone)]
pub enum StateSource {
    Value(Value),
    Factory(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl StateSource {
    fn instantiate(&self) -> Value {
        match self {
            StateSource::Value(value) => value.clone(),
            StateSource::Factory(factory) => factory(),
        }
    }
}

/// An action handler together with how its type is registered.
#[derive(Clone)]
pub struct ActionDef {
    pub(crate) handler: Arc<ActionFn>,
    pub(crate) root: bool,
}

/// Raw definition of a module.
///
/// Handler tables that were never touched stay unset, which lets a hot
/// update replace only the tables it actually provides.
///
/// # Examples
///
/// ```
/// use larder::Module;
/// use serde_json::json;
///
/// let counter = Module::new()
///     .state(json!({ "count": 0 }))
///     .mutation("increment", |state, _| {
///         state["count"] = json!(state["count"].as_i64().unwrap_or(0) + 1);
///     })
///     .getter("doubled", |ctx| json!(ctx.state()["count"].as_i64().unwrap_or(0) * 2));
/// ```
#[derive(Clone, Default)]
pub struct Module {
    pub(crate) state: Option<StateSource>,
    pub(crate) namespaced: bool,
    pub(crate) mutations: Option<IndexMap<String, Arc<MutationFn>>>,
    pub(crate) actions: Option<IndexMap<String, ActionDef>>,
    pub(crate) getters: Option<IndexMap<String, Arc<GetterFn>>>,
    pub(crate) modules: Option<IndexMap<String, Module>>,
}

impl Module {
    pub fn new() -> Self {
        Self::default()
    }

    /// Initial state, cloned for every instance of this module.
    pub fn state(mut self, state: Value) -> Self {
        self.state = Some(StateSource::Value(state));
        self
    }

    /// Initial state produced by a factory, called for every instance.
    pub fn state_fn<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.state = Some(StateSource::Factory(Arc::new(factory)));
        self
    }

    /// Opt this module into its own namespace.
    pub fn namespaced(mut self, namespaced: bool) -> Self {
        self.namespaced = namespaced;
        self
    }

    pub fn mutation<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&mut Value, &Value) + Send + Sync + 'static,
    {
        self.mutations
            .get_or_insert_with(IndexMap::new)
            .insert(name.into(), Arc::new(handler));
        self
    }

    /// Register an asynchronous action under this module's namespace.
    pub fn action<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ActionContext, Value) -> ActionFuture + Send + Sync + 'static,
    {
        self.push_action(name.into(), Arc::new(handler), false)
    }

    /// Register a synchronous action; its result is wrapped in a completed future.
    pub fn action_sync<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ActionContext, Value) -> Result<Value, ActionError> + Send + Sync + 'static,
    {
        self.push_action(name.into(), coerce(handler), false)
    }

    /// Register an asynchronous action under its bare name, ignoring the
    /// module's namespace.
    pub fn root_action<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ActionContext, Value) -> ActionFuture + Send + Sync + 'static,
    {
        self.push_action(name.into(), Arc::new(handler), true)
    }

    pub fn root_action_sync<F>(self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ActionContext, Value) -> Result<Value, ActionError> + Send + Sync + 'static,
    {
        self.push_action(name.into(), coerce(handler), true)
    }

    pub fn getter<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&GetterContext) -> Value + Send + Sync + 'static,
    {
        self.getters
            .get_or_insert_with(IndexMap::new)
            .insert(name.into(), Arc::new(handler));
        self
    }

    /// Nest a child module under `key`.
    pub fn module(mut self, key: impl Into<String>, module: Module) -> Self {
        self.modules
            .get_or_insert_with(IndexMap::new)
            .insert(key.into(), module);
        self
    }

    fn push_action(mut self, name: String, handler: Arc<ActionFn>, root: bool) -> Self {
        self.actions
            .get_or_insert_with(IndexMap::new)
            .insert(name, ActionDef { handler, root });
        self
    }

    pub(crate) fn children(&self) -> impl Iterator<Item = (&String, &Module)> {
        self.modules.iter().flat_map(|modules| modules.iter())
    }
}

fn coerce<F>(handler: F) -> Arc<ActionFn>
where
    F: Fn(ActionContext, Value) -> Result<Value, ActionError> + Send + Sync + 'static,
{
    Arc::new(move |ctx: ActionContext, payload: Value| {
        future::ready(handler(ctx, payload)).boxed()
    })
}

/// A node of the module tree.
pub(crate) struct ModuleNode {
    pub(crate) namespaced: bool,
    pub(crate) state: Value,
    pub(crate) context: Option<LocalContext>,
    mutations: IndexMap<String, Arc<MutationFn>>,
    actions: IndexMap<String, ActionDef>,
    getters: IndexMap<String, Arc<GetterFn>>,
    children: IndexMap<String, ModuleNode>,
}

impl std::fmt::Debug for ModuleNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleNode")
            .field("namespaced", &self.namespaced)
            .field("state", &self.state)
            .field("mutations", &self.mutations.keys().collect::<Vec<_>>())
            .field("actions", &self.actions.keys().collect::<Vec<_>>())
            .field("getters", &self.getters.keys().collect::<Vec<_>>())
            .field("children", &self.children)
            .finish_non_exhaustive()
    }
}

impl ModuleNode {
    /// Build a node from a raw definition, without its children.
    pub(crate) fn new(raw: &Module) -> Self {
        let state = match raw.state.as_ref().map(StateSource::instantiate) {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(state) => state,
        };
        Self {
            namespaced: raw.namespaced,
            state,
            context: None,
            mutations: raw.mutations.clone().unwrap_or_default(),
            actions: raw.actions.clone().unwrap_or_default(),
            getters: raw.getters.clone().unwrap_or_default(),
            children: IndexMap::new(),
        }
    }

    pub(crate) fn child(&self, key: &str) -> Option<&ModuleNode> {
        self.children.get(key)
    }

    pub(crate) fn child_mut(&mut self, key: &str) -> Option<&mut ModuleNode> {
        self.children.get_mut(key)
    }

    pub(crate) fn add_child(&mut self, key: String, node: ModuleNode) {
        self.children.insert(key, node);
    }

    pub(crate) fn remove_child(&mut self, key: &str) -> Option<ModuleNode> {
        self.children.shift_remove(key)
    }

    /// Replace handlers with those the new definition provides. State is
    /// never touched.
    pub(crate) fn update(&mut self, raw: &Module) {
        self.namespaced = raw.namespaced;
        if let Some(mutations) = &raw.mutations {
            self.mutations = mutations.clone();
        }
        if let Some(actions) = &raw.actions {
            self.actions = actions.clone();
        }
        if let Some(getters) = &raw.getters {
            self.getters = getters.clone();
        }
    }

    pub(crate) fn mutations(&self) -> impl Iterator<Item = (&String, &Arc<MutationFn>)> {
        self.mutations.iter()
    }

    pub(crate) fn actions(&self) -> impl Iterator<Item = (&String, &ActionDef)> {
        self.actions.iter()
    }

    pub(crate) fn getters(&self) -> impl Iterator<Item = (&String, &Arc<GetterFn>)> {
        self.getters.iter()
    }

    pub(crate) fn children(&self) -> impl Iterator<Item = (&String, &ModuleNode)> {
        self.children.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn factory_runs_per_instance() {
        let calls = Arc::new(AtomicUsize::new(0));
        let raw = Module::new().state_fn({
            let calls = calls.clone();
            move || json!({ "n": calls.fetch_add(1, Ordering::SeqCst) })
        });

        let first = ModuleNode::new(&raw);
        let second = ModuleNode::new(&raw);
        assert_eq!(first.state, json!({ "n": 0 }));
        assert_eq!(second.state, json!({ "n": 1 }));
    }

    #[test]
    fn missing_state_defaults_to_empty_object() {
        let node = ModuleNode::new(&Module::new());
        assert_eq!(node.state, json!({}));
    }

    #[test]
    fn handlers_keep_declaration_order() {
        let raw = Module::new()
            .mutation("b", |_, _| {})
            .mutation("a", |_, _| {})
            .mutation("c", |_, _| {});
        let node = ModuleNode::new(&raw);
        let names: Vec<_> = node.mutations().map(|(name, _)| name.as_str()).collect();
        assert_eq!(names, ["b", "a", "c"]);
    }

    #[test]
    fn update_replaces_only_provided_tables() {
        let raw = Module::new()
            .mutation("m", |_, _| {})
            .getter("g", |_| Value::Null);
        let mut node = ModuleNode::new(&raw);

        node.update(&Module::new().namespaced(true).getter("h", |_| Value::Null));

        assert!(node.namespaced);
        assert_eq!(node.mutations().count(), 1);
        let getters: Vec<_> = node.getters().map(|(name, _)| name.as_str()).collect();
        assert_eq!(getters, ["h"]);
    }

    #[test]
    fn sync_actions_resolve_immediately() {
        let raw = Module::new().action_sync("ping", |_, payload| Ok(payload));
        let def = raw.actions.as_ref().and_then(|a| a.get("ping")).cloned();
        assert!(matches!(def, Some(ActionDef { root: false, .. })));
    }
}
