//! Plugin and devtools contracts.

use crate::error::ActionError;
use crate::store::Store;

/// A plugin receives the fully built store exactly once, at construction.
///
/// Plugins typically subscribe to mutations or actions.
pub type Plugin = Box<dyn FnOnce(&Store) + Send>;

/// Event emitted to the devtools hook when a dispatched action fails.
pub const ACTION_ERROR_EVENT: &str = "vuex:error";

/// Development-time instrumentation attached to a store.
///
/// The store only reports to the hook; whatever the hook does, the
/// original error still reaches the dispatch caller.
pub trait DevtoolsHook: Send + Sync {
    fn emit(&self, event: &str, error: &ActionError);
}

/// Devtools hook that forwards events to `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingDevtools;

impl DevtoolsHook for TracingDevtools {
    fn emit(&self, event: &str, error: &ActionError) {
        tracing::info!(target: "larder::devtools", event, error = %error, "devtools event");
    }
}
