//! # Larder
//!
//! A centralized, predictable state container built from a tree of modules.
//!
//! State lives in a single JSON tree and changes only through named,
//! synchronous **mutations**. **Actions** run asynchronous workflows that
//! commit mutations, and **getters** are memoized derivations that
//! recompute only when state they read has changed.
//!
//! ## Modules
//!
//! A store is built from a root [`Module`]. Modules nest; each owns a slice
//! of the state tree under its key. A module marked `namespaced` prefixes
//! the types of its mutations, actions and getters with its key, and its
//! handlers see a local context that addresses the module's own slice
//! without manual prefixing.
//!
//! ## Runtime
//!
//! The [`runtime`] module supplies the reactive layer: an observable state
//! tree with per-path version stamps, dependency-tracked memos and a
//! deferred-work queue.
//!
//! ```
//! use larder::{Module, Store};
//! use serde_json::json;
//!
//! # futures::executor::block_on(async {
//! let store = Store::new(
//!     Module::new().module(
//!         "cart",
//!         Module::new()
//!             .namespaced(true)
//!             .state(json!({ "orders": [] }))
//!             .mutation("add_order", |state, order| {
//!                 if let Some(orders) = state["orders"].as_array_mut() {
//!                     orders.push(order.clone());
//!                 }
//!             })
//!             .action_sync("checkout", |ctx, order| {
//!                 ctx.commit("add_order", order);
//!                 Ok(json!(null))
//!             }),
//!     ),
//! )
//! .unwrap();
//!
//! store.dispatch("cart/checkout", json!({ "id": 1 })).await.unwrap();
//! assert_eq!(store.state()["cart"]["orders"], json!([{ "id": 1 }]));
//! # });
//! ```

pub mod config;
pub mod error;
pub mod module;
pub mod plugin;
pub mod provide;
pub mod runtime;
pub mod store;

// Re-export main types for convenience
pub use config::{StoreConfig, StoreOptions};
pub use error::{ActionError, Diagnostic, Result, StoreError, SubscriberPhase};
pub use module::{ActionFuture, Module};
pub use plugin::{DevtoolsHook, Plugin};
pub use runtime::{ReactiveRuntime, StateTree, WatchGuard};
pub use store::{
    Action, ActionContext, ActionSubscriber, CommitOptions, GetterContext, Getters, ModulePath,
    Mutation, RegisterOptions, Store, SubscribeOptions, Unsubscribe, WatchOptions,
};
