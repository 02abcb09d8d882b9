//! The store: installed modules, flat handler tables, subscribers and the
//! getter projection, behind a cloneable handle.

mod context;
mod install;
mod store;
mod subscribe;
mod watch;

pub use context::{ActionContext, CommitOptions, GetterContext, Getters, LocalContext};
pub use store::{ModulePath, RegisterOptions, Store};
pub use subscribe::{Action, ActionSubscriber, Mutation, SubscribeOptions, Unsubscribe};
pub use watch::WatchOptions;
