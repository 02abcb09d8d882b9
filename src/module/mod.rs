//! Module definitions and the module tree.
//!
//! A [`Module`] is the raw, user-facing definition: state, mutations,
//! actions, getters and nested modules. Once handed to a store it becomes
//! a node of the module tree, which resolves paths and namespaces.

mod collection;
mod module;

pub(crate) use collection::ModuleCollection;
pub use module::{ActionFn, ActionFuture, GetterFn, Module, MutationFn, StateSource};
