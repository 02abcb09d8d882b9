//! Reactive runtime the store is built on.
//!
//! This module provides the observable state tree, dependency tracking,
//! memoized computed values and the deferred "next tick" queue.

mod context;
mod memo;
mod tree;

pub use context::{record, record_all, track, untracked, Dependency, ReactiveRuntime};
pub use memo::Memo;
pub use tree::{resolve, StateTree, SyncHook, WatchGuard};
