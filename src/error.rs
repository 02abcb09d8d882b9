//! Error types for the store.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

/// Errors raised by store operations and developer-mode assertions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("module not found at path {0:?}")]
    ModuleNotFound(Vec<String>),

    #[error("cannot register the root module by using register_module")]
    RootRegistration,

    #[error("cannot unregister the root module")]
    RootUnregistration,

    #[error("reactive runtime must be installed before creating a store")]
    NotInstalled,

    #[error("do not mutate store state outside mutation handlers (path {0:?})")]
    IllegalMutation(Vec<String>),

    #[error("use Store::replace_state() to explicitly replace store state")]
    DirectStateReplace,

    #[error("state at path {0:?} is not an object and cannot hold module state")]
    InvalidState(Vec<String>),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A condition that is reported and then recovered from.
///
/// Each diagnostic is logged when it happens and kept by the store until
/// drained with `Store::take_diagnostics`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A namespaced module claimed a namespace another module already holds.
    /// The later module wins the namespace map entry.
    DuplicateNamespace { namespace: String, path: Vec<String> },
    /// A getter key was registered twice. The first registration wins.
    DuplicateGetter { key: String },
    /// Module state replaced a same-named field of its parent's state.
    StateFieldOverridden { path: Vec<String> },
    /// Hot update found a module absent from the live tree; it must be
    /// registered manually.
    HotUpdateAdded { path: Vec<String> },
    /// Hot update found a live module absent from the new definition; it is
    /// left in place.
    HotUpdateRemoved { path: Vec<String> },
    /// Commit of a type with no registered mutation.
    UnknownMutation { kind: String },
    /// Dispatch of a type with no registered action.
    UnknownAction { kind: String },
    /// A subscriber callback panicked; the remaining subscribers still ran.
    SubscriberPanicked { phase: SubscriberPhase, kind: String },
    /// An unregister call named a module that does not exist.
    NotRegistered { path: Vec<String> },
}

/// Which subscriber list a panicking callback belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberPhase {
    Mutation,
    Before,
    After,
    Error,
    Watch,
}

impl fmt::Display for SubscriberPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubscriberPhase::Mutation => "mutation",
            SubscriberPhase::Before => "before action",
            SubscriberPhase::After => "after action",
            SubscriberPhase::Error => "error action",
            SubscriberPhase::Watch => "watch",
        };
        f.write_str(name)
    }
}

/// Failure of an action handler.
///
/// Cheap to clone so the same failure can be handed to every awaiting
/// party, error subscribers and the devtools hook.
#[derive(Clone)]
pub struct ActionError(Arc<anyhow::Error>);

impl ActionError {
    /// Build an error from a plain message.
    pub fn msg<M>(message: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self(Arc::new(anyhow::Error::msg(message)))
    }

    /// Borrow the underlying error.
    pub fn inner(&self) -> &anyhow::Error {
        &self.0
    }
}

impl From<anyhow::Error> for ActionError {
    fn from(err: anyhow::Error) -> Self {
        Self(Arc::new(err))
    }
}

impl From<StoreError> for ActionError {
    fn from(err: StoreError) -> Self {
        Self(Arc::new(anyhow::Error::new(err)))
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl std::error::Error for ActionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_error_clones_share_message() {
        let err = ActionError::msg("payment declined");
        let copy = err.clone();
        assert_eq!(err.to_string(), "payment declined");
        assert_eq!(copy.to_string(), err.to_string());
    }

    #[test]
    fn store_error_converts_into_action_error() {
        let err: ActionError = StoreError::RootRegistration.into();
        assert!(err.inner().downcast_ref::<StoreError>().is_some());
    }
}
