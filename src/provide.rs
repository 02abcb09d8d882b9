//! Handing a store to component instances.
//!
//! A host framework calls [`inject`] once when a component is created. The
//! component either brings its own store (a handle or a factory) or
//! inherits the store of its nearest ancestor that has one.

use std::fmt;
use std::sync::Arc;

use crate::store::Store;

/// A store given in a component's configuration.
#[derive(Clone)]
pub enum StoreRef {
    Value(Store),
    Factory(Arc<dyn Fn() -> Store + Send + Sync>),
}

impl StoreRef {
    pub fn factory<F>(factory: F) -> Self
    where
        F: Fn() -> Store + Send + Sync + 'static,
    {
        StoreRef::Factory(Arc::new(factory))
    }

    /// Produce the store handle, calling the factory if there is one.
    pub fn resolve(&self) -> Store {
        match self {
            StoreRef::Value(store) => store.clone(),
            StoreRef::Factory(factory) => factory(),
        }
    }
}

impl From<Store> for StoreRef {
    fn from(store: Store) -> Self {
        StoreRef::Value(store)
    }
}

impl fmt::Debug for StoreRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreRef::Value(store) => f.debug_tuple("Value").field(store).finish(),
            StoreRef::Factory(_) => f.write_str("Factory"),
        }
    }
}

/// A component instance that can hold a store.
pub trait HasStore {
    fn store(&self) -> Option<&Store>;
}

/// Pick the store for a component being created.
///
/// An own store wins; otherwise the parent's store is shared. Returns
/// `None` when neither has one.
pub fn inject<P>(own: Option<&StoreRef>, parent: Option<&P>) -> Option<Store>
where
    P: HasStore + ?Sized,
{
    match own {
        Some(store) => Some(store.resolve()),
        None => parent.and_then(|parent| parent.store()).cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Module;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Component {
        store: Option<Store>,
    }

    impl HasStore for Component {
        fn store(&self) -> Option<&Store> {
            self.store.as_ref()
        }
    }

    fn store(count: i64) -> Store {
        Store::new(Module::new().state(json!({ "count": count }))).unwrap()
    }

    #[test]
    fn own_store_wins_over_parent() {
        let parent = Component { store: Some(store(1)) };
        let own = StoreRef::from(store(2));
        let injected = inject(Some(&own), Some(&parent)).unwrap();
        assert_eq!(injected.state()["count"], json!(2));
    }

    #[test]
    fn child_inherits_parent_store() {
        let root = Component { store: Some(store(7)) };
        let child = Component {
            store: inject(None, Some(&root)),
        };
        let grandchild = inject(None, Some(&child)).unwrap();

        grandchild.state_tree().set(&["count".to_string()], json!(8)).unwrap();
        // Same store, not a copy.
        assert_eq!(root.store.as_ref().unwrap().state()["count"], json!(8));
    }

    #[test]
    fn factory_is_called_per_injection() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = calls.clone();
        let own = StoreRef::factory(move || {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            store(0)
        });

        inject::<Component>(Some(&own), None).unwrap();
        inject::<Component>(Some(&own), None).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn no_store_anywhere() {
        assert!(inject::<Component>(None, None).is_none());
        let orphan = Component { store: None };
        assert!(inject(None, Some(&orphan)).is_none());
    }
}
