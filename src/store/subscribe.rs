use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ActionError;

/// A committed mutation, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Mutation {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// A dispatched action, as seen by subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Action {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

pub(crate) type MutationSubscriber = dyn Fn(&Mutation, &Value) + Send + Sync;
type ActionHook = dyn Fn(&Action, &Value) + Send + Sync;
type ActionErrorHook = dyn Fn(&Action, &Value, &ActionError) + Send + Sync;

/// Callbacks run around every dispatched action.
///
/// `before` runs synchronously before any handler starts; `after` runs once
/// every handler has resolved; `error` runs if any handler failed.
#[derive(Clone, Default)]
pub struct ActionSubscriber {
    pub(crate) before: Option<Arc<ActionHook>>,
    pub(crate) after: Option<Arc<ActionHook>>,
    pub(crate) error: Option<Arc<ActionErrorHook>>,
}

impl ActionSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain-function subscriber: runs before each action.
    pub fn before<F>(f: F) -> Self
    where
        F: Fn(&Action, &Value) + Send + Sync + 'static,
    {
        Self::new().on_before(f)
    }

    pub fn on_before<F>(mut self, f: F) -> Self
    where
        F: Fn(&Action, &Value) + Send + Sync + 'static,
    {
        self.before = Some(Arc::new(f));
        self
    }

    pub fn on_after<F>(mut self, f: F) -> Self
    where
        F: Fn(&Action, &Value) + Send + Sync + 'static,
    {
        self.after = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&Action, &Value, &ActionError) + Send + Sync + 'static,
    {
        self.error = Some(Arc::new(f));
        self
    }
}

/// Options for `subscribe_with` / `subscribe_action_with`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Run this subscriber before those already registered.
    pub prepend: bool,
}

/// Ordered subscriber list with identity-based removal.
pub(crate) struct SubscriberList<T: ?Sized> {
    next_id: AtomicUsize,
    entries: Mutex<Vec<(usize, Arc<T>)>>,
}

impl<T: ?Sized + Send + Sync + 'static> SubscriberList<T> {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicUsize::new(0),
            entries: Mutex::new(Vec::new()),
        })
    }

    pub(crate) fn add(self: &Arc<Self>, entry: Arc<T>, options: SubscribeOptions) -> Unsubscribe {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        {
            let mut entries = self.entries.lock();
            if options.prepend {
                entries.insert(0, (id, entry));
            } else {
                entries.push((id, entry));
            }
        }

        let list: Weak<Self> = Arc::downgrade(self);
        Unsubscribe {
            remove: Arc::new(move || {
                if let Some(list) = list.upgrade() {
                    list.entries.lock().retain(|(entry_id, _)| *entry_id != id);
                }
            }),
        }
    }

    /// Point-in-time copy; removals during iteration don't affect it.
    pub(crate) fn snapshot(&self) -> Vec<Arc<T>> {
        self.entries
            .lock()
            .iter()
            .map(|(_, entry)| Arc::clone(entry))
            .collect()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Handle returned by `subscribe` and `subscribe_action`.
///
/// Unlike a watch guard, dropping it keeps the subscription alive; call
/// [`unsubscribe`](Unsubscribe::unsubscribe) to remove it. Calling it more
/// than once is harmless.
#[derive(Clone)]
pub struct Unsubscribe {
    remove: Arc<dyn Fn() + Send + Sync>,
}

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        (self.remove)();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    type Callback = dyn Fn() -> u8 + Send + Sync;

    fn ids(list: &SubscriberList<Callback>) -> Vec<u8> {
        list.snapshot().iter().map(|f| f()).collect()
    }

    #[test]
    fn prepend_puts_subscriber_first() {
        let list = SubscriberList::<Callback>::new();
        list.add(Arc::new(|| 1), SubscribeOptions::default());
        list.add(Arc::new(|| 2), SubscribeOptions { prepend: true });
        assert_eq!(ids(&list), [2, 1]);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let list = SubscriberList::<Callback>::new();
        let first = list.add(Arc::new(|| 1), SubscribeOptions::default());
        list.add(Arc::new(|| 2), SubscribeOptions::default());

        first.unsubscribe();
        first.unsubscribe();
        assert_eq!(ids(&list), [2]);
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn snapshot_is_unaffected_by_removal() {
        let list = SubscriberList::<Callback>::new();
        let handle = list.add(Arc::new(|| 1), SubscribeOptions::default());
        let snapshot = list.snapshot();
        handle.unsubscribe();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn object_style_mutation_deserializes() {
        let mutation: Mutation =
            serde_json::from_value(json!({ "type": "cart/add", "payload": { "id": 3 } })).unwrap();
        assert_eq!(mutation, Mutation::new("cart/add", json!({ "id": 3 })));

        let action: Action = serde_json::from_value(json!({ "type": "refresh" })).unwrap();
        assert_eq!(action.payload, Value::Null);
    }
}
