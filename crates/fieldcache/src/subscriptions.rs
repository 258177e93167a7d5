use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::entry::EntityRef;
use crate::field::{CacheEntity, FieldTag};

/// A callback invoked with the key and the live entity after a field changed.
///
/// Handlers are identified by their [`Arc`], so unsubscribing needs a clone of the very
/// same handler that was subscribed.
pub type FieldHandler<K, E> = Arc<dyn Fn(&K, &EntityRef<E>) + Send + Sync>;

/// Per key and field lists of change handlers.
pub struct SubscriptionRegistry<K, E: CacheEntity> {
    handlers: Mutex<HashMap<K, HashMap<E::Field, Vec<FieldHandler<K, E>>>>>,
}

impl<K: Clone + Eq + Hash, E: CacheEntity> SubscriptionRegistry<K, E> {
    pub fn new() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Appends `handler` to the handler list of every field in `fields`.
    ///
    /// Subscribing the same handler twice makes it fire twice.
    pub fn subscribe(&self, key: &K, handler: &FieldHandler<K, E>, fields: &[E::Field]) {
        let mut handlers = self.handlers.lock().unwrap();
        let by_field = handlers.entry(key.clone()).or_default();
        for &field in fields {
            by_field.entry(field).or_default().push(Arc::clone(handler));
        }
    }

    /// Removes the most recently added occurrence of `handler` from every field in `fields`.
    ///
    /// Handlers that were never subscribed are ignored.
    pub fn unsubscribe(&self, key: &K, handler: &FieldHandler<K, E>, fields: &[E::Field]) {
        let mut handlers = self.handlers.lock().unwrap();
        let Some(by_field) = handlers.get_mut(key) else {
            return;
        };

        for field in fields {
            let Some(list) = by_field.get_mut(field) else {
                continue;
            };
            if let Some(pos) = list.iter().rposition(|h| Arc::ptr_eq(h, handler)) {
                list.remove(pos);
            }
            if list.is_empty() {
                by_field.remove(field);
            }
        }

        if by_field.is_empty() {
            handlers.remove(key);
        }
    }

    /// Invokes all handlers of `field` on `key`, in subscription order.
    ///
    /// The handler list is copied before invoking, so handlers may subscribe or unsubscribe
    /// without deadlocking.
    pub fn notify_field_changed(&self, key: &K, field: E::Field, entity: &EntityRef<E>) {
        let handlers: Vec<_> = {
            let handlers = self.handlers.lock().unwrap();
            match handlers.get(key).and_then(|by_field| by_field.get(&field)) {
                Some(list) => list.clone(),
                None => return,
            }
        };

        tracing::trace!(field = field.name(), handlers = handlers.len(), "notifying");
        for handler in handlers {
            handler(key, entity);
        }
    }

    /// The total number of registered handlers, counted per field.
    pub fn len(&self) -> usize {
        let handlers = self.handlers.lock().unwrap();
        handlers
            .values()
            .flat_map(|by_field| by_field.values())
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.lock().unwrap().is_empty()
    }
}

impl<K: Clone + Eq + Hash, E: CacheEntity> Default for SubscriptionRegistry<K, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K, E: CacheEntity> fmt::Debug for SubscriptionRegistry<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handlers = self.handlers.lock().unwrap();
        f.debug_struct("SubscriptionRegistry")
            .field("keys", &handlers.len())
            .finish()
    }
}
