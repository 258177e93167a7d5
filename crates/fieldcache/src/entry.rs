use std::fmt;
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::clock::{Clock, add_duration};
use crate::field::{CacheEntity, FieldSet, FieldTag};

/// A shared handle to the single live entity of a cache key.
///
/// The entity is mutated in place by every update, so all holders of a handle observe the
/// latest state. Never hold a read guard across a call back into the cache for the same
/// key.
pub struct EntityRef<E>(Arc<RwLock<E>>);

impl<E> EntityRef<E> {
    pub(crate) fn new(entity: E) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Locks the entity for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, E> {
        self.0.read().unwrap()
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, E> {
        self.0.write().unwrap()
    }

    /// Runs `f` with a read lock on the entity.
    pub fn with<R>(&self, f: impl FnOnce(&E) -> R) -> R {
        f(&self.read())
    }

    /// Returns `true` if both handles point to the same live entity.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<E: Clone> EntityRef<E> {
    /// Clones the current state of the entity.
    pub fn snapshot(&self) -> E {
        self.read().clone()
    }
}

impl<E> Clone for EntityRef<E> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<E: fmt::Debug> fmt::Debug for EntityRef<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(entity) => f.debug_tuple("EntityRef").field(&*entity).finish(),
            Err(_) => f.write_str("EntityRef(<locked>)"),
        }
    }
}

/// Fetch bookkeeping of a single entity, indexed by tag ordinal.
#[derive(Debug, Clone)]
pub(crate) struct FieldState<F: FieldTag> {
    pub fetched: FieldSet<F>,
    pub expirations: Vec<Option<DateTime<Utc>>>,
}

impl<F: FieldTag> FieldState<F> {
    fn new() -> Self {
        Self {
            fetched: FieldSet::new(),
            expirations: vec![None; F::ALL.len()],
        }
    }

    fn is_fresh(&self, tag: F, now: DateTime<Utc>) -> bool {
        self.fetched.contains(tag)
            && self.expirations[tag.index()].is_some_and(|expires_at| now <= expires_at)
    }
}

/// The per-key cache container.
///
/// Holds the live entity plus, for every field, whether it was ever fetched and when it
/// expires. A field is fresh iff it was fetched and the clock has not yet passed its
/// expiry. Fetches that come back empty still count as fetched, so that permanently
/// missing data is not re-requested before its TTL runs out.
pub struct CachedEntity<E: CacheEntity> {
    entity: EntityRef<E>,
    state: Mutex<FieldState<E::Field>>,
    /// Serializes fetches for this key when fetch coalescing is enabled.
    fetch_lock: tokio::sync::Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl<E: CacheEntity> CachedEntity<E> {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entity: EntityRef::new(E::default()),
            state: Mutex::new(FieldState::new()),
            fetch_lock: tokio::sync::Mutex::new(()),
            clock,
        }
    }

    /// The shared handle to the live entity.
    pub fn entity(&self) -> &EntityRef<E> {
        &self.entity
    }

    /// Returns `true` once a fetch for `tag` has completed, including empty results.
    pub fn is_field_fetched(&self, tag: E::Field) -> bool {
        self.state.lock().unwrap().fetched.contains(tag)
    }

    /// Returns `true` if `tag` has no recorded expiry, or the expiry has passed.
    pub fn is_field_expired(&self, tag: E::Field) -> bool {
        let now = self.clock.now();
        let state = self.state.lock().unwrap();
        match state.expirations[tag.index()] {
            Some(expires_at) => now > expires_at,
            None => true,
        }
    }

    /// Marks `tags` as fetched, expiring `ttl` from now.
    pub fn mark_fetched(&self, tags: &[E::Field], ttl: Duration) {
        let expires_at = add_duration(self.clock.now(), ttl);
        let mut state = self.state.lock().unwrap();
        for &tag in tags {
            state.fetched.insert(tag);
            state.expirations[tag.index()] = Some(expires_at);
        }
    }

    /// Marks `tag` as fetched with an absolute expiry.
    pub fn mark_fetched_until(&self, tag: E::Field, expires_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        state.fetched.insert(tag);
        state.expirations[tag.index()] = Some(expires_at);
    }

    /// Returns the requested tags that were never fetched or have expired.
    ///
    /// The result keeps the request order and contains no duplicates.
    pub fn missing_fields(&self, requested: &[E::Field]) -> Vec<E::Field> {
        let now = self.clock.now();
        let state = self.state.lock().unwrap();
        let mut seen = FieldSet::new();
        requested
            .iter()
            .copied()
            .filter(|&tag| seen.insert(tag) && !state.is_fresh(tag, now))
            .collect()
    }

    /// The absolute expiry of `tag`, if it was ever fetched.
    pub fn field_expiration(&self, tag: E::Field) -> Option<DateTime<Utc>> {
        self.state.lock().unwrap().expirations[tag.index()]
    }

    /// The set of fields that were fetched at some point.
    pub fn fetched_fields(&self) -> FieldSet<E::Field> {
        self.state.lock().unwrap().fetched
    }

    pub(crate) fn field_state(&self) -> FieldState<E::Field> {
        self.state.lock().unwrap().clone()
    }

    pub(crate) async fn lock_fetch(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.fetch_lock.lock().await
    }
}

impl<E: CacheEntity> fmt::Debug for CachedEntity<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("CachedEntity")
            .field("fetched", &state.fetched)
            .finish_non_exhaustive()
    }
}
