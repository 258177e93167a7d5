//! The generic field cache service.
//!
//! A [`FieldCache`] keeps one live entity per key in memory and tracks, per field, whether
//! it was fetched and until when it stays fresh. Callers ask for a set of fields and the
//! cache fetches exactly the missing or expired ones through its [`Fetcher`], merging the
//! result field by field into the live entity.
//!
//! Changed keys are marked dirty and written to disk by a periodic background sync. On
//! construction, a background task restores all persisted fields that are still fresh.

use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::io;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tokio::sync::{Semaphore, watch};
use tokio::time::{Instant, MissedTickBehavior};

use crate::clock::{Clock, SystemClock};
use crate::config::CacheOptions;
use crate::disk::{DiskStore, LoadedSnapshot, capture};
use crate::entry::{CachedEntity, EntityRef};
use crate::error::{CacheError, CacheResult};
use crate::field::{CacheEntity, FieldMap, FieldSet, FieldSource, FieldTag};
use crate::subscriptions::{FieldHandler, SubscriptionRegistry};

/// A key of a [`FieldCache`].
///
/// Keys are persisted through their [`Display`](fmt::Display) representation and parsed
/// back with [`FromStr`], so the two have to round-trip.
pub trait CacheKey:
    Clone + Eq + Hash + fmt::Display + fmt::Debug + FromStr + Send + Sync + 'static
{
}

impl<T> CacheKey for T where
    T: Clone + Eq + Hash + fmt::Display + fmt::Debug + FromStr + Send + Sync + 'static
{
}

/// Loads the given fields of an entity from its provider.
///
/// Returning `Ok(None)` means the provider has no data for these fields, which is cached
/// like any other result. Closures `Fn(K, Vec<Field>) -> impl Future` implement this trait.
pub trait Fetcher<K, E: CacheEntity>: Send + Sync + 'static {
    fn fetch<'a>(
        &'a self,
        key: &'a K,
        fields: &'a [E::Field],
    ) -> BoxFuture<'a, anyhow::Result<Option<E>>>;
}

impl<K, E, F, Fut> Fetcher<K, E> for F
where
    K: Clone + Send + Sync + 'static,
    E: CacheEntity,
    F: Fn(K, Vec<E::Field>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Option<E>>> + Send + 'static,
{
    fn fetch<'a>(
        &'a self,
        key: &'a K,
        fields: &'a [E::Field],
    ) -> BoxFuture<'a, anyhow::Result<Option<E>>> {
        Box::pin(self(key.clone(), fields.to_vec()))
    }
}

/// A point-in-time overview of a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of keys held in memory.
    pub entries: usize,
    /// Number of keys waiting for the next disk sync.
    pub dirty_keys: usize,
    /// Number of registered field handlers.
    pub subscriptions: usize,
}

struct Inner<K, E: CacheEntity> {
    options: CacheOptions,
    entries: moka::sync::Cache<K, Arc<CachedEntity<E>>>,
    dirty: Mutex<HashSet<K>>,
    subscriptions: SubscriptionRegistry<K, E>,
    /// Mergeable fields per source type.
    partial_maps: Mutex<HashMap<TypeId, FieldSet<E::Field>>>,
    fetcher: Option<Arc<dyn Fetcher<K, E>>>,
    disk: Option<DiskStore>,
    /// Serializes all disk access.
    disk_lock: Semaphore,
    clock: Arc<dyn Clock>,
    loaded: watch::Sender<bool>,
}

/// A per-field TTL cache of entities of type `E`.
///
/// Cloning is cheap and yields a handle to the same cache.
pub struct FieldCache<K: CacheKey, E: CacheEntity> {
    inner: Arc<Inner<K, E>>,
}

impl<K: CacheKey, E: CacheEntity> Clone for FieldCache<K, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, E: CacheEntity> fmt::Debug for FieldCache<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldCache")
            .field("name", &self.inner.options.name)
            .field("disk", &self.inner.disk.as_ref().map(DiskStore::path))
            .finish_non_exhaustive()
    }
}

/// Builds a [`FieldCache`].
pub struct FieldCacheBuilder<K, E: CacheEntity> {
    options: CacheOptions,
    fetcher: Option<Arc<dyn Fetcher<K, E>>>,
    clock: Arc<dyn Clock>,
}

impl<K: CacheKey, E: CacheEntity> FieldCacheBuilder<K, E> {
    /// Sets the fetcher used to fill missing fields.
    ///
    /// Without a fetcher, the cache only serves what was stored through
    /// [`update`](FieldCache::update) or restored from disk.
    pub fn fetcher(mut self, fetcher: impl Fetcher<K, E>) -> Self {
        let fetcher: Arc<dyn Fetcher<K, E>> = Arc::new(fetcher);
        self.fetcher = Some(fetcher);
        self
    }

    /// Replaces the system clock, for example with a
    /// [`ManualClock`](crate::clock::ManualClock) in tests.
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Creates the cache and starts loading persisted entries.
    ///
    /// Inside a tokio runtime, the disk load and the periodic sync run as background tasks
    /// and [`FieldCache::ready`] resolves once the load is done. Outside of a runtime, the
    /// load happens right here and there is no periodic sync, so changes are only persisted
    /// through [`FieldCache::flush`].
    pub fn build(self) -> FieldCache<K, E> {
        let Self {
            options,
            fetcher,
            clock,
        } = self;

        let disk = if options.enable_disk_cache {
            let path = options.resolved_disk_path();
            match DiskStore::open(path.clone(), options.type_handlers.clone()) {
                Ok(store) => Some(store),
                Err(error) => {
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        path = %path.display(),
                        "failed to create cache directory, disk cache disabled",
                    );
                    None
                }
            }
        } else {
            None
        };

        let (loaded, _) = watch::channel(disk.is_none());
        let cache = FieldCache {
            inner: Arc::new(Inner {
                entries: moka::sync::Cache::builder().name(&options.name).build(),
                options,
                dirty: Mutex::new(HashSet::new()),
                subscriptions: SubscriptionRegistry::new(),
                partial_maps: Mutex::new(HashMap::new()),
                fetcher,
                disk,
                disk_lock: Semaphore::new(1),
                clock,
                loaded,
            }),
        };

        if cache.inner.disk.is_some() {
            match Handle::try_current() {
                Ok(handle) => {
                    let loader = cache.clone();
                    handle.spawn(async move { loader.load_from_disk().await });
                    spawn_sync_task(&handle, &cache.inner);
                }
                Err(_) => {
                    tracing::warn!(
                        cache = cache.inner.options.name.as_str(),
                        "no tokio runtime, loading snapshots synchronously and disabling the periodic sync",
                    );
                    cache.load_blocking();
                }
            }
        }

        cache
    }
}

fn spawn_sync_task<K: CacheKey, E: CacheEntity>(handle: &Handle, inner: &Arc<Inner<K, E>>) {
    let weak: Weak<Inner<K, E>> = Arc::downgrade(inner);
    let period = inner.options.sync_interval();

    handle.spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let cache = FieldCache { inner };
            if let Err(error) = cache.flush().await {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    cache = cache.inner.options.name.as_str(),
                    "periodic disk sync failed",
                );
            }
        }
    });
}

impl<K: CacheKey, E: CacheEntity> FieldCache<K, E> {
    pub fn builder(options: CacheOptions) -> FieldCacheBuilder<K, E> {
        FieldCacheBuilder {
            options,
            fetcher: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Creates a cache with the given fetcher and the system clock.
    pub fn new(options: CacheOptions, fetcher: impl Fetcher<K, E>) -> Self {
        Self::builder(options).fetcher(fetcher).build()
    }

    pub fn options(&self) -> &CacheOptions {
        &self.inner.options
    }

    /// The snapshot directory, if the disk cache is active.
    pub fn disk_path(&self) -> Option<&Path> {
        self.inner.disk.as_ref().map(DiskStore::path)
    }

    /// Waits until the initial disk load has finished.
    pub async fn ready(&self) {
        let mut loaded = self.inner.loaded.subscribe();
        // the sender lives in `self`, so this cannot fail
        let _ = loaded.wait_for(|loaded| *loaded).await;
    }

    fn entry(&self, key: &K) -> Arc<CachedEntity<E>> {
        self.inner
            .entries
            .get_with(key.clone(), || Arc::new(CachedEntity::new(Arc::clone(&self.inner.clock))))
    }

    fn mark_dirty(&self, key: &K) {
        if self.inner.disk.is_some() {
            self.inner.dirty.lock().unwrap().insert(key.clone());
        }
    }

    /// Returns the entity of `key`, fetching the requested fields that are missing or
    /// expired.
    ///
    /// All missing fields are requested from the fetcher in a single call. With
    /// `force_fetch`, all requested fields are fetched regardless of their freshness.
    /// Fields the entity type does not declare are ignored.
    pub async fn get_or_fetch_fields(
        &self,
        key: &K,
        fields: &[E::Field],
        force_fetch: bool,
    ) -> CacheResult<EntityRef<E>> {
        let name = self.inner.options.name.as_str();
        metric!(counter("fieldcache.access") += 1, "cache" => name);

        let cached = self.entry(key);
        let _fetch_guard = if self.inner.options.coalesce_fetches {
            Some(cached.lock_fetch().await)
        } else {
            None
        };

        let Some(fetcher) = &self.inner.fetcher else {
            return Ok(cached.entity().clone());
        };

        let map = E::field_map();
        let mut requested: Vec<_> = fields.iter().copied().filter(|&f| map.contains(f)).collect();
        let gap = if force_fetch {
            let mut seen = FieldSet::new();
            requested.retain(|&field| seen.insert(field));
            requested
        } else {
            cached.missing_fields(&requested)
        };

        if gap.is_empty() {
            return Ok(cached.entity().clone());
        }

        tracing::debug!(cache = name, key = %key, fields = ?gap, "fetching fields");
        metric!(counter("fieldcache.fetch") += 1, "cache" => name);
        metric!(histogram("fieldcache.fetch.fields") = gap.len() as u64, "cache" => name);

        match fetcher.fetch(key, &gap).await.map_err(CacheError::Fetch)? {
            Some(fetched) => {
                let merged = self.merge_fields(key, &cached, &fetched, map, map.tags(), &gap);
                self.release_unmerged(&cached, fetched, &gap);
                merged?;
            }
            None => {
                tracing::debug!(cache = name, key = %key, "fetcher returned no data");
                metric!(counter("fieldcache.fetch.negative") += 1, "cache" => name);
                {
                    let _entity = cached.entity().write();
                    cached.mark_fetched(&gap, self.inner.options.default_ttl);
                }
                self.mark_dirty(key);
            }
        }

        Ok(cached.entity().clone())
    }

    /// Returns the entity of `key` if it is held in memory, without fetching anything.
    pub fn get_without_fetching(&self, key: &K) -> Option<EntityRef<E>> {
        self.inner
            .entries
            .get(key)
            .map(|cached| cached.entity().clone())
    }

    /// Returns the cache entry of `key` with its fetch bookkeeping.
    pub fn cached_entity(&self, key: &K) -> Option<Arc<CachedEntity<E>>> {
        self.inner.entries.get(key)
    }

    /// Copies `fields` from `entity` into the cached entity of `key`.
    ///
    /// Every copied field is marked fetched with the default TTL, even if the new value is
    /// empty. `entity` must not be a guard of the cached entity itself.
    pub fn update(&self, key: &K, entity: &E, fields: &[E::Field]) -> CacheResult<()> {
        let cached = self.entry(key);
        let map = E::field_map();
        self.merge_fields(key, &cached, entity, map, map.tags(), fields)
    }

    /// Copies `fields` from a partial source into the cached entity of `key`.
    ///
    /// Only fields that `S` declares with the same value type as `E` are copied. All other
    /// requested fields are skipped and keep their previous value and fetch state.
    pub fn update_partial<S>(&self, key: &K, source: &S, fields: &[E::Field]) -> CacheResult<()>
    where
        S: FieldSource<Field = E::Field>,
    {
        let cached = self.entry(key);
        let compatible = self.partial_map::<S>();
        self.merge_fields(key, &cached, source, S::field_map(), compatible, fields)
    }

    fn partial_map<S>(&self) -> FieldSet<E::Field>
    where
        S: FieldSource<Field = E::Field>,
    {
        let mut maps = self.inner.partial_maps.lock().unwrap();
        *maps.entry(TypeId::of::<S>()).or_insert_with(|| {
            let compatible = S::field_map().compatible_with(E::field_map());
            tracing::debug!(
                source = std::any::type_name::<S>(),
                fields = ?compatible,
                "built partial field map",
            );
            compatible
        })
    }

    fn merge_fields<S>(
        &self,
        key: &K,
        cached: &CachedEntity<E>,
        source: &S,
        source_map: &FieldMap<S, E::Field>,
        compatible: FieldSet<E::Field>,
        fields: &[E::Field],
    ) -> CacheResult<()>
    where
        S: 'static,
    {
        let target_map = E::field_map();
        let mut seen = FieldSet::new();
        let mut applied = Vec::with_capacity(fields.len());

        for &field in fields {
            if !seen.insert(field) || !compatible.contains(field) {
                continue;
            }
            let (Some(from), Some(to)) = (source_map.get(field), target_map.get(field)) else {
                continue;
            };

            let value = from.clone_value(source);
            // the disk load checks the fetched state under the same guard
            let superseded = {
                let mut entity = cached.entity().write();
                let superseded = to.replace(&mut entity, value)?;
                cached.mark_fetched(&[field], self.inner.options.default_ttl);
                superseded
            };
            if let Some(old) = superseded {
                to.release_value(old);
            }

            tracing::trace!(key = %key, field = field.name(), "field updated");
            self.inner
                .subscriptions
                .notify_field_changed(key, field, cached.entity());
            applied.push(field);
        }

        if !applied.is_empty() {
            self.mark_dirty(key);
        }
        Ok(())
    }

    /// Releases the values of a fetch result that were not merged into the cache.
    fn release_unmerged(&self, cached: &CachedEntity<E>, mut fetched: E, merged: &[E::Field]) {
        let merged: FieldSet<E::Field> = merged.iter().copied().collect();
        for descriptor in E::field_map().iter() {
            if !descriptor.needs_release() || merged.contains(descriptor.tag()) {
                continue;
            }
            // the fetcher may hand out a value the cache already holds
            if descriptor.is_same_value(&cached.entity().read(), &fetched) {
                continue;
            }
            if let Some(value) = descriptor.take(&mut fetched) {
                descriptor.release_value(value);
            }
        }
    }

    /// Registers `handler` for changes of `fields` on `key`.
    pub fn subscribe_to_field_change(
        &self,
        key: &K,
        handler: &FieldHandler<K, E>,
        fields: &[E::Field],
    ) {
        self.inner.subscriptions.subscribe(key, handler, fields);
    }

    /// Removes one registration of `handler` from each of `fields` on `key`.
    pub fn unsubscribe_from_field_change(
        &self,
        key: &K,
        handler: &FieldHandler<K, E>,
        fields: &[E::Field],
    ) {
        self.inner.subscriptions.unsubscribe(key, handler, fields);
    }

    /// Writes all dirty keys to disk right away.
    ///
    /// Returns the number of written snapshots. Keys that fail to be written stay dirty and
    /// are retried by the next sync, and the first failure is returned.
    #[tracing::instrument(skip_all, fields(cache = %self.inner.options.name))]
    pub async fn flush(&self) -> CacheResult<usize> {
        let Some(disk) = &self.inner.disk else {
            return Ok(0);
        };
        let _permit = self
            .inner
            .disk_lock
            .acquire()
            .await
            .map_err(io::Error::other)?;

        let sync_start = Instant::now();
        let keys: Vec<K> = std::mem::take(&mut *self.inner.dirty.lock().unwrap())
            .into_iter()
            .collect();
        if keys.is_empty() {
            return Ok(0);
        }

        let mut first_error = None;
        let mut failed = Vec::new();
        let mut pending = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(cached) = self.inner.entries.get(&key) else {
                continue;
            };
            match capture(key.to_string(), &cached, disk.handlers()) {
                Ok(snapshot) => pending.push((key, snapshot)),
                Err(error) => {
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        key = %key,
                        "failed to serialize cache entry",
                    );
                    failed.push(key);
                    first_error.get_or_insert(error);
                }
            }
        }

        let store = disk.clone();
        let results = tokio::task::spawn_blocking(move || {
            pending
                .into_iter()
                .map(|(key, snapshot)| {
                    let result = store.write::<E::Field>(&snapshot);
                    (key, result)
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(io::Error::other)?;

        let mut written = 0;
        for (key, result) in results {
            match result {
                Ok(()) => written += 1,
                Err(error) => {
                    tracing::error!(
                        error = &error as &dyn std::error::Error,
                        key = %key,
                        "failed to write cache snapshot",
                    );
                    failed.push(key);
                    first_error.get_or_insert(error);
                }
            }
        }

        let name = self.inner.options.name.as_str();
        metric!(counter("fieldcache.file.write") += written as i64, "cache" => name);
        tracing::debug!(written, failed = failed.len(), "disk sync done");

        let dirty_keys = {
            let mut dirty = self.inner.dirty.lock().unwrap();
            dirty.extend(failed);
            dirty.len()
        };
        metric!(gauge("fieldcache.dirty_keys") = dirty_keys as u64, "cache" => name);
        metric!(timer("fieldcache.file.sync.duration") = sync_start.elapsed(), "cache" => name);

        match first_error {
            Some(error) => Err(error),
            None => Ok(written),
        }
    }

    async fn load_from_disk(&self) {
        if let Some(disk) = &self.inner.disk {
            match self.inner.disk_lock.acquire().await {
                Ok(_permit) => {
                    let store = disk.clone();
                    let now = self.inner.clock.now();
                    match tokio::task::spawn_blocking(move || store.load_all::<E>(now)).await {
                        Ok(Ok(snapshots)) => self.apply_snapshots(snapshots),
                        Ok(Err(error)) => log_load_error(&error),
                        Err(error) => log_load_error(&error),
                    }
                }
                Err(error) => log_load_error(&error),
            }
        }
        self.inner.loaded.send_replace(true);
    }

    fn load_blocking(&self) {
        if let Some(disk) = &self.inner.disk {
            match disk.load_all::<E>(self.inner.clock.now()) {
                Ok(snapshots) => self.apply_snapshots(snapshots),
                Err(error) => log_load_error(&error),
            }
        }
        self.inner.loaded.send_replace(true);
    }

    /// Merges restored fields into memory.
    ///
    /// Fields that were fetched in the meantime win over the snapshot, and restored keys
    /// are not marked dirty.
    fn apply_snapshots(&self, snapshots: Vec<LoadedSnapshot<E::Field>>) {
        let map = E::field_map();
        let name = self.inner.options.name.as_str();
        let mut loaded = 0i64;

        for snapshot in snapshots {
            if snapshot.fields.is_empty() {
                continue;
            }
            let Ok(key) = snapshot.key.parse::<K>() else {
                tracing::warn!(key = %snapshot.key, "skipping snapshot with unparsable key");
                continue;
            };
            let cached = self.entry(&key);
            let mut applied = Vec::new();
            let mut superseded = Vec::new();

            {
                let mut entity = cached.entity().write();
                for field in snapshot.fields {
                    if cached.is_field_fetched(field.tag) {
                        continue;
                    }
                    let Some(descriptor) = map.get(field.tag) else {
                        continue;
                    };
                    match descriptor.replace(&mut entity, field.value) {
                        Ok(old) => {
                            superseded.extend(old.map(|old| (descriptor, old)));
                            cached.mark_fetched_until(field.tag, field.expires_at);
                            applied.push(field.tag);
                        }
                        Err(error) => {
                            tracing::warn!(
                                error = &error as &dyn std::error::Error,
                                key = %key,
                                "skipping restored field",
                            );
                        }
                    }
                }
            }

            for (descriptor, old) in superseded {
                descriptor.release_value(old);
            }
            for field in applied {
                self.inner
                    .subscriptions
                    .notify_field_changed(&key, field, cached.entity());
            }
            loaded += 1;
        }

        metric!(counter("fieldcache.file.load") += loaded, "cache" => name);
        tracing::debug!(cache = name, loaded, "restored snapshots from disk");
    }

    /// Drops all entries from memory and releases their releasable field values.
    ///
    /// Handles obtained earlier stay valid, but their releasable fields are emptied.
    /// Pending disk writes are discarded, the files on disk stay untouched.
    pub fn clear_memory(&self) {
        let releasable: Vec<_> = E::field_map()
            .iter()
            .filter(|descriptor| descriptor.needs_release())
            .collect();

        for (_, cached) in self.inner.entries.iter() {
            let taken: Vec<_> = {
                let mut entity = cached.entity().write();
                releasable
                    .iter()
                    .filter_map(|descriptor| {
                        descriptor
                            .take(&mut entity)
                            .map(|value| (*descriptor, value))
                    })
                    .collect()
            };
            for (descriptor, value) in taken {
                descriptor.release_value(value);
            }
        }

        self.inner.entries.invalidate_all();
        self.inner.entries.run_pending_tasks();
        self.inner.dirty.lock().unwrap().clear();
    }

    /// Clears memory like [`clear_memory`](Self::clear_memory) and deletes all snapshots.
    pub async fn clear_all(&self) -> CacheResult<()> {
        self.clear_memory();
        if let Some(disk) = &self.inner.disk {
            let _permit = self
                .inner
                .disk_lock
                .acquire()
                .await
                .map_err(io::Error::other)?;
            let store = disk.clone();
            tokio::task::spawn_blocking(move || store.clear())
                .await
                .map_err(io::Error::other)??;
        }
        Ok(())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.inner.entries.iter().count(),
            dirty_keys: self.inner.dirty.lock().unwrap().len(),
            subscriptions: self.inner.subscriptions.len(),
        }
    }
}

fn log_load_error(error: &(dyn std::error::Error + 'static)) {
    tracing::error!(error, "failed to load cache snapshots");
}
