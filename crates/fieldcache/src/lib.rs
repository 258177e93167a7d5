//! A per-field TTL cache over partial data sources.
//!
//! Different providers often return different subsets of an entity's data. A
//! [`FieldCache`] tracks freshness per field, fetches only what is missing or expired,
//! merges results in place, notifies field subscribers and snapshots entries to disk for
//! warm restarts.
//!
//! Entity types declare their fields through a [`FieldMap`] built once per type, and
//! their field identifiers with the [`field_tags!`] macro.

#[macro_use]
pub mod macros;

#[macro_use]
pub mod metrics;

pub mod clock;
pub mod config;
pub mod disk;
pub mod entry;
pub mod error;
pub mod field;
pub mod logging;
pub mod service;
pub mod subscriptions;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheOptions, Config};
pub use disk::{BinaryCodec, TypeHandlers};
pub use entry::{CachedEntity, EntityRef};
pub use error::{CacheError, CacheResult};
pub use field::{CacheEntity, FieldMap, FieldMapBuilder, FieldSet, FieldSource, FieldTag};
pub use service::{CacheKey, CacheStats, FieldCache, FieldCacheBuilder, Fetcher};
pub use subscriptions::FieldHandler;
pub use value::{FieldValue, Release};
