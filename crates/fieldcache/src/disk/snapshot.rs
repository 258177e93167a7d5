//! Conversion between live cache entries and snapshot envelopes.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use chrono::{DateTime, Utc};

use super::envelope::{SnapshotEntry, SnapshotFile};
use super::handlers::TypeHandlers;
use super::key::{self, SIDECAR_PREFIX};
use crate::entry::CachedEntity;
use crate::error::{CacheError, CacheResult};
use crate::field::{BoxedValue, CacheEntity, FieldDescriptor, FieldTag};

/// A serialized entry that is ready to be written to disk.
#[derive(Debug)]
pub(crate) struct PendingSnapshot {
    pub stem: String,
    pub file: SnapshotFile,
    /// Sidecar file names and their contents.
    pub sidecars: Vec<(String, Vec<u8>)>,
}

/// Serializes the persistable fields of `cached`.
///
/// Only fetched fields are written. Memory-only fields are skipped, and so are values
/// without a JSON codec or a binary handler. Negative results are written as `null`.
pub(crate) fn capture<E: CacheEntity>(
    key: String,
    cached: &CachedEntity<E>,
    handlers: &TypeHandlers,
) -> CacheResult<PendingSnapshot> {
    let stem = key::file_stem(&key);
    let state = cached.field_state();
    let mut entry = SnapshotEntry::default();
    let mut sidecars = Vec::new();

    let entity = cached.entity().read();
    for descriptor in E::field_map().iter() {
        let tag = descriptor.tag();
        if descriptor.is_memory_only() || !state.fetched.contains(tag) {
            continue;
        }
        let Some(expires_at) = state.expirations[tag.index()] else {
            continue;
        };

        let value = match descriptor.value_ref(&entity) {
            None => serde_json::Value::Null,
            Some(value) => match handlers.get(descriptor.value_type()) {
                Some(handler) => {
                    let mut bytes = Vec::new();
                    handler
                        .serialize(value, &mut bytes)
                        .map_err(|source| CacheError::Codec {
                            field: tag.name(),
                            source,
                        })?;
                    let name = key::sidecar_name(&stem, tag.name());
                    let reference = format!("{SIDECAR_PREFIX}{name}");
                    sidecars.push((name, bytes));
                    serde_json::Value::String(reference)
                }
                None => match descriptor.to_json(&entity) {
                    Some(json) => json?,
                    None => {
                        tracing::trace!(field = tag.name(), "no codec for field, not persisted");
                        continue;
                    }
                },
            },
        };

        let name = tag.name().to_owned();
        entry.data.insert(name.clone(), value);
        entry.field_expirations.insert(name.clone(), expires_at);
        entry.fetched_fields.insert(name);
    }

    Ok(PendingSnapshot {
        stem,
        file: SnapshotFile { key, entry },
        sidecars,
    })
}

/// A field value restored from disk, together with its original expiry.
pub(crate) struct RestoredField<F> {
    pub tag: F,
    pub value: Option<BoxedValue>,
    pub expires_at: DateTime<Utc>,
}

/// Rebuilds the fields of a snapshot that are still fresh at `now`.
///
/// Fields that are unknown, memory-only, expired or lack an expiry are dropped. Any field
/// that fails to decode fails the whole snapshot.
pub(crate) fn restore<E: CacheEntity>(
    dir: &Path,
    entry: &SnapshotEntry,
    handlers: &TypeHandlers,
    now: DateTime<Utc>,
) -> CacheResult<Vec<RestoredField<E::Field>>> {
    let map = E::field_map();
    let mut restored = Vec::new();

    for name in &entry.fetched_fields {
        let Some(tag) = E::Field::from_name(name) else {
            tracing::debug!(field = name.as_str(), "unknown field in snapshot");
            continue;
        };
        let Some(descriptor) = map.get(tag).filter(|d| !d.is_memory_only()) else {
            continue;
        };
        let Some(&expires_at) = entry.field_expirations.get(name) else {
            continue;
        };
        if expires_at < now {
            continue;
        }

        let json = entry
            .data
            .get(name)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        let value = decode_value(dir, descriptor, json, handlers)?;

        restored.push(RestoredField {
            tag,
            value,
            expires_at,
        });
    }

    Ok(restored)
}

fn decode_value<E, F: FieldTag>(
    dir: &Path,
    descriptor: &FieldDescriptor<E, F>,
    json: serde_json::Value,
    handlers: &TypeHandlers,
) -> CacheResult<Option<BoxedValue>> {
    let field = descriptor.tag().name();
    if json.is_null() {
        return Ok(None);
    }

    if let Some(handler) = handlers.get(descriptor.value_type()) {
        if let Some(name) = key::sidecar_reference(&json) {
            if !key::is_plain_file_name(name) {
                return Err(CacheError::Malformed(format!(
                    "field `{field}` references `{name}` outside of the cache directory"
                )));
            }
            let mut reader = BufReader::new(File::open(dir.join(name))?);
            let value = handler
                .deserialize(&mut reader)
                .map_err(|source| CacheError::Codec { field, source })?;
            return Ok(Some(value));
        }
    }

    match descriptor.from_json(json) {
        Some(value) => value,
        None => Err(CacheError::Malformed(format!(
            "field `{field}` has no binary handler and cannot be decoded from json"
        ))),
    }
}
