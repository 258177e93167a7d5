//! The on-disk JSON envelope of a single cache key.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CacheResult;

/// A snapshot file: the original key plus the persisted state of its entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub key: String,
    pub entry: SnapshotEntry,
}

/// The persisted state of a cache entry, keyed by field name.
///
/// Values in `data` are either inline JSON (`null` for a negative result) or a
/// `file://{name}` reference to a binary sidecar.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotEntry {
    #[serde(default)]
    pub data: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub field_expirations: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    pub fetched_fields: BTreeSet<String>,
}

impl SnapshotEntry {
    /// The earliest and latest expiry of all fetched fields.
    pub fn expiry_range(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let mut expirations = self
            .fetched_fields
            .iter()
            .filter_map(|name| self.field_expirations.get(name).copied());
        let first = expirations.next()?;
        Some(expirations.fold((first, first), |(min, max), at| (min.min(at), max.max(at))))
    }

    /// Returns `true` if no fetched field is fresh at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_range().is_none_or(|(_, latest)| latest < now)
    }

    /// The sidecar files referenced by this entry.
    pub fn sidecars(&self) -> impl Iterator<Item = &str> {
        self.data.values().filter_map(super::key::sidecar_reference)
    }
}

/// Reads and parses an envelope file.
pub fn read_envelope(path: &Path) -> CacheResult<SnapshotFile> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
