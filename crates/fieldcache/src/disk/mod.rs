//! Snapshot persistence of cache entries.
//!
//! Every key is stored as a JSON envelope `{stem}.json`, where the stem is the URL-safe
//! base64 encoding of the key. Field values whose type has a registered
//! [`BinaryCodec`] are written to sidecar files `{stem}_{Field}.bin` and referenced from
//! the envelope as `file://{name}`.
//!
//! All files are written to a temporary file in the same directory first and then
//! atomically moved into place, so a crash never leaves a half-written envelope behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::CacheResult;
use crate::field::{CacheEntity, FieldTag};

mod envelope;
mod handlers;
mod key;
pub mod maintenance;
mod snapshot;

pub use envelope::{SnapshotEntry, SnapshotFile, read_envelope};
pub use handlers::{BinaryCodec, TypeHandlers};
pub use key::{file_stem, key_from_stem};
pub(crate) use snapshot::{PendingSnapshot, RestoredField, capture};

/// A snapshot that was read back from disk.
pub(crate) struct LoadedSnapshot<F> {
    pub key: String,
    pub fields: Vec<RestoredField<F>>,
}

/// Runs `f`, mapping a [`io::ErrorKind::NotFound`] error to `None`.
pub(crate) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}

/// The snapshot directory of a single cache.
#[derive(Debug, Clone)]
pub(crate) struct DiskStore {
    dir: PathBuf,
    handlers: TypeHandlers,
}

impl DiskStore {
    /// Opens the store at `dir`, creating the directory if needed.
    pub fn open(dir: PathBuf, handlers: TypeHandlers) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, handlers })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    pub fn handlers(&self) -> &TypeHandlers {
        &self.handlers
    }

    /// Writes a snapshot and its sidecars, and removes sidecars the entry no longer uses.
    pub fn write<F: FieldTag>(&self, snapshot: &PendingSnapshot) -> CacheResult<()> {
        for (name, bytes) in &snapshot.sidecars {
            self.write_atomic(name, bytes)?;
        }

        let json = serde_json::to_vec(&snapshot.file)?;
        self.write_atomic(&key::envelope_name(&snapshot.stem), &json)?;

        for tag in F::ALL {
            if snapshot.file.entry.data.get(tag.name()).is_some_and(|value| {
                key::sidecar_reference(value).is_some()
            }) {
                continue;
            }
            let stale = self.dir.join(key::sidecar_name(&snapshot.stem, tag.name()));
            catch_not_found(|| fs::remove_file(&stale))?;
        }

        Ok(())
    }

    fn write_atomic(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        let mut temp_file = tempfile::Builder::new()
            .prefix(".tmp")
            .tempfile_in(&self.dir)?;
        temp_file.write_all(bytes)?;
        temp_file.as_file().sync_data()?;
        temp_file.persist(self.dir.join(name))?;
        Ok(())
    }

    /// Reads all envelopes in the directory.
    ///
    /// Files that fail to parse or decode are skipped with a warning.
    pub fn load_all<E: CacheEntity>(
        &self,
        now: DateTime<Utc>,
    ) -> io::Result<Vec<LoadedSnapshot<E::Field>>> {
        let mut loaded = Vec::new();
        let Some(entries) = catch_not_found(|| fs::read_dir(&self.dir))? else {
            return Ok(loaded);
        };

        for entry in entries {
            let path = entry?.path();
            if path.extension().is_none_or(|ext| ext != key::ENVELOPE_EXTENSION) {
                continue;
            }

            let result = read_envelope(&path).and_then(|file| {
                let fields = snapshot::restore::<E>(&self.dir, &file.entry, &self.handlers, now)?;
                Ok(LoadedSnapshot {
                    key: file.key,
                    fields,
                })
            });

            match result {
                Ok(snapshot) => loaded.push(snapshot),
                Err(error) => {
                    tracing::warn!(
                        error = &error as &dyn std::error::Error,
                        path = %path.display(),
                        "skipping unreadable cache snapshot",
                    );
                }
            }
        }

        Ok(loaded)
    }

    /// Deletes and recreates the snapshot directory.
    pub fn clear(&self) -> io::Result<()> {
        maintenance::clear_dir(&self.dir)
    }
}
