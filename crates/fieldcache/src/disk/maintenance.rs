//! Offline inspection and cleanup of a snapshot directory.
//!
//! These functions work on the raw envelopes and need neither the entity type nor a running
//! cache. They must not be used on a directory that a live cache is syncing to.

use std::collections::HashSet;
use std::fs::{self, read_dir, remove_file};
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

use super::catch_not_found;
use super::envelope::{SnapshotFile, read_envelope};
use super::key;

/// A parsed envelope and where it was found.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub size: u64,
    pub snapshot: SnapshotFile,
}

/// Lists all readable envelopes in `dir`, ordered by key.
///
/// Unreadable envelopes are skipped with a warning.
pub fn list_snapshots(dir: &Path) -> Result<Vec<SnapshotInfo>> {
    let mut snapshots = Vec::new();
    for path in envelope_paths(dir)? {
        match read_info(&path) {
            Ok(info) => snapshots.push(info),
            Err(error) => {
                tracing::warn!(path = %path.display(), "skipping unreadable snapshot: {error:#}");
            }
        }
    }
    snapshots.sort_by(|a, b| a.snapshot.key.cmp(&b.snapshot.key));
    Ok(snapshots)
}

/// Reads the envelope of `key`, if there is one.
pub fn find_snapshot(dir: &Path, key: &str) -> Result<Option<SnapshotInfo>> {
    let path = dir.join(key::envelope_name(&key::file_stem(key)));
    if !path.is_file() {
        return Ok(None);
    }
    read_info(&path).map(Some)
}

fn read_info(path: &Path) -> Result<SnapshotInfo> {
    let size = path.metadata()?.len();
    let snapshot = read_envelope(path)
        .with_context(|| format!("failed to read `{}`", path.display()))?;
    Ok(SnapshotInfo {
        path: path.to_owned(),
        size,
        snapshot,
    })
}

fn envelope_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let Some(entries) = catch_not_found(|| read_dir(dir))? else {
        anyhow::bail!("snapshot directory `{}` does not exist", dir.display());
    };

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext == key::ENVELOPE_EXTENSION)
        {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

/// The outcome of [`prune`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    pub removed_files: usize,
    pub removed_bytes: u64,
    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl PruneStats {
    fn removed(&mut self, size: u64) {
        self.removed_files += 1;
        self.removed_bytes += size;
    }

    fn retained(&mut self, size: u64) {
        self.retained_files += 1;
        self.retained_bytes += size;
    }
}

/// Removes dead files from a snapshot directory.
///
/// An envelope is dead if it cannot be parsed or none of its fetched fields is fresh at
/// `now`. Sidecars are dead unless a live envelope references them, and temporary files
/// are left over from interrupted writes. If `dry_run` is `true`, no files will actually be
/// deleted.
pub fn prune(dir: &Path, now: DateTime<Utc>, dry_run: bool) -> Result<PruneStats> {
    tracing::info!("Pruning snapshots in `{}`", dir.display());
    let mut stats = PruneStats::default();
    let mut referenced = HashSet::new();

    for path in envelope_paths(dir)? {
        let Some(metadata) = catch_not_found(|| path.metadata())? else {
            continue;
        };
        let live = match read_envelope(&path) {
            Ok(file) if !file.entry.is_expired(now) => {
                referenced.extend(file.entry.sidecars().map(str::to_owned));
                true
            }
            Ok(_) => false,
            Err(error) => {
                tracing::debug!(
                    error = &error as &dyn std::error::Error,
                    "Removing unreadable snapshot `{}`",
                    path.display()
                );
                false
            }
        };

        if live {
            stats.retained(metadata.len());
        } else {
            remove(&path, dry_run)?;
            stats.removed(metadata.len());
        }
    }

    for entry in read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        let dead = if key::split_sidecar_name(name).is_some() {
            !referenced.contains(name)
        } else {
            name.starts_with(".tmp")
        };
        if !dead {
            if key::split_sidecar_name(name).is_some() {
                stats.retained(entry.metadata()?.len());
            }
            continue;
        }
        let Some(metadata) = catch_not_found(|| entry.metadata())? else {
            continue;
        };
        if metadata.is_file() {
            remove(&path, dry_run)?;
            stats.removed(metadata.len());
        }
    }

    if !dry_run {
        metric!(counter("fieldcache.prune.removed_files") += stats.removed_files as i64);
        metric!(counter("fieldcache.prune.removed_bytes") += stats.removed_bytes as i64);
    }
    tracing::info!(
        "Retained {} files, totaling {} bytes",
        stats.retained_files,
        stats.retained_bytes,
    );
    tracing::info!(
        "Removed {} files, totaling {} bytes",
        stats.removed_files,
        stats.removed_bytes,
    );
    Ok(stats)
}

fn remove(path: &Path, dry_run: bool) -> io::Result<()> {
    tracing::debug!("Removing file `{}`", path.display());
    if !dry_run {
        catch_not_found(|| remove_file(path))?;
    }
    Ok(())
}

/// Deletes `dir` with all its contents and creates it again, empty.
pub fn clear_dir(dir: &Path) -> io::Result<()> {
    catch_not_found(|| fs::remove_dir_all(dir))?;
    fs::create_dir_all(dir)
}
