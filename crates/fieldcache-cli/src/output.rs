use std::time::Duration;

use chrono::{DateTime, Utc};
use console::style;
use fieldcache::disk::maintenance::{PruneStats, SnapshotInfo};
use prettytable::{Table, cell, format::consts::FORMAT_CLEAN, row};

/// Inline values longer than this are truncated in tables.
const MAX_VALUE_WIDTH: usize = 48;

pub fn snapshot_table(snapshots: &[SnapshotInfo], now: DateTime<Utc>) -> Table {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.set_titles(row![
        b => "Key",
        "File",
        "Fields",
        "Size",
        "Earliest expiry",
        "Latest expiry"
    ]);

    for info in snapshots {
        let entry = &info.snapshot.entry;
        let (earliest, latest) = match entry.expiry_range() {
            Some((earliest, latest)) => (relative(earliest, now), relative(latest, now)),
            None => ("-".to_owned(), "-".to_owned()),
        };
        let file = info
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        table.add_row(row![
            info.snapshot.key,
            file,
            r->entry.fetched_fields.len(),
            r->info.size,
            earliest,
            latest,
        ]);
    }

    table
}

pub fn field_table(info: &SnapshotInfo, now: DateTime<Utc>) -> Table {
    let mut table = Table::new();
    table.set_format(*FORMAT_CLEAN);
    table.add_row(row![r->"Key:", info.snapshot.key]);
    table.add_row(row![r->"File:", info.path.display()]);
    table.add_row(row![r->"Size:", format!("{} bytes", info.size)]);
    table.add_row(row![b => "Field", "Expires", "Value"]);

    let entry = &info.snapshot.entry;
    for name in &entry.fetched_fields {
        let expires = match entry.field_expirations.get(name) {
            Some(&at) => relative(at, now),
            None => "-".to_owned(),
        };
        let value = entry
            .data
            .get(name)
            .map(|value| truncate(value.to_string()))
            .unwrap_or_else(|| "null".to_owned());
        table.add_row(row![name, expires, value]);
    }

    table
}

pub fn print_snapshots(snapshots: &[SnapshotInfo], now: DateTime<Utc>) {
    if snapshots.is_empty() {
        println!("{}", style("No snapshots found.").dim());
        return;
    }
    snapshot_table(snapshots, now).printstd();
}

pub fn print_fields(info: &SnapshotInfo, now: DateTime<Utc>) {
    field_table(info, now).printstd();
}

pub fn print_prune_stats(stats: &PruneStats, dry_run: bool) {
    let verb = if dry_run { "Would remove" } else { "Removed" };
    println!(
        "{verb} {} files ({} bytes), retained {} files ({} bytes)",
        stats.removed_files, stats.removed_bytes, stats.retained_files, stats.retained_bytes,
    );
}

/// Formats `at` as a human readable offset to `now`, like `in 59m` or `expired 2h ago`.
pub fn relative(at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let delta = at - now;
    // round to seconds so the output stays short
    let seconds = delta.num_seconds().unsigned_abs();
    let duration = humantime::format_duration(Duration::from_secs(seconds));
    if delta.num_seconds() >= 0 {
        format!("in {duration}")
    } else {
        format!("expired {duration} ago")
    }
}

fn truncate(mut value: String) -> String {
    if value.chars().count() > MAX_VALUE_WIDTH {
        value = value.chars().take(MAX_VALUE_WIDTH - 1).collect();
        value.push('…');
    }
    value
}
