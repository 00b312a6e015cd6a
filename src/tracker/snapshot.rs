//! Directory snapshots and the diff between two of them.
//!
//! A snapshot maps recognized filenames to their last-modified timestamp in
//! milliseconds. Scans are non-recursive and bounded by directory size, so
//! they run synchronously to completion.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::Path;
use std::time::UNIX_EPOCH;

use super::event::ChangeKind;

/// File extensions the tracker recognizes (compared case-insensitively).
/// Everything else in a tracked directory is ignored.
pub const TRACKED_EXTENSIONS: &[&str] = &["qml", "js", "png", "jpg", "jpeg", "gif"];

/// filename -> mtime in milliseconds since the epoch.
pub type Snapshot = HashMap<String, u64>;

fn is_tracked_extension(name: &Path) -> bool {
    let ext = name.extension().and_then(|e| e.to_str()).unwrap_or("");
    TRACKED_EXTENSIONS
        .iter()
        .any(|t| t.eq_ignore_ascii_case(ext))
}

/// Scan the immediate entries of `dir` into a fresh snapshot.
///
/// Only regular files with a recognized extension are recorded. Files whose
/// mtime cannot be read get timestamp 0 rather than being dropped, so they
/// still participate in add/remove diffing.
pub fn scan_directory(dir: &Path) -> io::Result<Snapshot> {
    let mut snapshot = Snapshot::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let path = entry.path();
        if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
            continue;
        }
        if !is_tracked_extension(&path) {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let mtime_millis = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        snapshot.insert(name.to_owned(), mtime_millis);
    }
    Ok(snapshot)
}

/// Classify every filename in the union of `old` and `new`.
///
/// Iterates a sorted union so results never depend on filesystem iteration
/// order. A file present in both snapshots only counts as changed when its
/// new mtime is strictly greater than the old one.
pub fn diff(old: &Snapshot, new: &Snapshot) -> Vec<(ChangeKind, String)> {
    let union: BTreeSet<&String> = old.keys().chain(new.keys()).collect();

    let mut changes = Vec::new();
    for name in union {
        match (old.get(name), new.get(name)) {
            (Some(&was), Some(&is)) => {
                if is > was {
                    changes.push((ChangeKind::Changed, name.clone()));
                }
            }
            (None, Some(_)) => changes.push((ChangeKind::Added, name.clone())),
            (Some(_), None) => changes.push((ChangeKind::Removed, name.clone())),
            (None, None) => unreachable!("name came from the union of both maps"),
        }
    }
    changes
}
