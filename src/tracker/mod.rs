//! Directory tracking: named, non-recursive watch targets with per-directory
//! file-timestamp snapshots.
//!
//! OS change notification is deliberately coarse: the watcher only tells us
//! *which directory* is dirty, and a rescan recomputes the full snapshot and
//! diffs it against the stored one. Replacing the snapshot wholesale after
//! each diff makes the tracker the single source of truth and keeps repeated
//! notifications for the same underlying change idempotent.

pub mod event;
pub mod snapshot;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::RecursiveMode;
use notify_debouncer_mini::{DebounceEventResult, new_debouncer};
use tokio::sync::mpsc as tokio_mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use event::ChangeEvent;
use snapshot::{Snapshot, scan_directory};

/// Debounce window for raw OS events. Editors often emit several events per
/// save; one dirty notification per directory is enough to trigger a rescan.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(100);

/// One tracked directory: its canonical path and the last snapshot taken.
#[derive(Debug, Clone)]
pub struct TrackedDirectory {
    pub path: PathBuf,
    pub snapshot: Snapshot,
}

/// Tracks one or more named directories and turns coarse dirty notifications
/// into discrete [`ChangeEvent`]s.
///
/// Dropping the tracker stops the OS watcher.
pub struct FileTracker {
    entries: HashMap<String, TrackedDirectory>,
    debouncer: notify_debouncer_mini::Debouncer<notify::RecommendedWatcher>,
    /// The bridge task forwarding dirty paths from the watcher callback
    /// thread to the tokio channel.
    _bridge_task: JoinHandle<()>,
}

impl FileTracker {
    /// Create a tracker and the channel its dirty-path notifications arrive
    /// on. Must be called from within a tokio runtime.
    pub fn new() -> anyhow::Result<(Self, tokio_mpsc::Receiver<PathBuf>)> {
        let (std_tx, std_rx) = std::sync::mpsc::channel::<DebounceEventResult>();

        let debouncer = new_debouncer(DEBOUNCE_WINDOW, move |res| {
            let _ = std_tx.send(res);
        })?;

        let (tokio_tx, tokio_rx) = tokio_mpsc::channel::<PathBuf>(256);

        // Bridge: receive from the std channel on a blocking thread, forward
        // dirty paths (deduplicated per batch) to the async side.
        let bridge_task = tokio::task::spawn_blocking(move || {
            while let Ok(result) = std_rx.recv() {
                match result {
                    Ok(events) => {
                        let mut seen: Vec<PathBuf> = Vec::new();
                        for event in events {
                            if seen.contains(&event.path) {
                                continue;
                            }
                            seen.push(event.path.clone());
                            if tokio_tx.blocking_send(event.path).is_err() {
                                return; // receiver dropped, shutdown
                            }
                        }
                    }
                    Err(err) => {
                        warn!(?err, "watcher error");
                    }
                }
            }
        });

        Ok((
            Self {
                entries: HashMap::new(),
                debouncer,
                _bridge_task: bridge_task,
            },
            tokio_rx,
        ))
    }

    /// Start tracking `path` under `id`. Returns false (with no state change)
    /// if the path does not exist or is not a directory.
    ///
    /// A previous entry under the same id is overwritten; its path stops
    /// being watched unless another id still references it.
    pub fn track(&mut self, id: &str, path: &Path) -> bool {
        let canonical = match path.canonicalize() {
            Ok(p) => p,
            Err(err) => {
                debug!(id, path = %path.display(), %err, "track: path does not exist");
                return false;
            }
        };
        if !canonical.is_dir() {
            debug!(id, path = %canonical.display(), "track: not a directory");
            return false;
        }
        let snapshot = match scan_directory(&canonical) {
            Ok(s) => s,
            Err(err) => {
                warn!(id, path = %canonical.display(), %err, "track: initial scan failed");
                return false;
            }
        };
        if let Err(err) = self
            .debouncer
            .watcher()
            .watch(&canonical, RecursiveMode::NonRecursive)
        {
            warn!(id, path = %canonical.display(), %err, "track: failed to watch");
            return false;
        }

        if let Some(previous) = self.entries.remove(id) {
            if previous.path != canonical {
                self.unwatch_if_unreferenced(&previous.path);
            }
        }

        debug!(id, path = %canonical.display(), files = snapshot.len(), "tracking");
        self.entries.insert(
            id.to_owned(),
            TrackedDirectory {
                path: canonical,
                snapshot,
            },
        );
        true
    }

    /// Stop tracking `id`. Returns false if the id is unknown.
    pub fn untrack(&mut self, id: &str) -> bool {
        match self.entries.remove(id) {
            Some(entry) => {
                debug!(id, path = %entry.path.display(), "untracked");
                self.unwatch_if_unreferenced(&entry.path);
                true
            }
            None => {
                warn!(id, "untrack: unknown id");
                false
            }
        }
    }

    /// Read-only view of the current tracking set.
    pub fn tracking_set(&self) -> &HashMap<String, TrackedDirectory> {
        &self.entries
    }

    /// Handle a dirty notification for `dirty` (a tracked directory or a
    /// path inside one): rescan the directory once and diff it against the
    /// snapshot of every id tracking that directory.
    ///
    /// Ids sharing a path rescan independently against their own snapshots,
    /// in sorted id order so event order is deterministic.
    pub fn rescan(&mut self, dirty: &Path) -> Vec<ChangeEvent> {
        let Some(dir) = self.resolve_dirty_directory(dirty) else {
            debug!(path = %dirty.display(), "dirty path matches no tracked directory");
            return Vec::new();
        };

        let current = match scan_directory(&dir) {
            Ok(s) => s,
            Err(err) => {
                // Directory unreadable (possibly deleted): diff against an
                // empty scan so every known file produces a Removed event.
                warn!(path = %dir.display(), %err, "rescan failed, treating as empty");
                Snapshot::new()
            }
        };

        let mut ids: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.path == dir)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();

        let mut events = Vec::new();
        for id in ids {
            let Some(entry) = self.entries.get_mut(&id) else {
                continue;
            };
            for (kind, filename) in snapshot::diff(&entry.snapshot, &current) {
                debug!(?kind, %id, %filename, "file event");
                events.push(ChangeEvent {
                    kind,
                    id: id.clone(),
                    directory: dir.clone(),
                    filename,
                });
            }
            entry.snapshot = current.clone();
        }
        events
    }

    /// Map a notification path to the tracked directory it belongs to.
    /// Notifications may name the directory itself or an entry inside it;
    /// deleted entries cannot be canonicalized, so the parent is tried raw
    /// as well.
    fn resolve_dirty_directory(&self, dirty: &Path) -> Option<PathBuf> {
        if self.is_tracked_path(dirty) {
            return Some(dirty.to_path_buf());
        }
        if let Ok(canonical) = dirty.canonicalize()
            && self.is_tracked_path(&canonical)
        {
            return Some(canonical);
        }
        let parent = dirty.parent()?;
        if self.is_tracked_path(parent) {
            return Some(parent.to_path_buf());
        }
        if let Ok(canonical) = parent.canonicalize()
            && self.is_tracked_path(&canonical)
        {
            return Some(canonical);
        }
        None
    }

    fn is_tracked_path(&self, path: &Path) -> bool {
        self.entries.values().any(|e| e.path == path)
    }

    fn unwatch_if_unreferenced(&mut self, path: &Path) {
        if !self.is_tracked_path(path) {
            let _ = self.debouncer.watcher().unwatch(path);
        }
    }
}
