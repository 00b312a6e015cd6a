use std::path::PathBuf;

/// What happened to a file between two scans of its directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Present in the new scan, absent from the previous snapshot.
    Added,
    /// Present in the previous snapshot, absent from the new scan.
    Removed,
    /// Present in both with a strictly newer modification time.
    Changed,
}

/// A discrete change produced by a rescan. Ephemeral: consumed immediately
/// by the monitor, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// Tracking id of the directory the file lives in.
    pub id: String,
    /// Canonical path of the tracked directory.
    pub directory: PathBuf,
    /// Bare filename within the directory (scans are non-recursive).
    pub filename: String,
}
