use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Stable identity of an open note.
///
/// Derived from the normalized absolute path, so reopening the same file
/// after a restart yields the same id and WAL entries line up.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NoteId(String);

impl NoteId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// First 16 hex chars of the SHA-256 of the normalized path.
    pub fn from_path(path: &Path) -> Self {
        let normalized = normalize_path(path);
        let mut h = Sha256::new();
        h.update(normalized.to_string_lossy().as_bytes());
        let digest = format!("{:x}", h.finalize());
        Self(digest[..16].to_string())
    }

    /// Collision fallback: `<id>-<n>`.
    pub fn with_suffix(&self, n: usize) -> Self {
        Self(format!("{}-{n}", self.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NoteId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Absolute, lexically cleaned path used as the key for ids, the path map
/// and circuit breakers.  Does not touch the filesystem, so it works for
/// files that do not exist yet.
pub fn normalize_path(path: &Path) -> PathBuf {
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    let mut out = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    if cfg!(windows) {
        PathBuf::from(out.to_string_lossy().to_lowercase())
    } else {
        out
    }
}

/// Content plus an optional digest.  The digest is only computed above the
/// large-content threshold so dirty checks on big notes compare 32 bytes
/// instead of the whole text.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    text: String,
    digest: Option<[u8; 32]>,
}

impl Snapshot {
    pub fn new(text: String, large_threshold: usize) -> Self {
        let digest = (text.len() > large_threshold).then(|| {
            let mut out = [0u8; 32];
            out.copy_from_slice(&Sha256::digest(text.as_bytes()));
            out
        });
        Self { text, digest }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn same_content(&self, other: &Snapshot) -> bool {
        if self.text.len() != other.text.len() {
            return false;
        }
        match (self.digest, other.digest) {
            (Some(left), Some(right)) => left == right,
            _ => self.text == other.text,
        }
    }
}

/// What the engine last knew about the file's modification time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStamp {
    /// Forced by `KeepLocal`: the next save skips the staleness check.
    Unknown,
    /// The file did not exist when the engine last looked.
    Absent,
    Modified(DateTime<Utc>),
}

impl FileStamp {
    /// Whether `on_disk` (None = missing) is a change that the engine did
    /// not make.  External deletion is not treated as a change: the next
    /// save simply recreates the file.
    pub fn is_stale(&self, on_disk: Option<DateTime<Utc>>, tolerance: Duration) -> bool {
        match (self, on_disk) {
            (Self::Unknown, _) => false,
            (Self::Absent, disk) => disk.is_some(),
            (Self::Modified(_), None) => false,
            (Self::Modified(known), Some(disk)) => {
                let skew = (disk - *known).abs();
                skew.to_std().map(|skew| skew > tolerance).unwrap_or(true)
            }
        }
    }
}

/// Per-note state owned exclusively by the save manager's table.
#[derive(Debug)]
pub struct NoteState {
    pub id: NoteId,
    pub path: PathBuf,
    current: Snapshot,
    last_saved: Snapshot,
    pub file_stamp: FileStamp,
    pub last_save_time: Option<DateTime<Utc>>,
    /// Modification time of the last external change already reported.
    pub reported_conflict: Option<DateTime<Utc>>,
    large_threshold: usize,
}

impl NoteState {
    pub fn new(
        id: NoteId,
        path: PathBuf,
        initial: String,
        file_stamp: FileStamp,
        large_threshold: usize,
    ) -> Self {
        let snapshot = Snapshot::new(initial, large_threshold);
        Self {
            id,
            path,
            current: snapshot.clone(),
            last_saved: snapshot,
            file_stamp,
            last_save_time: None,
            reported_conflict: None,
            large_threshold,
        }
    }

    pub fn current(&self) -> &str {
        self.current.text()
    }

    pub fn last_saved(&self) -> &str {
        self.last_saved.text()
    }

    pub fn current_snapshot(&self) -> &Snapshot {
        &self.current
    }

    pub fn is_dirty(&self) -> bool {
        !self.current.same_content(&self.last_saved)
    }

    /// Replace the live content.  Returns the new dirty state.
    pub fn update(&mut self, content: String) -> bool {
        self.current = Snapshot::new(content, self.large_threshold);
        self.is_dirty()
    }

    pub fn current_matches(&self, snapshot: &Snapshot) -> bool {
        self.current.same_content(snapshot)
    }

    pub fn last_saved_matches(&self, text: &str) -> bool {
        self.last_saved.text() == text
    }

    /// Record a completed write of `snapshot`.
    pub fn mark_saved(&mut self, snapshot: Snapshot, stamp: FileStamp, at: DateTime<Utc>) {
        self.last_saved = snapshot;
        self.file_stamp = stamp;
        self.last_save_time = Some(at);
        self.reported_conflict = None;
    }

    /// Adopt on-disk content as both current and saved (`KeepExternal`).
    pub fn reset_to(&mut self, content: String, stamp: FileStamp) {
        let snapshot = Snapshot::new(content, self.large_threshold);
        self.current = snapshot.clone();
        self.last_saved = snapshot;
        self.file_stamp = stamp;
        self.reported_conflict = None;
    }
}
