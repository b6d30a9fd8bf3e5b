//! Failure taxonomy for save attempts.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::note::NoteId;

/// Why a save (or a conflict resolution) did not happen.
///
/// Every failure is delivered through the request's completion signal, so
/// one note's failure never aborts the processor loop.
#[derive(Debug, Error)]
pub enum SaveError {
    #[error("note {0} is not open")]
    UnknownNote(NoteId),

    /// The path failed repeatedly and is cooling down; no I/O was attempted.
    #[error("circuit open for {}; retry after the cooldown", path.display())]
    CircuitOpen { path: PathBuf },

    #[error("{} is read-only", path.display())]
    ReadOnly { path: PathBuf },

    #[error("permission denied writing {}: {source}", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The file on disk changed since the engine last read or wrote it.
    #[error("{} was modified outside the editor", path.display())]
    ExternalConflict { path: PathBuf },

    #[error("read-back of {} did not match the written content", path.display())]
    Verification { path: PathBuf },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The id would not stay a single file name inside the store.
    #[error("note id {0:?} is not a plain file name")]
    InvalidId(NoteId),

    #[error("save engine is shutting down")]
    ShuttingDown,

    #[error("merge resolution is not supported")]
    MergeUnsupported,

    #[error("failed to encode note metadata: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SaveError {
    /// Wrap an I/O error, promoting permission and read-only-volume
    /// failures to their own variants.
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.kind() {
            io::ErrorKind::PermissionDenied => Self::PermissionDenied { path, source },
            io::ErrorKind::ReadOnlyFilesystem => Self::ReadOnly { path },
            _ => Self::Io { path, source },
        }
    }

    /// Sharing/lock violations and read-back mismatches are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io { source, .. } => is_sharing_violation(source),
            Self::Verification { .. } => true,
            _ => false,
        }
    }

    /// Whether this failure should count against the path's circuit breaker.
    ///
    /// Conflicts and bookkeeping outcomes say nothing about the health of
    /// the path itself.
    pub fn counts_as_path_failure(&self) -> bool {
        matches!(
            self,
            Self::ReadOnly { .. }
                | Self::PermissionDenied { .. }
                | Self::Verification { .. }
                | Self::Io { .. }
        )
    }
}

/// Another process holds the file open or locked.
pub fn is_sharing_violation(err: &io::Error) -> bool {
    // ERROR_SHARING_VIOLATION and ERROR_LOCK_VIOLATION.
    #[cfg(windows)]
    if matches!(err.raw_os_error(), Some(32) | Some(33)) {
        return true;
    }
    matches!(
        err.kind(),
        io::ErrorKind::ResourceBusy | io::ErrorKind::WouldBlock | io::ErrorKind::ExecutableFileBusy
    )
}
