use std::path::Path;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::SaveError;
use crate::events::SaveEvent;
use crate::note::{FileStamp, NoteId};

use super::{Inner, disk_mtime};

/// How to settle a reported external change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// Keep the editor's content; the next save overwrites the file.
    KeepLocal,
    /// Reload from disk, discarding local edits.
    KeepExternal,
    /// Three-way merge.  Not supported.
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Origin {
    Watcher,
    Save,
}

impl Inner {
    /// Debounced watcher check: report the change unless this engine is
    /// writing the note, the stamp still matches, or this modification was
    /// already reported.
    pub(super) async fn check_external_change(&self, id: &NoteId) {
        let (path, stamp, reported) = {
            let table = self.state.read();
            if table.saving.contains(id) {
                return;
            }
            let Some(note) = table.notes.get(id) else {
                return;
            };
            (note.path.clone(), note.file_stamp, note.reported_conflict)
        };

        let on_disk = disk_mtime(&path).await;
        if !stamp.is_stale(on_disk, self.mtime_tolerance) {
            return;
        }
        if on_disk.is_some() && reported == on_disk {
            return;
        }
        self.inspect_external(id, &path, on_disk, Origin::Watcher).await;
    }

    /// Read the changed file and decide whether it really conflicts.
    ///
    /// A file that was only touched (same content as the last save) gets its
    /// stamp refreshed and is not a conflict.  Content that cannot be read
    /// back is always a conflict.  Saves always re-raise the
    /// event; the watcher raises it once per modification time.
    pub(super) async fn inspect_external(
        &self,
        id: &NoteId,
        path: &Path,
        on_disk: Option<DateTime<Utc>>,
        origin: Origin,
    ) -> bool {
        let (external, readable) = match tokio::fs::read(path).await {
            Ok(bytes) => match String::from_utf8(bytes) {
                Ok(content) => (content, true),
                Err(err) => {
                    warn!(note_id = %id, "changed file is not valid UTF-8");
                    (String::from_utf8_lossy(err.as_bytes()).into_owned(), false)
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(note_id = %id, "changed file was removed");
                return false;
            }
            Err(err) if origin == Origin::Watcher => {
                debug!(note_id = %id, error = %err, "changed file unreadable; skipping check");
                return false;
            }
            Err(err) => {
                warn!(note_id = %id, error = %err, "changed file unreadable; refusing to overwrite");
                (String::new(), false)
            }
        };

        let report = {
            let mut table = self.state.write();
            if origin == Origin::Watcher && table.saving.contains(id) {
                return false;
            }
            let Some(note) = table.notes.get_mut(id) else {
                return false;
            };
            if readable && note.last_saved_matches(&external) {
                note.file_stamp = on_disk.map(FileStamp::Modified).unwrap_or(FileStamp::Absent);
                note.reported_conflict = None;
                debug!(note_id = %id, "file touched without a content change");
                return false;
            }
            let first = note.reported_conflict != on_disk;
            note.reported_conflict = on_disk;
            first || origin == Origin::Save
        };

        if report {
            warn!(note_id = %id, path = %path.display(), "note changed outside the editor");
            self.events.emit(SaveEvent::ExternalChangeDetected {
                note_id: id.clone(),
                path: path.to_path_buf(),
                external_content: external,
                detected_at: Utc::now(),
            });
        }
        true
    }

    pub(super) async fn resolve_conflict(
        &self,
        id: &NoteId,
        resolution: ConflictResolution,
    ) -> Result<(), SaveError> {
        let Some(path) = self.state.read().notes.get(id).map(|n| n.path.clone()) else {
            return Err(SaveError::UnknownNote(id.clone()));
        };

        match resolution {
            ConflictResolution::Merge => Err(SaveError::MergeUnsupported),
            ConflictResolution::KeepLocal => {
                let mut table = self.state.write();
                let note = table
                    .notes
                    .get_mut(id)
                    .ok_or_else(|| SaveError::UnknownNote(id.clone()))?;
                note.file_stamp = FileStamp::Unknown;
                note.reported_conflict = None;
                info!(note_id = %id, "conflict resolved: keeping local content");
                Ok(())
            }
            ConflictResolution::KeepExternal => {
                let (content, stamp) = match tokio::fs::read_to_string(&path).await {
                    Ok(content) => {
                        let stamp = disk_mtime(&path)
                            .await
                            .map(FileStamp::Modified)
                            .unwrap_or(FileStamp::Unknown);
                        (content, stamp)
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        (String::new(), FileStamp::Absent)
                    }
                    Err(err) => return Err(SaveError::io(&path, err)),
                };
                {
                    let mut table = self.state.write();
                    let note = table
                        .notes
                        .get_mut(id)
                        .ok_or_else(|| SaveError::UnknownNote(id.clone()))?;
                    note.reset_to(content, stamp);
                    table.disarm(id);
                }
                if let Err(err) = self.wal.mark_persisted(id) {
                    warn!(note_id = %id, error = %err, "could not clear discarded edits from write-ahead log");
                }
                info!(note_id = %id, "conflict resolved: reloaded external content");
                Ok(())
            }
        }
    }
}
