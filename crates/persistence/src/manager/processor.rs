use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, warn};

use crate::error::SaveError;
use crate::events::SaveEvent;
use crate::note::{FileStamp, NoteId, Snapshot};
use crate::queue::{PriorityQueues, SaveOutcome, SavePriority, SaveRequest};
use crate::writer::write_emergency_copy;

use super::conflict::Origin;
use super::{Inner, disk_mtime};

/// The only task that writes note files.
///
/// Everything waiting on the channel is folded into the queues before each
/// execution, so a higher-priority arrival is served next even while a long
/// drain is under way.  With nothing queued it waits on the channel for at
/// most one poll interval.  Once the channel closes the remaining queue is
/// executed and the loop exits.
pub(super) async fn run(inner: Arc<Inner>, mut rx: mpsc::Receiver<SaveRequest>) {
    let mut queues = PriorityQueues::new();
    let mut closed = false;

    loop {
        loop {
            match rx.try_recv() {
                Ok(request) => queues.push(request),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    closed = true;
                    break;
                }
            }
        }

        if let Some(request) = queues.pop() {
            debug!(
                note_id = %request.note_id,
                priority = %request.priority,
                waited_ms = request.queued_at.elapsed().as_millis() as u64,
                "running queued save"
            );
            let outcome = inner.execute_save(&request.note_id, request.priority).await;
            request.complete(outcome);
            continue;
        }
        if closed {
            break;
        }

        match tokio::time::timeout(inner.poll_interval, rx.recv()).await {
            Ok(Some(request)) => queues.push(request),
            Ok(None) => closed = true,
            Err(_) => {}
        }
    }
    debug!("save processor stopped");
}

impl Inner {
    /// Persist the note's content as of now.  Edits that land while the
    /// write is in flight are not part of it and leave the note dirty.
    pub(super) async fn execute_save(&self, id: &NoteId, priority: SavePriority) -> SaveOutcome {
        let (path, snapshot, stamp) = {
            let mut table = self.state.write();
            let Some(note) = table.notes.get(id) else {
                debug!(note_id = %id, "note closed before its save ran");
                return SaveOutcome::Failed(SaveError::UnknownNote(id.clone()));
            };
            let captured = (note.path.clone(), note.current_snapshot().clone(), note.file_stamp);
            table.saving.insert(id.clone());
            captured
        };

        self.events.emit(SaveEvent::SaveStarted {
            note_id: id.clone(),
            path: path.clone(),
            priority,
            at: Utc::now(),
        });

        let result = self.write_snapshot(id, &path, &snapshot, stamp).await;
        let finished_at = Utc::now();

        match result {
            Ok(written) => {
                self.record_saved(id, &path, snapshot, written, finished_at);
                self.events.emit(SaveEvent::SaveCompleted {
                    note_id: id.clone(),
                    path: path.clone(),
                    priority,
                    success: true,
                    at: finished_at,
                });
                self.events.emit(SaveEvent::NoteSaved {
                    note_id: id.clone(),
                    path: path.clone(),
                    saved_at: finished_at,
                    was_auto_save: priority == SavePriority::AutoSave,
                });
                debug!(note_id = %id, path = %path.display(), %priority, "note saved");
                SaveOutcome::Saved
            }
            Err(err) => {
                {
                    let mut table = self.state.write();
                    table.saving.remove(id);
                    if err.counts_as_path_failure() {
                        table.breakers.record_failure(&path, Instant::now());
                    }
                }
                self.events.emit(SaveEvent::SaveCompleted {
                    note_id: id.clone(),
                    path: path.clone(),
                    priority,
                    success: false,
                    at: finished_at,
                });
                warn!(note_id = %id, path = %path.display(), %priority, error = %err, "save failed");

                if priority.is_user_triggered() && err.counts_as_path_failure() {
                    if let Err(copy_err) =
                        write_emergency_copy(&self.emergency_dir, id, snapshot.text()).await
                    {
                        warn!(note_id = %id, error = %copy_err, "emergency copy failed");
                    }
                }
                SaveOutcome::Failed(err)
            }
        }
    }

    /// Apply a completed write under the state lock.  The written snapshot
    /// becomes the saved content; an edit that landed while the write was in
    /// flight keeps the note dirty and is logged again, since the persisted
    /// marker cancels every earlier change for the note.
    pub(super) fn record_saved(
        &self,
        id: &NoteId,
        path: &Path,
        snapshot: Snapshot,
        written: FileStamp,
        at: DateTime<Utc>,
    ) {
        let mut table = self.state.write();
        table.saving.remove(id);
        table.breakers.record_success(path);
        let Some(note) = table.notes.get_mut(id) else {
            return;
        };
        let edited_meanwhile = !note.current_matches(&snapshot);
        note.mark_saved(snapshot, written, at);
        if let Err(err) = self.wal.mark_persisted(id) {
            warn!(note_id = %id, error = %err, "could not mark save in write-ahead log");
        }
        if edited_meanwhile {
            if let Err(err) = self.wal.log_change(id, note.current()) {
                warn!(note_id = %id, error = %err, "edit not recorded in write-ahead log");
            }
        }
    }

    /// Gate checks then the atomic write.  Returns the file's new stamp.
    async fn write_snapshot(
        &self,
        id: &NoteId,
        path: &Path,
        snapshot: &Snapshot,
        stamp: FileStamp,
    ) -> Result<FileStamp, SaveError> {
        if !self.state.write().breakers.allow(path, Instant::now()) {
            return Err(SaveError::CircuitOpen {
                path: path.to_path_buf(),
            });
        }

        let metadata = match tokio::fs::metadata(path).await {
            Ok(metadata) => Some(metadata),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => None,
            Err(err) => return Err(SaveError::io(path, err)),
        };
        if metadata.as_ref().is_some_and(|m| m.permissions().readonly()) {
            return Err(SaveError::ReadOnly {
                path: path.to_path_buf(),
            });
        }

        let on_disk = metadata
            .and_then(|m| m.modified().ok())
            .map(chrono::DateTime::<Utc>::from);
        if stamp.is_stale(on_disk, self.mtime_tolerance)
            && self.inspect_external(id, path, on_disk, Origin::Save).await
        {
            return Err(SaveError::ExternalConflict {
                path: path.to_path_buf(),
            });
        }

        self.writer.write(path, snapshot.text().as_bytes()).await?;

        Ok(disk_mtime(path)
            .await
            .map(FileStamp::Modified)
            .unwrap_or(FileStamp::Unknown))
    }
}
