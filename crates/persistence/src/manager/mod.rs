//! The save orchestrator.
//!
//! `SaveManager` owns every open note's state behind one reader/writer lock
//! and funnels all disk writes through a single processor task.  Callers
//! talk to it through the content accessors (`open_note`, `update_content`,
//! `get_content`, dirty queries) and the save triggers (`save_note`,
//! `save_all_dirty`, `close_note`).  The lock is only held to capture or
//! apply state, never across I/O.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use notekeep_config::AppConfig;

use crate::circuit::CircuitBreakers;
use crate::error::SaveError;
use crate::events::{EventBus, SaveEvent};
use crate::note::{FileStamp, NoteId, NoteState, normalize_path};
use crate::queue::{BatchResult, SaveOutcome, SavePriority, SaveRequest};
use crate::wal::{RecoveredChange, WriteAheadLog};
use crate::watcher::ChangeWatcher;
use crate::writer::{AtomicWriter, sweep_temp_files};

mod conflict;
mod processor;

pub use conflict::ConflictResolution;

/// Everything guarded by the state lock.
#[derive(Debug)]
struct NoteTable {
    notes: HashMap<NoteId, NoteState>,
    by_path: HashMap<PathBuf, NoteId>,
    /// Notes whose write is in flight; the watcher ignores them.
    saving: HashSet<NoteId>,
    breakers: CircuitBreakers,
    auto_save: HashMap<NoteId, AbortHandle>,
}

impl NoteTable {
    fn disarm(&mut self, id: &NoteId) {
        if let Some(timer) = self.auto_save.remove(id) {
            timer.abort();
        }
    }
}

struct Inner {
    state: RwLock<NoteTable>,
    sender: Mutex<Option<mpsc::Sender<SaveRequest>>>,
    wal: WriteAheadLog,
    writer: AtomicWriter,
    events: EventBus,
    watcher: Option<ChangeWatcher>,
    runtime: Handle,
    shutting_down: AtomicBool,
    auto_save_delay: Duration,
    poll_interval: Duration,
    mtime_tolerance: Duration,
    large_threshold: usize,
    emergency_dir: PathBuf,
    /// Note directories already cleared of orphaned temp files.
    swept_dirs: Mutex<HashSet<PathBuf>>,
}

pub struct SaveManager {
    inner: Arc<Inner>,
    processor: Mutex<Option<JoinHandle<()>>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl SaveManager {
    /// Open the WAL, start the processor and (if enabled) the watcher.
    /// Must be called inside a tokio runtime.
    pub async fn start(config: &AppConfig) -> Result<Self> {
        let wal = WriteAheadLog::open(config.wal_dir(), &config.wal).await?;

        let (watcher, settled) = if config.watch.enabled {
            let (watcher, settled) = ChangeWatcher::start(config.watch.debounce())?;
            (Some(watcher), Some(settled))
        } else {
            (None, None)
        };

        let (tx, rx) = mpsc::channel(config.save.queue_capacity.max(1));
        let inner = Arc::new(Inner {
            state: RwLock::new(NoteTable {
                notes: HashMap::new(),
                by_path: HashMap::new(),
                saving: HashSet::new(),
                breakers: CircuitBreakers::new(
                    config.circuit.failure_threshold,
                    config.circuit.cooldown(),
                ),
                auto_save: HashMap::new(),
            }),
            sender: Mutex::new(Some(tx)),
            wal,
            writer: AtomicWriter::from_config(&config.save),
            events: EventBus::default(),
            watcher,
            runtime: Handle::current(),
            shutting_down: AtomicBool::new(false),
            auto_save_delay: config.save.auto_save_delay(),
            poll_interval: config.save.poll_interval(),
            mtime_tolerance: config.save.mtime_tolerance(),
            large_threshold: config.save.large_content_threshold,
            emergency_dir: PathBuf::from(&config.storage.emergency_dir),
            swept_dirs: Mutex::new(HashSet::new()),
        });

        let processor = tokio::spawn(processor::run(Arc::clone(&inner), rx));
        let watch_task = settled.map(|mut settled| {
            let inner = Arc::clone(&inner);
            tokio::spawn(async move {
                while let Some(id) = settled.recv().await {
                    inner.check_external_change(&id).await;
                }
            })
        });

        info!(
            wal_dir = %config.wal_dir().display(),
            watch = config.watch.enabled,
            "save manager started"
        );
        Ok(Self {
            inner,
            processor: Mutex::new(Some(processor)),
            watch_task: Mutex::new(watch_task),
            shutdown_timeout: config.save.shutdown_timeout(),
        })
    }

    // ── Content accessors ────────────────────────────────────────────────────

    /// Open `path` (empty content if it does not exist yet).  Opening an
    /// already-open path returns the existing id.
    pub async fn open_note(&self, path: impl AsRef<Path>) -> Result<NoteId> {
        let path = normalize_path(path.as_ref());
        if let Some(id) = self.inner.state.read().by_path.get(&path) {
            return Ok(id.clone());
        }

        self.inner.sweep_once(&path).await;

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
            Err(err) => return Err(err).with_context(|| format!("open note {}", path.display())),
        };

        let id = {
            let mut table = self.inner.state.write();
            if let Some(id) = table.by_path.get(&path) {
                return Ok(id.clone());
            }
            let base = NoteId::from_path(&path);
            let mut id = base.clone();
            let mut n = 2;
            while table.notes.contains_key(&id) {
                id = base.with_suffix(n);
                n += 1;
            }
            table.notes.insert(
                id.clone(),
                NoteState::new(
                    id.clone(),
                    path.clone(),
                    content,
                    stamp,
                    self.inner.large_threshold,
                ),
            );
            table.by_path.insert(path.clone(), id.clone());
            id
        };

        if let Some(watcher) = &self.inner.watcher {
            if let Err(err) = watcher.watch(&id, &path) {
                warn!(note_id = %id, error = %err, "external changes to this note will not be detected");
            }
        }
        info!(note_id = %id, path = %path.display(), "note opened");
        Ok(id)
    }

    /// Replace the live content.  Newly dirty notes (re)arm the auto-save
    /// timer; a revert to the saved content disarms it.  Unknown ids are
    /// ignored.
    pub fn update_content(&self, id: &NoteId, content: impl Into<String>) {
        self.inner.update_content(id, content.into());
    }

    pub fn get_content(&self, id: &NoteId) -> Option<String> {
        self.inner
            .state
            .read()
            .notes
            .get(id)
            .map(|n| n.current().to_string())
    }

    pub fn get_last_saved_content(&self, id: &NoteId) -> Option<String> {
        self.inner
            .state
            .read()
            .notes
            .get(id)
            .map(|n| n.last_saved().to_string())
    }

    pub fn is_note_dirty(&self, id: &NoteId) -> bool {
        self.inner
            .state
            .read()
            .notes
            .get(id)
            .is_some_and(NoteState::is_dirty)
    }

    pub fn dirty_note_ids(&self) -> Vec<NoteId> {
        let mut ids: Vec<NoteId> = self
            .inner
            .state
            .read()
            .notes
            .values()
            .filter(|n| n.is_dirty())
            .map(|n| n.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn open_note_ids(&self) -> Vec<NoteId> {
        let mut ids: Vec<NoteId> = self.inner.state.read().notes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn note_path(&self, id: &NoteId) -> Option<PathBuf> {
        self.inner.state.read().notes.get(id).map(|n| n.path.clone())
    }

    pub fn failure_count(&self, id: &NoteId) -> u32 {
        let table = self.inner.state.read();
        table
            .notes
            .get(id)
            .map(|n| table.breakers.failure_count(&n.path))
            .unwrap_or(0)
    }

    // ── Save triggers ────────────────────────────────────────────────────────

    /// User-initiated save.  `true` only if this request wrote the note.
    pub async fn save_note(&self, id: &NoteId) -> bool {
        self.save_note_with(id, SavePriority::UserSave).await.is_saved()
    }

    pub async fn save_note_with(&self, id: &NoteId, priority: SavePriority) -> SaveOutcome {
        if !self.inner.state.read().notes.contains_key(id) {
            warn!(note_id = %id, "save requested for a note that is not open");
            return SaveOutcome::Failed(SaveError::UnknownNote(id.clone()));
        }
        self.inner.enqueue(id.clone(), priority).await
    }

    /// Save every dirty note at shutdown priority and wait for all of them.
    pub async fn save_all_dirty(&self) -> BatchResult {
        let ids = self.dirty_note_ids();
        let outcomes = join_all(
            ids.iter()
                .map(|id| self.inner.enqueue(id.clone(), SavePriority::ShutdownSave)),
        )
        .await;

        let mut result = BatchResult::default();
        for (id, outcome) in ids.into_iter().zip(outcomes) {
            if outcome.is_saved() {
                result.success_count += 1;
            } else {
                result.failed_ids.push(id);
            }
        }
        info!(
            saved = result.success_count,
            failed = result.failed_ids.len(),
            "saved all dirty notes"
        );
        result
    }

    /// Save (at tab-close priority) if dirty, then forget the note.  A note
    /// whose save fails, or that was edited again meanwhile, stays open and
    /// `false` is returned.
    pub async fn close_note(&self, id: &NoteId) -> bool {
        if !self.inner.state.read().notes.contains_key(id) {
            warn!(note_id = %id, "close requested for a note that is not open");
            return false;
        }
        if self.is_note_dirty(id) {
            let outcome = self.inner.enqueue(id.clone(), SavePriority::TabClose).await;
            if !outcome.is_saved() {
                warn!(note_id = %id, ?outcome, "note kept open; close-time save did not complete");
                return false;
            }
        }

        {
            let mut table = self.inner.state.write();
            let Some(note) = table.notes.get(id) else {
                return false;
            };
            if note.is_dirty() {
                debug!(note_id = %id, "note edited during close; keeping it open");
                return false;
            }
            let path = note.path.clone();
            table.notes.remove(id);
            table.by_path.remove(&path);
            table.disarm(id);
        }
        if let Some(watcher) = &self.inner.watcher {
            watcher.unwatch(id);
        }
        info!(note_id = %id, "note closed");
        true
    }

    /// Apply a decision for a reported external change.
    pub async fn resolve_conflict(
        &self,
        id: &NoteId,
        resolution: ConflictResolution,
    ) -> Result<(), SaveError> {
        self.inner.resolve_conflict(id, resolution).await
    }

    /// Run the external-change check for `id` right away, bypassing the
    /// watcher's debounce.
    pub async fn check_external_change(&self, id: &NoteId) {
        self.inner.check_external_change(id).await;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaveEvent> {
        self.inner.events.subscribe()
    }

    /// Edits logged in the WAL that never reached their primary file.
    pub async fn recover_unpersisted(&self) -> Result<BTreeMap<NoteId, RecoveredChange>> {
        self.inner.wal.recover_unpersisted().await
    }

    pub fn wal(&self) -> &WriteAheadLog {
        &self.inner.wal
    }

    /// Stop accepting saves, let the processor drain what is queued, then
    /// stop the watcher and close the WAL.  Each stage is bounded by the
    /// shutdown timeout; waiters still pending after that resolve to
    /// `ShuttingDown`.
    pub async fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut table = self.inner.state.write();
            for (_, timer) in table.auto_save.drain() {
                timer.abort();
            }
        }
        // Closing the channel lets the processor finish its queue and exit.
        self.inner.sender.lock().take();

        let processor = self.processor.lock().take();
        if let Some(mut handle) = processor {
            match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
                Ok(_) => debug!("save processor drained"),
                Err(_) => {
                    warn!(
                        timeout_ms = self.shutdown_timeout.as_millis() as u64,
                        "save processor did not drain in time; cancelling"
                    );
                    handle.abort();
                }
            }
        }

        if let Some(watcher) = &self.inner.watcher {
            watcher.stop();
        }
        let watch_task = self.watch_task.lock().take();
        if let Some(task) = watch_task {
            task.abort();
        }

        self.inner.wal.shutdown().await;
        info!("save manager stopped");
    }
}

/// Modification time of `path`, or `None` if it does not exist.
async fn disk_mtime(path: &Path) -> Option<DateTime<Utc>> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    metadata.modified().ok().map(DateTime::<Utc>::from)
}

impl Inner {
    /// Clear temp files a crash left next to notes in `path`'s directory.
    /// Runs before the first note there is opened, so no save of ours can
    /// be in flight in it.
    async fn sweep_once(&self, path: &Path) {
        let Some(dir) = path.parent() else {
            return;
        };
        if !self.swept_dirs.lock().insert(dir.to_path_buf()) {
            return;
        }
        let removed = sweep_temp_files(dir).await;
        if removed > 0 {
            info!(dir = %dir.display(), removed, "removed temp files left by an earlier crash");
        }
    }

    fn update_content(self: &Arc<Self>, id: &NoteId, content: String) {
        let mut table = self.state.write();
        let Some(note) = table.notes.get_mut(id) else {
            warn!(note_id = %id, "update for a note that is not open; ignoring");
            return;
        };
        let dirty = note.update(content);
        let logged = if dirty {
            self.wal.log_change(id, note.current())
        } else {
            self.wal.mark_persisted(id)
        };
        if let Err(err) = logged {
            warn!(note_id = %id, error = %err, "edit not recorded in write-ahead log");
        }

        table.disarm(id);
        if dirty && !self.shutting_down.load(Ordering::SeqCst) {
            let timer = self.runtime.spawn(Arc::clone(self).auto_save_after(id.clone()));
            table.auto_save.insert(id.clone(), timer.abort_handle());
        }
    }

    async fn auto_save_after(self: Arc<Self>, id: NoteId) {
        tokio::time::sleep(self.auto_save_delay).await;
        let outcome = self.enqueue(id.clone(), SavePriority::AutoSave).await;
        if let SaveOutcome::Failed(err) = outcome {
            debug!(note_id = %id, error = %err, "auto-save did not complete");
        }
    }

    async fn enqueue(&self, id: NoteId, priority: SavePriority) -> SaveOutcome {
        let sender = self.sender.lock().clone();
        let Some(tx) = sender else {
            return SaveOutcome::Failed(SaveError::ShuttingDown);
        };
        let (request, done) = SaveRequest::new(id, priority);
        if tx.send(request).await.is_err() {
            return SaveOutcome::Failed(SaveError::ShuttingDown);
        }
        drop(tx);
        done.await
            .unwrap_or(SaveOutcome::Failed(SaveError::ShuttingDown))
    }
}
