//! Content store with a JSON metadata sidecar, protected by its own
//! write-ahead log.
//!
//! Layout under `storage.data_path`:
//!
//! ```text
//! <id>.<data_extension>   content
//! <id>.meta               NoteMetadata as JSON
//! .temp/                  temp files for the atomic renames
//! .wal/                   persistence-<yyyy-MM-dd>.log
//! ```

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use notekeep_config::AppConfig;

use crate::error::{SaveError, is_sharing_violation};
use crate::note::NoteId;
use crate::wal::WriteAheadLog;
use crate::writer::{AtomicWriter, sweep_temp_files, write_emergency_copy};

const MAX_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveTrigger {
    Auto,
    User,
}

/// Transient status surface for whoever displays save progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreStatus {
    Idle,
    Saving { note_id: NoteId },
    Retrying { note_id: NoteId, attempt: u32, max: u32 },
    Saved { note_id: NoteId },
    Failed { note_id: NoteId, message: String },
    EmergencyCopy { note_id: NoteId, path: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteMetadata {
    pub id: NoteId,
    pub title: String,
    pub size: usize,
    pub saved_at: DateTime<Utc>,
}

pub struct DurableStore {
    data_path: PathBuf,
    temp_dir: PathBuf,
    extension: String,
    emergency_dir: PathBuf,
    backoff: Duration,
    writer: AtomicWriter,
    wal: WriteAheadLog,
    status: watch::Sender<StoreStatus>,
}

impl DurableStore {
    pub async fn open(config: &AppConfig) -> Result<Self> {
        let data_path = PathBuf::from(&config.storage.data_path);
        let temp_dir = data_path.join(".temp");
        tokio::fs::create_dir_all(&temp_dir)
            .await
            .with_context(|| format!("create {}", temp_dir.display()))?;
        let swept = sweep_temp_files(&temp_dir).await;
        if swept > 0 {
            info!(swept, dir = %temp_dir.display(), "removed temp files left by an earlier crash");
        }

        let wal = WriteAheadLog::open(config.store_wal_dir(), &config.wal).await?;
        let (status, _) = watch::channel(StoreStatus::Idle);

        Ok(Self {
            data_path,
            temp_dir,
            extension: config.storage.data_extension.clone(),
            emergency_dir: PathBuf::from(&config.storage.emergency_dir),
            backoff: config.save.durable_backoff(),
            // Retries are driven here, with linear backoff.
            writer: AtomicWriter::new(1, Duration::ZERO, config.save.verify_writes),
            wal,
            status,
        })
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn content_path(&self, id: &NoteId) -> PathBuf {
        self.data_path.join(format!("{id}.{}", self.extension))
    }

    pub fn meta_path(&self, id: &NoteId) -> PathBuf {
        self.data_path.join(format!("{id}.meta"))
    }

    pub fn wal(&self) -> &WriteAheadLog {
        &self.wal
    }

    pub fn subscribe_status(&self) -> watch::Receiver<StoreStatus> {
        self.status.subscribe()
    }

    /// Log `content` ahead, then write content and sidecar.
    ///
    /// Sharing violations are retried up to three times, waiting
    /// `backoff × attempt` in between.  A user-triggered save that still
    /// fails leaves an emergency copy behind; the WAL entry stays pending
    /// either way so recovery can offer it again.
    pub async fn save(
        &self,
        id: &NoteId,
        title: &str,
        content: &str,
        trigger: SaveTrigger,
    ) -> Result<NoteMetadata, SaveError> {
        check_id(id)?;
        self.status.send_replace(StoreStatus::Saving { note_id: id.clone() });

        if let Err(err) = self.wal.log_change(id, content) {
            warn!(note_id = %id, error = %err, "could not log change ahead of save");
        } else if let Err(err) = self.wal.sync().await {
            warn!(note_id = %id, error = %err, "could not flush write-ahead log before save");
        }

        let (result, attempts) = self
            .retry_locked(id, move || self.write_pair(id, title, content))
            .await;
        let err = match result {
            Ok(meta) => {
                if let Err(err) = self.wal.mark_persisted(id) {
                    warn!(note_id = %id, error = %err, "could not mark change persisted");
                }
                self.status.send_replace(StoreStatus::Saved { note_id: id.clone() });
                debug!(note_id = %id, size = meta.size, attempts, "durable save complete");
                return Ok(meta);
            }
            Err(err) => err,
        };

        warn!(note_id = %id, ?trigger, attempts, error = %err, "durable save failed");
        self.status.send_replace(StoreStatus::Failed {
            note_id: id.clone(),
            message: err.to_string(),
        });

        if trigger == SaveTrigger::User {
            match write_emergency_copy(&self.emergency_dir, id, content).await {
                Ok(path) => {
                    self.status
                        .send_replace(StoreStatus::EmergencyCopy { note_id: id.clone(), path });
                }
                Err(copy_err) => {
                    warn!(note_id = %id, error = %copy_err, "emergency copy failed too");
                }
            }
        }
        Err(err)
    }

    /// Run `attempt` again while the file is locked, waiting
    /// `backoff × attempt` in between and publishing `Retrying`.  Returns
    /// the last result and how many tries it took.
    async fn retry_locked<T, F, Fut>(&self, id: &NoteId, mut attempt: F) -> (Result<T, SaveError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SaveError>>,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            match attempt().await {
                Err(err) if is_locked(&err) && tries < MAX_ATTEMPTS => {
                    warn!(note_id = %id, attempt = tries, max = MAX_ATTEMPTS, error = %err, "file locked; retrying");
                    self.status.send_replace(StoreStatus::Retrying {
                        note_id: id.clone(),
                        attempt: tries,
                        max: MAX_ATTEMPTS,
                    });
                    tokio::time::sleep(self.backoff * tries).await;
                }
                result => return (result, tries),
            }
        }
    }

    async fn write_pair(
        &self,
        id: &NoteId,
        title: &str,
        content: &str,
    ) -> Result<NoteMetadata, SaveError> {
        self.writer
            .try_write(&self.content_path(id), content.as_bytes(), Some(&self.temp_dir))
            .await?;

        let meta = NoteMetadata {
            id: id.clone(),
            title: title.to_string(),
            size: content.len(),
            saved_at: Utc::now(),
        };
        // Content is already durable; a missing sidecar is cosmetic.
        let encoded = serde_json::to_vec_pretty(&meta)?;
        if let Err(err) = self
            .writer
            .try_write(&self.meta_path(id), &encoded, Some(&self.temp_dir))
            .await
        {
            warn!(note_id = %id, error = %err, "metadata sidecar write failed");
        }
        Ok(meta)
    }

    /// Primary file first, then any unpersisted WAL change.
    pub async fn load(&self, id: &NoteId) -> Result<Option<String>> {
        check_id(id)?;
        let path = self.content_path(id);
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => return Ok(Some(content)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
        }
        let recovered = self.wal.recover_note(id).await?;
        if recovered.is_some() {
            info!(note_id = %id, "primary file missing; loaded content from write-ahead log");
        }
        Ok(recovered.map(|change| change.content))
    }

    pub async fn load_metadata(&self, id: &NoteId) -> Result<Option<NoteMetadata>> {
        check_id(id)?;
        let path = self.meta_path(id);
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Some(
                serde_json::from_slice(&raw).with_context(|| format!("parse {}", path.display()))?,
            )),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
        }
    }

    pub async fn shutdown(&self) {
        self.wal.shutdown().await;
    }
}

/// Ids become file names under the data root and must not leave it.
fn check_id(id: &NoteId) -> Result<(), SaveError> {
    let name = id.as_str();
    let plain = !matches!(name, "" | "." | "..") && !name.contains(['/', '\\', '\0']);
    if plain {
        Ok(())
    } else {
        Err(SaveError::InvalidId(id.clone()))
    }
}

fn is_locked(err: &SaveError) -> bool {
    matches!(err, SaveError::Io { source, .. } if is_sharing_violation(source))
}
