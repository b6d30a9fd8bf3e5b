//! Atomic replacement of files on disk.
//!
//! Content goes to a uniquely named temp file, is `fsync`'d, optionally read
//! back, and then renamed over the target.  A crash before the rename leaves
//! the target untouched; a crash after it leaves the new content.  The temp
//! file is removed on every error path, and [`sweep_temp_files`] clears
//! leftovers from a crash.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

use notekeep_config::SaveConfig;

use crate::error::SaveError;
use crate::note::NoteId;

const TEMP_PREFIX: &str = ".~";
const TEMP_SUFFIX: &str = ".tmp";

#[derive(Debug, Clone)]
pub struct AtomicWriter {
    attempts: u32,
    retry_delay: Duration,
    verify: bool,
}

impl AtomicWriter {
    pub fn new(attempts: u32, retry_delay: Duration, verify: bool) -> Self {
        Self {
            attempts: attempts.max(1),
            retry_delay,
            verify,
        }
    }

    pub fn from_config(config: &SaveConfig) -> Self {
        Self::new(config.write_attempts, config.write_retry_delay(), config.verify_writes)
    }

    /// Replace `target` with `content`, retrying with a fixed delay while the
    /// file is locked by someone else.  Any other failure aborts at once.
    pub async fn write(&self, target: &Path, content: &[u8]) -> Result<(), SaveError> {
        retry_fixed(self.attempts, self.retry_delay, target, move |_| {
            self.try_write(target, content, None)
        })
        .await
    }

    /// One attempt, no retry.  The temp file lives next to the target unless
    /// `temp_dir` is given (it must be on the same filesystem).
    pub async fn try_write(
        &self,
        target: &Path,
        content: &[u8],
        temp_dir: Option<&Path>,
    ) -> Result<(), SaveError> {
        if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SaveError::io(parent, e))?;
        }
        if let Some(dir) = temp_dir {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| SaveError::io(dir, e))?;
        }

        let tmp_path = temp_path_for(target, temp_dir);
        let result = self.write_and_rename(&tmp_path, target, content).await;
        if result.is_err() {
            let _ = tokio::fs::remove_file(&tmp_path).await;
        }
        result
    }

    async fn write_and_rename(
        &self,
        tmp_path: &Path,
        target: &Path,
        content: &[u8],
    ) -> Result<(), SaveError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(tmp_path)
            .await
            .map_err(|e| SaveError::io(target, e))?;
        file.write_all(content).await.map_err(|e| SaveError::io(target, e))?;
        file.flush().await.map_err(|e| SaveError::io(target, e))?;
        file.sync_all().await.map_err(|e| SaveError::io(target, e))?;
        drop(file);

        if self.verify {
            let written = tokio::fs::read(tmp_path)
                .await
                .map_err(|e| SaveError::io(target, e))?;
            if written != content {
                return Err(SaveError::Verification {
                    path: target.to_path_buf(),
                });
            }
        }

        tokio::fs::rename(tmp_path, target)
            .await
            .map_err(|e| SaveError::io(target, e))?;
        sync_parent_dir(target).await;
        Ok(())
    }
}

/// Run `attempt` until it succeeds, fails with a non-transient error, or
/// `attempts` tries are used up, sleeping `delay` in between.
async fn retry_fixed<T, F, Fut>(
    attempts: u32,
    delay: Duration,
    target: &Path,
    mut attempt: F,
) -> Result<T, SaveError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, SaveError>>,
{
    let mut tries = 0;
    loop {
        tries += 1;
        match attempt(tries).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && tries < attempts => {
                debug!(
                    path = %target.display(),
                    attempt = tries,
                    max = attempts,
                    error = %err,
                    "atomic write hit a transient error; retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// `.~<file name>.<uuid>.tmp`, never reused across attempts.
pub fn temp_path_for(target: &Path, temp_dir: Option<&Path>) -> PathBuf {
    let filename = target
        .file_name()
        .map(|f| f.to_string_lossy().to_string())
        .unwrap_or_else(|| "note".to_string());
    let name = format!("{TEMP_PREFIX}{filename}.{}{TEMP_SUFFIX}", Uuid::new_v4().simple());
    match temp_dir {
        Some(dir) => dir.join(name),
        None => target.with_file_name(name),
    }
}

fn is_temp_file(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
}

/// Remove temp files orphaned by a crash between write and rename.
/// Returns how many were deleted.
pub async fn sweep_temp_files(dir: &Path) -> usize {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().to_string();
        if !is_temp_file(&name) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => removed += 1,
            Err(err) => warn!(path = %entry.path().display(), error = %err, "could not remove orphaned temp file"),
        }
    }
    if removed > 0 {
        debug!(dir = %dir.display(), removed, "swept orphaned temp files");
    }
    removed
}

/// Last-resort copy written after a user-triggered save exhausts its
/// retries: `<dir>/<id>-<yyyyMMddTHHmmssfffZ>-<8 hex>.emergency`.  Every
/// failure gets its own file.
pub async fn write_emergency_copy(
    dir: &Path,
    id: &NoteId,
    content: &str,
) -> Result<PathBuf, SaveError> {
    let stamp = Utc::now().format("%Y%m%dT%H%M%S%3fZ");
    let mut tag = Uuid::new_v4().simple().to_string();
    tag.truncate(8);
    let path = dir.join(format!("{id}-{stamp}-{tag}.emergency"));
    AtomicWriter::new(1, Duration::ZERO, false)
        .try_write(&path, content.as_bytes(), None)
        .await?;
    warn!(note_id = %id, path = %path.display(), "wrote emergency copy");
    Ok(path)
}

#[cfg(unix)]
async fn sync_parent_dir(target: &Path) {
    if let Some(parent) = target.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Ok(dir) = tokio::fs::File::open(parent).await {
            let _ = dir.sync_all().await;
        }
    }
}

#[cfg(not(unix))]
async fn sync_parent_dir(_target: &Path) {}
