//! Write-ahead log of note edits.
//!
//! Callers enqueue entries without waiting; a dedicated writer task batches
//! them into `persistence-<yyyy-MM-dd>.log` (one JSON object per line) when
//! `batch_size` entries are buffered or the flush tick fires, whichever comes
//! first.  Recovery replays recent files in order: a `Change` sets the
//! pending content for its note and a `Persisted` marker clears it, so what
//! remains is exactly the set of edits that never reached their primary file.

use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use notekeep_config::WalConfig;

use crate::note::NoteId;

const FILE_PREFIX: &str = "persistence-";
const FILE_SUFFIX: &str = ".log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalEntryKind {
    Change,
    Persisted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WalEntry {
    #[serde(default)]
    pub id: Uuid,
    #[serde(rename = "Type")]
    pub kind: WalEntryKind,
    pub note_id: NoteId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl WalEntry {
    fn change(note_id: &NoteId, content: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: WalEntryKind::Change,
            note_id: note_id.clone(),
            content: Some(content.to_string()),
            timestamp: Utc::now(),
        }
    }

    fn persisted(note_id: &NoteId) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: WalEntryKind::Persisted,
            note_id: note_id.clone(),
            content: None,
            timestamp: Utc::now(),
        }
    }
}

/// An edit that was logged but never confirmed durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredChange {
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

enum WalCommand {
    Append(WalEntry),
    Flush(oneshot::Sender<io::Result<()>>),
    Shutdown(oneshot::Sender<()>),
}

pub struct WriteAheadLog {
    dir: PathBuf,
    tx: mpsc::UnboundedSender<WalCommand>,
    writer: Mutex<Option<JoinHandle<()>>>,
    recovery_window: chrono::Duration,
    shutdown_timeout: Duration,
}

impl WriteAheadLog {
    /// Create the log directory and spawn the writer task.
    pub async fn open(dir: impl Into<PathBuf>, config: &WalConfig) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create WAL directory {}", dir.display()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let log_file = LogFiles {
            dir: dir.clone(),
            day: None,
            retention_days: config.retention_days,
        };
        let handle = tokio::spawn(run_writer(
            log_file,
            rx,
            config.batch_size.max(1),
            config.flush_interval(),
        ));
        info!(dir = %dir.display(), "write-ahead log opened");

        Ok(Self {
            dir,
            tx,
            writer: Mutex::new(Some(handle)),
            recovery_window: chrono::Duration::hours(config.recovery_window_hours as i64),
            shutdown_timeout: config.shutdown_flush_timeout(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Queue a `Change` entry.  Returns the entry id.
    pub fn log_change(&self, note_id: &NoteId, content: &str) -> Result<Uuid> {
        self.enqueue(WalEntry::change(note_id, content))
    }

    /// Queue a `Persisted` marker, cancelling earlier changes for the note.
    pub fn mark_persisted(&self, note_id: &NoteId) -> Result<Uuid> {
        self.enqueue(WalEntry::persisted(note_id))
    }

    fn enqueue(&self, entry: WalEntry) -> Result<Uuid> {
        let id = entry.id;
        self.tx
            .send(WalCommand::Append(entry))
            .map_err(|_| anyhow!("write-ahead log is closed"))?;
        Ok(id)
    }

    /// Flush everything queued so far and wait until it is on disk.
    pub async fn sync(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Flush(ack_tx))
            .map_err(|_| anyhow!("write-ahead log is closed"))?;
        ack_rx
            .await
            .map_err(|_| anyhow!("write-ahead log writer stopped"))?
            .context("flush write-ahead log")
    }

    /// Every note with an unconfirmed edit inside the recovery window.
    pub async fn recover_unpersisted(&self) -> Result<BTreeMap<NoteId, RecoveredChange>> {
        if let Err(err) = self.sync().await {
            debug!(error = %err, "recovering without a final flush");
        }
        replay_dir(&self.dir, self.recovery_window, Utc::now()).await
    }

    pub async fn recover_note(&self, note_id: &NoteId) -> Result<Option<RecoveredChange>> {
        Ok(self.recover_unpersisted().await?.remove(note_id))
    }

    /// Log files currently on disk, oldest first.
    pub async fn log_files(&self) -> Result<Vec<PathBuf>> {
        Ok(list_log_files(&self.dir)
            .await?
            .into_iter()
            .map(|(_, path)| path)
            .collect())
    }

    /// Final flush with a deadline; the writer is aborted if it does not
    /// drain in time.
    pub async fn shutdown(&self) {
        let Some(mut handle) = self.writer.lock().take() else {
            return;
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(WalCommand::Shutdown(ack_tx)).is_ok() {
            let _ = tokio::time::timeout(self.shutdown_timeout, ack_rx).await;
        }
        match tokio::time::timeout(self.shutdown_timeout, &mut handle).await {
            Ok(_) => info!(dir = %self.dir.display(), "write-ahead log closed"),
            Err(_) => {
                warn!(
                    timeout_ms = self.shutdown_timeout.as_millis() as u64,
                    "write-ahead log writer did not drain in time; cancelling"
                );
                handle.abort();
            }
        }
    }
}

// ── Writer task ──────────────────────────────────────────────────────────────

struct LogFiles {
    dir: PathBuf,
    day: Option<NaiveDate>,
    retention_days: u64,
}

impl LogFiles {
    async fn append(&mut self, entries: &[WalEntry]) -> io::Result<()> {
        let today = Utc::now().date_naive();
        if self.day != Some(today) {
            self.day = Some(today);
            prune_expired(&self.dir, today, self.retention_days).await;
        }

        let mut payload = String::new();
        for entry in entries {
            let line = serde_json::to_string(entry).map_err(io::Error::other)?;
            payload.push_str(&line);
            payload.push('\n');
        }

        let path = self.dir.join(log_file_name(today));
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(payload.as_bytes()).await?;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }
}

async fn run_writer(
    mut files: LogFiles,
    mut rx: mpsc::UnboundedReceiver<WalCommand>,
    batch_size: usize,
    flush_interval: Duration,
) {
    let mut buffer: Vec<WalEntry> = Vec::with_capacity(batch_size);
    let mut tick = tokio::time::interval(flush_interval);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(WalCommand::Append(entry)) => {
                    buffer.push(entry);
                    if buffer.len() >= batch_size {
                        let _ = flush(&mut files, &mut buffer).await;
                    }
                }
                Some(WalCommand::Flush(ack)) => {
                    let _ = ack.send(flush(&mut files, &mut buffer).await);
                }
                Some(WalCommand::Shutdown(ack)) => {
                    let _ = flush(&mut files, &mut buffer).await;
                    let _ = ack.send(());
                    break;
                }
                None => {
                    let _ = flush(&mut files, &mut buffer).await;
                    break;
                }
            },
            _ = tick.tick() => {
                if !buffer.is_empty() {
                    let _ = flush(&mut files, &mut buffer).await;
                }
            }
        }
    }
}

/// Entries stay buffered when the write fails and go out with the next flush.
async fn flush(files: &mut LogFiles, buffer: &mut Vec<WalEntry>) -> io::Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    match files.append(buffer).await {
        Ok(()) => {
            debug!(entries = buffer.len(), "write-ahead log flushed");
            buffer.clear();
            Ok(())
        }
        Err(err) => {
            error!(
                entries = buffer.len(),
                dir = %files.dir.display(),
                error = %err,
                "write-ahead log flush failed; keeping entries buffered"
            );
            Err(err)
        }
    }
}

// ── Files ────────────────────────────────────────────────────────────────────

pub fn log_file_name(day: NaiveDate) -> String {
    format!("{FILE_PREFIX}{}{FILE_SUFFIX}", day.format("%Y-%m-%d"))
}

fn parse_log_date(name: &str) -> Option<NaiveDate> {
    let date = name.strip_prefix(FILE_PREFIX)?.strip_suffix(FILE_SUFFIX)?;
    NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

async fn list_log_files(dir: &Path) -> Result<Vec<(NaiveDate, PathBuf)>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("list {}", dir.display())),
    };
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if let Some(day) = parse_log_date(&name) {
            files.push((day, entry.path()));
        }
    }
    files.sort();
    Ok(files)
}

async fn prune_expired(dir: &Path, today: NaiveDate, retention_days: u64) {
    let Some(cutoff) = today.checked_sub_days(chrono::Days::new(retention_days)) else {
        return;
    };
    let files = match list_log_files(dir).await {
        Ok(files) => files,
        Err(err) => {
            warn!(error = %err, "could not list write-ahead log files for pruning");
            return;
        }
    };
    for (day, path) in files.into_iter().filter(|(day, _)| *day < cutoff) {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => info!(path = %path.display(), %day, "pruned expired write-ahead log"),
            Err(err) => warn!(path = %path.display(), error = %err, "could not prune write-ahead log"),
        }
    }
}

/// Replay every entry written inside `window` before `now`.
///
/// Lines that are not valid UTF-8 or not valid JSON (a torn tail after a
/// crash mid-append) are skipped; they never abort the replay.
pub async fn replay_dir(
    dir: &Path,
    window: chrono::Duration,
    now: DateTime<Utc>,
) -> Result<BTreeMap<NoteId, RecoveredChange>> {
    let cutoff = now - window;
    let oldest = cutoff.date_naive();
    let mut pending = BTreeMap::new();
    let mut skipped = 0usize;

    for (_, path) in list_log_files(dir)
        .await?
        .into_iter()
        .filter(|(day, _)| *day >= oldest)
    {
        let raw = tokio::fs::read(&path)
            .await
            .with_context(|| format!("read write-ahead log {}", path.display()))?;
        for (line_idx, bytes) in raw.split(|b| *b == b'\n').enumerate() {
            let entry = match decode_line(bytes) {
                Ok(None) => continue,
                Ok(Some(entry)) => entry,
                Err(err) => {
                    skipped += 1;
                    warn!(
                        line = line_idx + 1,
                        error = %err,
                        path = %path.display(),
                        "malformed write-ahead log line; skipping"
                    );
                    continue;
                }
            };
            if entry.timestamp < cutoff {
                continue;
            }
            apply(&mut pending, entry);
        }
    }

    if skipped > 0 || !pending.is_empty() {
        info!(
            unpersisted = pending.len(),
            skipped_lines = skipped,
            "write-ahead log replayed"
        );
    }
    Ok(pending)
}

fn decode_line(bytes: &[u8]) -> Result<Option<WalEntry>> {
    let line = std::str::from_utf8(bytes)?.trim();
    if line.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(line)?))
}

fn apply(pending: &mut BTreeMap<NoteId, RecoveredChange>, entry: WalEntry) {
    match entry.kind {
        WalEntryKind::Change => {
            let Some(content) = entry.content else {
                return;
            };
            pending.insert(
                entry.note_id,
                RecoveredChange {
                    content,
                    timestamp: entry.timestamp,
                },
            );
        }
        WalEntryKind::Persisted => {
            pending.remove(&entry.note_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> WalConfig {
        WalConfig {
            batch_size: 100,
            flush_interval_ms: 60_000,
            shutdown_flush_timeout_ms: 2_000,
            ..WalConfig::default()
        }
    }

    fn today_file(dir: &Path) -> PathBuf {
        dir.join(log_file_name(Utc::now().date_naive()))
    }

    #[test]
    fn file_names_round_trip_dates() {
        let day = NaiveDate::from_ymd_opt(2026, 3, 9).unwrap();
        let name = log_file_name(day);
        assert_eq!(name, "persistence-2026-03-09.log");
        assert_eq!(parse_log_date(&name), Some(day));
        assert_eq!(parse_log_date("persistence-garbage.log"), None);
        assert_eq!(parse_log_date("other-2026-03-09.log"), None);
    }

    #[tokio::test]
    async fn unpersisted_changes_are_recovered() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path(), &config()).await.unwrap();
        for i in 0..5 {
            wal.log_change(&NoteId::new(format!("n{i}")), &format!("body {i}")).unwrap();
        }
        wal.shutdown().await;

        // A fresh reader stands in for the next process start.
        let recovered = replay_dir(dir.path(), chrono::Duration::hours(24), Utc::now())
            .await
            .unwrap();
        assert_eq!(recovered.len(), 5);
        assert_eq!(recovered[&NoteId::from("n3")].content, "body 3");
    }

    #[tokio::test]
    async fn persisted_marker_cancels_changes() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path(), &config()).await.unwrap();
        let a = NoteId::from("a");
        let b = NoteId::from("b");
        wal.log_change(&a, "a1").unwrap();
        wal.log_change(&b, "b1").unwrap();
        wal.mark_persisted(&a).unwrap();
        wal.log_change(&b, "b2").unwrap();

        let recovered = wal.recover_unpersisted().await.unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[&b].content, "b2");
        assert!(wal.recover_note(&a).await.unwrap().is_none());
        wal.shutdown().await;
    }

    #[tokio::test]
    async fn change_after_persisted_is_pending_again() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path(), &config()).await.unwrap();
        let a = NoteId::from("a");
        wal.log_change(&a, "v1").unwrap();
        wal.mark_persisted(&a).unwrap();
        wal.log_change(&a, "v2").unwrap();
        let change = wal.recover_note(&a).await.unwrap().unwrap();
        assert_eq!(change.content, "v2");
        wal.shutdown().await;
    }

    #[tokio::test]
    async fn lines_use_the_documented_field_names() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path(), &config()).await.unwrap();
        wal.log_change(&NoteId::from("a"), "hi").unwrap();
        wal.sync().await.unwrap();
        let raw = std::fs::read_to_string(today_file(dir.path())).unwrap();
        let line = raw.lines().next().unwrap();
        for field in ["\"Type\":\"Change\"", "\"NoteId\":\"a\"", "\"Content\":\"hi\"", "\"Timestamp\""] {
            assert!(line.contains(field), "missing {field} in {line}");
        }
        wal.shutdown().await;
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path(), &config()).await.unwrap();
        wal.log_change(&NoteId::from("a"), "valid").unwrap();
        wal.sync().await.unwrap();
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(today_file(dir.path()))
                .unwrap();
            writeln!(f, "{{invalid json garbage").unwrap();
            writeln!(f).unwrap();
        }
        wal.log_change(&NoteId::from("b"), "also valid").unwrap();

        let recovered = wal.recover_unpersisted().await.unwrap();
        assert_eq!(recovered.len(), 2);
        wal.shutdown().await;
    }

    #[tokio::test]
    async fn torn_multibyte_tail_keeps_earlier_entries() {
        let dir = TempDir::new().unwrap();
        let good = serde_json::to_string(&WalEntry::change(&NoteId::from("a"), "kept")).unwrap();
        let torn = serde_json::to_string(&WalEntry::change(&NoteId::from("b"), "café")).unwrap();
        let cut = torn.find('é').unwrap() + 1;

        let mut raw = format!("{good}\n").into_bytes();
        raw.extend_from_slice(&torn.as_bytes()[..cut]);
        std::fs::write(today_file(dir.path()), raw).unwrap();

        let recovered = replay_dir(dir.path(), chrono::Duration::hours(24), Utc::now())
            .await
            .unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[&NoteId::from("a")].content, "kept");
    }

    #[tokio::test]
    async fn entries_older_than_the_window_are_ignored() {
        let dir = TempDir::new().unwrap();
        let now = Utc::now();
        let mut stale = WalEntry::change(&NoteId::from("stale"), "old edit");
        stale.timestamp = now - chrono::Duration::hours(30);
        let fresh = WalEntry::change(&NoteId::from("fresh"), "new edit");
        // Both lines sit in yesterday's file, which is inside the window.
        let yesterday = (now - chrono::Duration::hours(12)).date_naive();
        std::fs::write(
            dir.path().join(log_file_name(yesterday)),
            format!(
                "{}\n{}\n",
                serde_json::to_string(&stale).unwrap(),
                serde_json::to_string(&fresh).unwrap()
            ),
        )
        .unwrap();

        let recovered = replay_dir(dir.path(), chrono::Duration::hours(24), now)
            .await
            .unwrap();
        assert_eq!(recovered.len(), 1);
        assert!(recovered.contains_key(&NoteId::from("fresh")));
    }

    #[tokio::test]
    async fn batch_size_triggers_flush_without_sync() {
        let dir = TempDir::new().unwrap();
        let cfg = WalConfig {
            batch_size: 2,
            ..config()
        };
        let wal = WriteAheadLog::open(dir.path(), &cfg).await.unwrap();
        wal.log_change(&NoteId::from("a"), "1").unwrap();
        wal.log_change(&NoteId::from("b"), "2").unwrap();

        let path = today_file(dir.path());
        let mut lines = 0;
        for _ in 0..100 {
            lines = std::fs::read_to_string(&path)
                .map(|raw| raw.lines().count())
                .unwrap_or(0);
            if lines == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(lines, 2);
        wal.shutdown().await;
    }

    #[tokio::test]
    async fn periodic_tick_flushes_small_batches() {
        let dir = TempDir::new().unwrap();
        let cfg = WalConfig {
            flush_interval_ms: 20,
            ..config()
        };
        let wal = WriteAheadLog::open(dir.path(), &cfg).await.unwrap();
        wal.log_change(&NoteId::from("a"), "1").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(today_file(dir.path()).exists());
        wal.shutdown().await;
    }

    #[tokio::test]
    async fn recovery_window_excludes_old_files() {
        let dir = TempDir::new().unwrap();
        let old_day = Utc::now().date_naive() - chrono::Days::new(3);
        let old = WalEntry::change(&NoteId::from("old"), "stale");
        std::fs::write(
            dir.path().join(log_file_name(old_day)),
            format!("{}\n", serde_json::to_string(&old).unwrap()),
        )
        .unwrap();

        let recovered = replay_dir(dir.path(), chrono::Duration::hours(24), Utc::now())
            .await
            .unwrap();
        assert!(recovered.is_empty());
        let wide = replay_dir(dir.path(), chrono::Duration::days(5), Utc::now())
            .await
            .unwrap();
        assert_eq!(wide.len(), 1);
    }

    #[tokio::test]
    async fn rotation_prunes_expired_files() {
        let dir = TempDir::new().unwrap();
        let today = Utc::now().date_naive();
        let expired = dir.path().join(log_file_name(today - chrono::Days::new(10)));
        let retained = dir.path().join(log_file_name(today - chrono::Days::new(2)));
        std::fs::write(&expired, "").unwrap();
        std::fs::write(&retained, "").unwrap();

        let wal = WriteAheadLog::open(dir.path(), &config()).await.unwrap();
        wal.log_change(&NoteId::from("a"), "x").unwrap();
        wal.sync().await.unwrap();

        assert!(!expired.exists());
        assert!(retained.exists());
        assert_eq!(wal.log_files().await.unwrap().len(), 2);
        wal.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_and_closes() {
        let dir = TempDir::new().unwrap();
        let wal = WriteAheadLog::open(dir.path(), &config()).await.unwrap();
        wal.log_change(&NoteId::from("a"), "buffered").unwrap();
        wal.shutdown().await;
        assert!(today_file(dir.path()).exists());
        assert!(wal.log_change(&NoteId::from("a"), "late").is_err());
        assert!(wal.sync().await.is_err());
    }
}
