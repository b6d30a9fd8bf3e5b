use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Where note content lives on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory for primary note files.
    pub root: String,
    /// Extension used for primary note files (without the dot).
    pub extension: String,
    /// Root of the id-keyed durable store (`<id>.<data_extension>` plus a
    /// `<id>.meta` sidecar, with `.temp/` and `.wal/` underneath).
    pub data_path: String,
    pub data_extension: String,
    /// Destination for last-resort copies written when a user-triggered save
    /// exhausts its retries.
    pub emergency_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: "notes".to_string(),
            extension: "md".to_string(),
            data_path: ".notekeep/data".to_string(),
            data_extension: "rtf".to_string(),
            emergency_dir: ".notekeep/emergency".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SaveConfig {
    /// Quiet period after the last edit before an auto-save is queued.
    pub auto_save_delay_ms: u64,
    /// Capacity of the bounded request channel feeding the save processor.
    pub queue_capacity: usize,
    /// How long the processor waits on an empty channel before re-checking
    /// for shutdown.
    pub poll_interval_ms: u64,
    /// Content longer than this many bytes is compared by SHA-256 digest
    /// instead of by string equality when computing dirty state.
    pub large_content_threshold: usize,
    /// Modification-time skew tolerated before a file is considered changed
    /// by someone else.  Filesystems with coarse timestamps need ~1s.
    pub mtime_tolerance_ms: u64,
    /// Read each temp file back and compare it byte-for-byte before the
    /// rename.
    pub verify_writes: bool,
    /// Attempts per atomic write when the target is locked by another process.
    pub write_attempts: u32,
    /// Fixed delay between atomic write attempts.
    pub write_retry_delay_ms: u64,
    /// Base delay for the durable store's linear backoff (`base × attempt`).
    pub durable_backoff_ms: u64,
    /// Hard limit for draining the save queue during shutdown.
    pub shutdown_timeout_ms: u64,
}

impl Default for SaveConfig {
    fn default() -> Self {
        Self {
            auto_save_delay_ms: 2_000,
            queue_capacity: 256,
            poll_interval_ms: 100,
            large_content_threshold: 64 * 1024,
            mtime_tolerance_ms: 1_000,
            verify_writes: true,
            write_attempts: 3,
            write_retry_delay_ms: 50,
            durable_backoff_ms: 100,
            shutdown_timeout_ms: 5_000,
        }
    }
}

impl SaveConfig {
    pub fn auto_save_delay(&self) -> Duration {
        Duration::from_millis(self.auto_save_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn mtime_tolerance(&self) -> Duration {
        Duration::from_millis(self.mtime_tolerance_ms)
    }

    pub fn write_retry_delay(&self) -> Duration {
        Duration::from_millis(self.write_retry_delay_ms)
    }

    pub fn durable_backoff(&self) -> Duration {
        Duration::from_millis(self.durable_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

/// Per-path failure gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Seconds an open breaker rejects saves before closing again.
    pub cooldown_secs: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown_secs: 30,
        }
    }
}

impl CircuitConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WalConfig {
    /// Directory holding `persistence-<yyyy-MM-dd>.log` files.
    pub dir: String,
    /// Buffered entries that force an immediate flush.
    pub batch_size: usize,
    /// Periodic flush tick.  Together with `batch_size` this bounds the
    /// window of edits that a crash can lose.
    pub flush_interval_ms: u64,
    /// Only log files from this many hours back are replayed on recovery.
    pub recovery_window_hours: u64,
    /// Log files older than this are deleted when the log rotates.
    pub retention_days: u64,
    /// How long shutdown waits for the final flush before cancelling the
    /// writer task.
    pub shutdown_flush_timeout_ms: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: ".notekeep/persistence".to_string(),
            batch_size: 100,
            flush_interval_ms: 1_000,
            recovery_window_hours: 24,
            retention_days: 7,
            shutdown_flush_timeout_ms: 3_000,
        }
    }
}

impl WalConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn shutdown_flush_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_flush_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Watch open notes for changes made by other processes.
    pub enabled: bool,
    /// Notifications for one note are coalesced until this much quiet time
    /// has passed.
    pub debounce_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            debounce_ms: 500,
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
    /// When non-empty, logs are also written to a daily rolling file here.
    pub log_dir: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_dir: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub save: SaveConfig,
    pub circuit: CircuitConfig,
    pub wal: WalConfig,
    pub watch: WatchConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)
                .with_context(|| format!("parse config {}", path.display()))?;
        }

        if let Ok(value) = env::var("NOTEKEEP_ROOT") {
            if !value.is_empty() {
                config.storage.root = value;
            }
        }

        if let Ok(value) = env::var("NOTEKEEP_WAL_DIR") {
            if !value.is_empty() {
                config.wal.dir = value;
            }
        }

        if let Ok(value) = env::var("NOTEKEEP_LOG_LEVEL") {
            if !value.is_empty() {
                config.telemetry.log_level = value;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn wal_dir(&self) -> PathBuf {
        PathBuf::from(&self.wal.dir)
    }

    /// The content store keeps its own log under the data root.
    pub fn store_wal_dir(&self) -> PathBuf {
        PathBuf::from(&self.storage.data_path).join(".wal")
    }

    pub fn log_dir(&self) -> Option<PathBuf> {
        let dir = self.telemetry.log_dir.trim();
        (!dir.is_empty()).then(|| PathBuf::from(dir))
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────
