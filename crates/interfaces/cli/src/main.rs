mod note_cmds;
mod store_cmds;

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use fs2::FileExt;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use notekeep_config::AppConfig;

const LOCK_FILE: &str = "engine.lock";

#[derive(Debug, Parser)]
#[command(
    name = "notekeep",
    version,
    about = "Crash-safe note saving with a write-ahead log"
)]
struct Cli {
    /// Configuration file (missing means defaults).
    #[arg(long, global = true, default_value = "config/default.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Open a note, replace its content and save it.
    Write {
        #[arg(value_name = "PATH")]
        path: PathBuf,
        /// New content; read from stdin when omitted.
        #[arg(long)]
        content: Option<String>,
    },
    /// Print a note and whether the log holds newer unsaved edits for it.
    Show {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Watch notes for external changes and print lifecycle events until
    /// Ctrl-C, then flush dirty notes.
    Watch {
        #[arg(value_name = "PATH", required = true)]
        paths: Vec<PathBuf>,
    },
    /// List edits the write-ahead log holds that never reached disk.
    Recover {
        /// Write recovered content back to notes whose file can be found.
        #[arg(long)]
        apply: bool,
    },
    /// Content + metadata store.
    Store {
        #[command(subcommand)]
        command: StoreCommands,
    },
    /// Show effective configuration, log files and lock state.
    Doctor,
    /// Write the effective configuration to the `--config` path.
    Init {
        /// Replace an existing file.
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Subcommand)]
enum StoreCommands {
    Put {
        #[arg(value_name = "ID")]
        id: String,
        #[arg(long, default_value = "")]
        title: String,
        /// Content; read from stdin when omitted.
        #[arg(long)]
        content: Option<String>,
    },
    Get {
        #[arg(value_name = "ID")]
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    let _log_guard = init_tracing(&config)?;

    match cli.command {
        Commands::Doctor => doctor(&config, &cli.config),
        Commands::Init { force } => init(&config, &cli.config, force),
        command => {
            let lock_dir = match &command {
                Commands::Store { .. } => config.store_wal_dir(),
                _ => config.wal_dir(),
            };
            let _lock = acquire_engine_lock(&lock_dir)?;
            match command {
                Commands::Write { path, content } => {
                    note_cmds::write(&config, &path, read_content(content)?).await
                }
                Commands::Show { path } => note_cmds::show(&config, &path).await,
                Commands::Watch { paths } => note_cmds::watch(&config, &paths).await,
                Commands::Recover { apply } => note_cmds::recover(&config, apply).await,
                Commands::Store { command } => match command {
                    StoreCommands::Put { id, title, content } => {
                        store_cmds::put(&config, &id, &title, read_content(content)?).await
                    }
                    StoreCommands::Get { id } => store_cmds::get(&config, &id).await,
                },
                Commands::Doctor | Commands::Init { .. } => Ok(()),
            }
        }
    }
}

/// Stderr by default; a daily rolling file when `telemetry.log_dir` is set.
/// `RUST_LOG` wins over the configured level.
fn init_tracing(config: &AppConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));

    match config.log_dir() {
        Some(dir) => {
            fs::create_dir_all(&dir)
                .with_context(|| format!("create log directory {}", dir.display()))?;
            let appender = tracing_appender::rolling::daily(dir, "notekeep.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
            Ok(None)
        }
    }
}

/// Only one process may append to a WAL directory at a time.  The lock is
/// released when the returned file is dropped.
fn acquire_engine_lock(dir: &Path) -> Result<File> {
    fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    let path = dir.join(LOCK_FILE);
    let lock_file = File::create(&path)?;
    if lock_file.try_lock_exclusive().is_err() {
        bail!(
            "another notekeep process is using this log (lock held at {})",
            path.display()
        );
    }
    Ok(lock_file)
}

fn lock_state(dir: &Path) -> &'static str {
    match File::open(dir.join(LOCK_FILE)) {
        Ok(file) => match file.try_lock_exclusive() {
            Ok(()) => "free",
            Err(_) => "held by another process",
        },
        Err(_) => "free",
    }
}

fn read_content(content: Option<String>) -> Result<String> {
    match content {
        Some(content) => Ok(content),
        None => std::io::read_to_string(std::io::stdin()).context("read content from stdin"),
    }
}

fn init(config: &AppConfig, config_path: &Path, force: bool) -> Result<()> {
    if config_path.exists() && !force {
        bail!("{} already exists (use --force to replace it)", config_path.display());
    }
    config
        .save_to(config_path)
        .with_context(|| format!("write config {}", config_path.display()))?;
    println!("wrote {}", config_path.display());
    Ok(())
}

fn doctor(config: &AppConfig, config_path: &Path) -> Result<()> {
    println!("notekeep doctor");
    println!(
        "- config file: {} ({})",
        config_path.display(),
        if config_path.exists() { "found" } else { "missing, using defaults" }
    );
    println!("- notes root: {}", config.storage.root);
    println!("- data path: {}", config.storage.data_path);
    println!("- emergency copies: {}", config.storage.emergency_dir);

    let wal_dir = config.wal_dir();
    println!("- write-ahead log: {}", wal_dir.display());
    let mut logs: Vec<String> = match fs::read_dir(&wal_dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().to_string())
            .filter(|name| name.starts_with("persistence-") && name.ends_with(".log"))
            .collect(),
        Err(_) => Vec::new(),
    };
    logs.sort();
    if logs.is_empty() {
        println!("  (no log files)");
    }
    for name in &logs {
        let size = fs::metadata(wal_dir.join(name)).map(|m| m.len()).unwrap_or(0);
        println!("  {name} ({size} bytes)");
    }

    println!("- engine lock: {}", lock_state(&wal_dir));
    let store_wal = config.store_wal_dir();
    println!("- store log: {} (lock {})", store_wal.display(), lock_state(&store_wal));
    println!();
    println!("{}", serde_json::to_string_pretty(config)?);
    Ok(())
}
