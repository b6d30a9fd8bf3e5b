use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use notekeep_config::AppConfig;
use notekeep_persistence::{NoteId, SaveEvent, SaveManager, normalize_path};

pub(crate) async fn write(config: &AppConfig, path: &Path, content: String) -> Result<()> {
    let manager = SaveManager::start(config).await?;
    let id = manager.open_note(path).await?;
    manager.update_content(&id, content);
    let saved = manager.save_note(&id).await;
    manager.shutdown().await;

    if !saved {
        bail!(
            "could not save {}; the edit is kept in the write-ahead log (see `notekeep recover`)",
            path.display()
        );
    }
    println!("saved {} ({id})", path.display());
    Ok(())
}

pub(crate) async fn show(config: &AppConfig, path: &Path) -> Result<()> {
    let manager = SaveManager::start(config).await?;
    let id = manager.open_note(path).await?;
    let content = manager.get_content(&id).unwrap_or_default();
    let pending = manager.recover_unpersisted().await?.remove(&id);
    manager.shutdown().await;

    println!("note: {id}");
    println!("path: {}", normalize_path(path).display());
    match pending {
        Some(change) if change.content != content => println!(
            "dirty: yes (unsaved edit from {} in the write-ahead log)",
            change.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
        ),
        _ => println!("dirty: no"),
    }
    println!("---");
    print!("{content}");
    if !content.ends_with('\n') {
        println!();
    }
    Ok(())
}

pub(crate) async fn watch(config: &AppConfig, paths: &[PathBuf]) -> Result<()> {
    if !config.watch.enabled {
        warn!("watching is disabled in config; only save events will be shown");
    }
    let manager = SaveManager::start(config).await?;
    let mut events = manager.subscribe();
    for path in paths {
        let id = manager.open_note(path).await?;
        println!("watching {} ({id})", path.display());
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => print_event(&event)?,
                Err(RecvError::Lagged(missed)) => warn!(missed, "event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    let result = manager.save_all_dirty().await;
    manager.shutdown().await;
    println!(
        "flushed: {} saved, {} failed",
        result.success_count,
        result.failed_ids.len()
    );
    for id in &result.failed_ids {
        println!("  failed: {id}");
    }
    Ok(())
}

fn print_event(event: &SaveEvent) -> Result<()> {
    println!("{}", serde_json::to_string(event)?);
    if let SaveEvent::ExternalChangeDetected { path, .. } = event {
        eprintln!(
            "{} changed outside notekeep; saves to it are refused until resolved",
            path.display()
        );
    }
    Ok(())
}

pub(crate) async fn recover(config: &AppConfig, apply: bool) -> Result<()> {
    let manager = SaveManager::start(config).await?;
    let recovered = manager.recover_unpersisted().await?;
    if recovered.is_empty() {
        println!("nothing to recover");
        manager.shutdown().await;
        return Ok(());
    }

    // Ids are path digests, so the only way back to a file is to hash the
    // candidates under the notes root.
    let known = index_notes(Path::new(&config.storage.root), &config.storage.extension);
    let mut restored = 0;
    for (id, change) in &recovered {
        let path = known.get(id);
        let preview: String = change.content.chars().take(60).collect();
        println!(
            "{id}  {}  {}  {:?}",
            change.timestamp.format("%Y-%m-%d %H:%M:%S"),
            path.map(|p| p.display().to_string())
                .unwrap_or_else(|| "(unknown path)".to_string()),
            preview
        );
        if !apply {
            continue;
        }
        let Some(path) = path else {
            continue;
        };
        let opened = manager.open_note(path).await?;
        manager.update_content(&opened, change.content.clone());
        if manager.save_note(&opened).await {
            restored += 1;
        } else {
            warn!(note_id = %opened, "recovered content could not be saved");
        }
    }
    manager.shutdown().await;

    if apply {
        println!("restored {restored} of {} notes", recovered.len());
    }
    Ok(())
}

fn index_notes(root: &Path, extension: &str) -> HashMap<NoteId, PathBuf> {
    let mut out = HashMap::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.extension().is_some_and(|ext| ext == extension) {
                out.insert(NoteId::from_path(&path), path);
            }
        }
    }
    out
}
