//! Filesystem notifications for open notes, debounced per note.
//!
//! One `notify` watcher covers every open note.  Each note's parent
//! directory is watched non-recursively (reference counted, since notes
//! share folders) so that editors which save by rename are still seen.
//! Raw events are mapped back to note ids and fed to a debounce task that
//! emits an id once no further event for it has arrived for the window.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::note::{NoteId, normalize_path};

struct Registrations {
    watcher: Option<RecommendedWatcher>,
    files: HashMap<NoteId, PathBuf>,
    dirs: HashMap<PathBuf, usize>,
}

pub struct ChangeWatcher {
    registrations: Mutex<Registrations>,
    targets: Arc<RwLock<HashMap<PathBuf, NoteId>>>,
    raw_tx: mpsc::UnboundedSender<NoteId>,
    debounce_task: Mutex<Option<JoinHandle<()>>>,
}

impl ChangeWatcher {
    /// Start the backend and the debounce task.  Settled note ids arrive on
    /// the returned receiver.
    pub fn start(debounce: Duration) -> Result<(Self, mpsc::UnboundedReceiver<NoteId>)> {
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        let targets: Arc<RwLock<HashMap<PathBuf, NoteId>>> = Arc::default();

        let callback_targets = Arc::clone(&targets);
        let callback_tx = raw_tx.clone();
        let watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                if matches!(event.kind, EventKind::Access(_)) {
                    return;
                }
                let targets = callback_targets.read();
                for path in &event.paths {
                    if let Some(id) = targets.get(&normalize_path(path)) {
                        let _ = callback_tx.send(id.clone());
                    }
                }
            }
            Err(err) => warn!(error = %err, "filesystem watcher error"),
        })
        .context("create filesystem watcher")?;

        let task = tokio::spawn(debounce_loop(raw_rx, settled_tx, debounce));

        Ok((
            Self {
                registrations: Mutex::new(Registrations {
                    watcher: Some(watcher),
                    files: HashMap::new(),
                    dirs: HashMap::new(),
                }),
                targets,
                raw_tx,
                debounce_task: Mutex::new(Some(task)),
            },
            settled_rx,
        ))
    }

    /// Watch `path` (already normalized) on behalf of `id`.
    pub fn watch(&self, id: &NoteId, path: &Path) -> Result<()> {
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .with_context(|| format!("{} has no parent directory", path.display()))?;

        let mut reg = self.registrations.lock();
        if reg.files.contains_key(id) {
            return Ok(());
        }
        let already_watched = reg.dirs.get(&dir).copied().unwrap_or(0) > 0;
        if !already_watched {
            let Some(watcher) = reg.watcher.as_mut() else {
                anyhow::bail!("watcher is stopped");
            };
            watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .with_context(|| format!("watch {}", dir.display()))?;
        }
        *reg.dirs.entry(dir).or_insert(0) += 1;
        reg.files.insert(id.clone(), path.to_path_buf());
        self.targets.write().insert(path.to_path_buf(), id.clone());
        debug!(note_id = %id, path = %path.display(), "watching note");
        Ok(())
    }

    pub fn unwatch(&self, id: &NoteId) {
        let mut reg = self.registrations.lock();
        let Some(path) = reg.files.remove(id) else {
            return;
        };
        self.targets.write().remove(&path);
        let Some(dir) = path.parent().map(Path::to_path_buf) else {
            return;
        };
        let remaining = match reg.dirs.get_mut(&dir) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => return,
        };
        if remaining == 0 {
            reg.dirs.remove(&dir);
            if let Some(watcher) = reg.watcher.as_mut() {
                if let Err(err) = watcher.unwatch(&dir) {
                    debug!(dir = %dir.display(), error = %err, "unwatch failed");
                }
            }
        }
    }

    /// Feed a change for `id` through the debounce as if the backend had
    /// reported it.
    pub fn signal(&self, id: &NoteId) {
        let _ = self.raw_tx.send(id.clone());
    }

    pub fn watched_count(&self) -> usize {
        self.registrations.lock().files.len()
    }

    pub fn stop(&self) {
        {
            let mut reg = self.registrations.lock();
            reg.watcher = None;
            reg.files.clear();
            reg.dirs.clear();
        }
        self.targets.write().clear();
        if let Some(task) = self.debounce_task.lock().take() {
            task.abort();
        }
    }
}

async fn debounce_loop(
    mut raw: mpsc::UnboundedReceiver<NoteId>,
    settled: mpsc::UnboundedSender<NoteId>,
    window: Duration,
) {
    let mut deadlines: HashMap<NoteId, Instant> = HashMap::new();
    loop {
        let next = deadlines.values().min().copied();
        let wake = tokio::time::sleep_until(next.unwrap_or_else(|| Instant::now() + window));
        tokio::select! {
            id = raw.recv() => match id {
                Some(id) => {
                    deadlines.insert(id, Instant::now() + window);
                }
                None => break,
            },
            _ = wake, if next.is_some() => {
                let now = Instant::now();
                let due: Vec<NoteId> = deadlines
                    .iter()
                    .filter(|(_, at)| **at <= now)
                    .map(|(id, _)| id.clone())
                    .collect();
                for id in due {
                    deadlines.remove(&id);
                    if settled.send(id).is_err() {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn next_settled(rx: &mut mpsc::UnboundedReceiver<NoteId>, within: Duration) -> Option<NoteId> {
        tokio::time::timeout(within, rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn bursts_collapse_into_one_notification() {
        let (watcher, mut rx) = ChangeWatcher::start(Duration::from_millis(50)).unwrap();
        let id = NoteId::from("burst");
        for _ in 0..5 {
            watcher.signal(&id);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(next_settled(&mut rx, Duration::from_secs(2)).await, Some(id));
        assert_eq!(next_settled(&mut rx, Duration::from_millis(200)).await, None);
        watcher.stop();
    }

    #[tokio::test]
    async fn notes_debounce_independently() {
        let (watcher, mut rx) = ChangeWatcher::start(Duration::from_millis(30)).unwrap();
        watcher.signal(&NoteId::from("a"));
        watcher.signal(&NoteId::from("b"));
        let mut seen = vec![
            next_settled(&mut rx, Duration::from_secs(2)).await.unwrap(),
            next_settled(&mut rx, Duration::from_secs(2)).await.unwrap(),
        ];
        seen.sort();
        assert_eq!(seen, [NoteId::from("a"), NoteId::from("b")]);
        watcher.stop();
    }

    #[tokio::test]
    async fn external_write_is_reported_for_the_watched_file() {
        let dir = TempDir::new().unwrap();
        let path = normalize_path(&dir.path().join("note.md"));
        std::fs::write(&path, "v1").unwrap();

        let (watcher, mut rx) = ChangeWatcher::start(Duration::from_millis(50)).unwrap();
        let id = NoteId::from_path(&path);
        watcher.watch(&id, &path).unwrap();
        // A sibling file in the same directory is not ours.
        std::fs::write(dir.path().join("other.md"), "noise").unwrap();
        std::fs::write(&path, "external").unwrap();

        assert_eq!(next_settled(&mut rx, Duration::from_secs(5)).await, Some(id.clone()));
        watcher.unwatch(&id);
        assert_eq!(watcher.watched_count(), 0);
        watcher.stop();
    }

    #[tokio::test]
    async fn shared_directory_is_watched_once() {
        let dir = TempDir::new().unwrap();
        let a = normalize_path(&dir.path().join("a.md"));
        let b = normalize_path(&dir.path().join("b.md"));
        let (watcher, _rx) = ChangeWatcher::start(Duration::from_millis(50)).unwrap();
        watcher.watch(&NoteId::from("a"), &a).unwrap();
        watcher.watch(&NoteId::from("b"), &b).unwrap();
        assert_eq!(watcher.registrations.lock().dirs.len(), 1);
        watcher.unwatch(&NoteId::from("a"));
        assert_eq!(watcher.registrations.lock().dirs.len(), 1);
        watcher.unwatch(&NoteId::from("b"));
        assert!(watcher.registrations.lock().dirs.is_empty());
        watcher.stop();
    }
}
