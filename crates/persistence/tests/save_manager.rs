use std::path::Path;
use std::time::{Duration, SystemTime};

use notekeep_config::AppConfig;
use notekeep_persistence::{
    ConflictResolution, SaveError, SaveEvent, SaveManager, SaveOutcome, SavePriority,
};
use tempfile::TempDir;
use tokio::sync::broadcast;

fn config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.storage.root = dir.join("notes").to_string_lossy().to_string();
    config.storage.emergency_dir = dir.join("emergency").to_string_lossy().to_string();
    config.wal.dir = dir.join("wal").to_string_lossy().to_string();
    config.wal.flush_interval_ms = 20;
    config.watch.enabled = false;
    config.watch.debounce_ms = 50;
    config.save.auto_save_delay_ms = 60_000;
    config.save.poll_interval_ms = 10;
    config.save.write_retry_delay_ms = 1;
    config
}

/// Simulate another process rewriting the file, with an mtime well past the
/// tolerance regardless of filesystem timestamp granularity.
fn write_externally(path: &Path, content: &str) {
    std::fs::write(path, content).unwrap();
    bump_mtime(path);
}

fn bump_mtime(path: &Path) {
    let file = std::fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(5))
        .unwrap();
}

fn set_read_only(path: &Path, read_only: bool) {
    let mut perms = std::fs::metadata(path).unwrap().permissions();
    perms.set_readonly(read_only);
    std::fs::set_permissions(path, perms).unwrap();
}

async fn next_conflict(
    events: &mut broadcast::Receiver<SaveEvent>,
    within: Duration,
) -> Option<String> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Ok(SaveEvent::ExternalChangeDetected {
                external_content, ..
            })) => return Some(external_content),
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
}

fn drain_started(events: &mut broadcast::Receiver<SaveEvent>) -> Vec<(String, SavePriority)> {
    let mut started = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SaveEvent::SaveStarted {
            note_id, priority, ..
        } = event
        {
            started.push((note_id.to_string(), priority));
        }
    }
    started
}

#[tokio::test]
async fn external_overwrite_blocks_the_next_save() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("A.md");
    std::fs::write(&path, "v1").unwrap();
    let manager = SaveManager::start(&config(dir.path())).await.unwrap();
    let mut events = manager.subscribe();

    let id = manager.open_note(&path).await.unwrap();
    manager.update_content(&id, "v2");
    assert!(manager.save_note(&id).await);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "v2");
    assert!(!manager.is_note_dirty(&id));

    write_externally(&path, "external");
    manager.update_content(&id, "v3");
    assert!(!manager.save_note(&id).await);
    assert_eq!(
        next_conflict(&mut events, Duration::from_secs(1)).await.as_deref(),
        Some("external")
    );
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "external");
    assert!(manager.is_note_dirty(&id));

    // Still refused until someone decides.
    assert!(matches!(
        manager.save_note_with(&id, SavePriority::UserSave).await,
        SaveOutcome::Failed(SaveError::ExternalConflict { .. })
    ));
    manager.shutdown().await;
}

#[tokio::test]
async fn a_clean_note_is_also_protected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("A.md");
    std::fs::write(&path, "v1").unwrap();
    let manager = SaveManager::start(&config(dir.path())).await.unwrap();
    let id = manager.open_note(&path).await.unwrap();

    write_externally(&path, "external");
    assert!(!manager.save_note(&id).await);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "external");
    manager.shutdown().await;
}

#[tokio::test]
async fn touching_a_file_without_changing_it_is_not_a_conflict() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("touched.md");
    std::fs::write(&path, "same").unwrap();
    let manager = SaveManager::start(&config(dir.path())).await.unwrap();
    let id = manager.open_note(&path).await.unwrap();

    bump_mtime(&path);
    manager.update_content(&id, "mine");
    assert!(manager.save_note(&id).await);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "mine");
    manager.shutdown().await;
}

#[tokio::test]
async fn undecodable_external_file_is_never_overwritten() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("new.md");
    let manager = SaveManager::start(&config(dir.path())).await.unwrap();
    let mut events = manager.subscribe();
    let id = manager.open_note(&path).await.unwrap();
    manager.update_content(&id, "mine");

    let foreign = [0xff, 0xfe, 0x00, 0x41];
    std::fs::write(&path, foreign).unwrap();
    bump_mtime(&path);

    assert!(!manager.save_note(&id).await);
    assert!(next_conflict(&mut events, Duration::from_secs(1)).await.is_some());
    assert_eq!(std::fs::read(&path).unwrap(), foreign);
    assert!(manager.is_note_dirty(&id));
    manager.shutdown().await;
}

#[tokio::test]
async fn large_notes_track_dirtiness_by_digest() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.save.large_content_threshold = 64;
    let path = dir.path().join("big.md");
    let body = "lorem ipsum ".repeat(2_000);
    std::fs::write(&path, &body).unwrap();
    let manager = SaveManager::start(&cfg).await.unwrap();
    let id = manager.open_note(&path).await.unwrap();
    assert!(!manager.is_note_dirty(&id));

    manager.update_content(&id, format!("{body}!"));
    assert!(manager.is_note_dirty(&id));
    manager.update_content(&id, body.clone());
    assert!(!manager.is_note_dirty(&id));

    let edited = body.replacen("lorem", "LOREM", 1);
    manager.update_content(&id, edited.clone());
    assert!(manager.is_note_dirty(&id));
    assert!(manager.save_note(&id).await);
    assert!(!manager.is_note_dirty(&id));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), edited);
    assert_eq!(manager.get_last_saved_content(&id), Some(edited));
    manager.shutdown().await;
}

#[tokio::test]
async fn queued_requests_run_highest_priority_first() {
    let dir = TempDir::new().unwrap();
    let manager = SaveManager::start(&config(dir.path())).await.unwrap();
    let a = manager.open_note(dir.path().join("a.md")).await.unwrap();
    let b = manager.open_note(dir.path().join("b.md")).await.unwrap();
    let c = manager.open_note(dir.path().join("c.md")).await.unwrap();
    for id in [&a, &b, &c] {
        manager.update_content(id, format!("content of {id}"));
    }
    let mut events = manager.subscribe();

    // All three land in the channel before the processor wakes up.
    let (ra, rb, rc) = tokio::join!(
        manager.save_note_with(&a, SavePriority::AutoSave),
        manager.save_note_with(&b, SavePriority::UserSave),
        manager.save_note_with(&c, SavePriority::ShutdownSave),
    );
    assert!(ra.is_saved() && rb.is_saved() && rc.is_saved());

    let order: Vec<String> = drain_started(&mut events).into_iter().map(|(id, _)| id).collect();
    assert_eq!(order, [c.to_string(), b.to_string(), a.to_string()]);
    manager.shutdown().await;
}

#[tokio::test]
async fn duplicate_requests_coalesce_into_one_save() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("n.md");
    let manager = SaveManager::start(&config(dir.path())).await.unwrap();
    let id = manager.open_note(&path).await.unwrap();
    manager.update_content(&id, "first");
    manager.update_content(&id, "latest");
    let mut events = manager.subscribe();

    let (older, newer) = tokio::join!(
        manager.save_note_with(&id, SavePriority::TabClose),
        manager.save_note_with(&id, SavePriority::AutoSave),
    );
    assert!(matches!(older, SaveOutcome::Skipped));
    assert!(newer.is_saved());

    let started = drain_started(&mut events);
    assert_eq!(started, [(id.to_string(), SavePriority::TabClose)]);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "latest");
    manager.shutdown().await;
}

#[tokio::test]
async fn repeated_failures_open_the_circuit() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.circuit.failure_threshold = 2;
    cfg.circuit.cooldown_secs = 60;
    let path = dir.path().join("locked.md");
    std::fs::write(&path, "v1").unwrap();
    let manager = SaveManager::start(&cfg).await.unwrap();
    let id = manager.open_note(&path).await.unwrap();
    manager.update_content(&id, "v2");

    set_read_only(&path, true);
    for _ in 0..2 {
        assert!(matches!(
            manager.save_note_with(&id, SavePriority::UserSave).await,
            SaveOutcome::Failed(SaveError::ReadOnly { .. })
        ));
    }
    assert_eq!(manager.failure_count(&id), 2);

    // Even with the path healthy again the breaker fails fast.
    set_read_only(&path, false);
    assert!(matches!(
        manager.save_note_with(&id, SavePriority::UserSave).await,
        SaveOutcome::Failed(SaveError::CircuitOpen { .. })
    ));
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "v1");

    // User saves that failed left a rescue copy.
    let copies = std::fs::read_dir(&cfg.storage.emergency_dir).unwrap().count();
    assert!(copies >= 1);
    manager.shutdown().await;
}

#[tokio::test]
async fn a_success_resets_the_failure_count() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("flaky.md");
    std::fs::write(&path, "v1").unwrap();
    let manager = SaveManager::start(&config(dir.path())).await.unwrap();
    let id = manager.open_note(&path).await.unwrap();
    manager.update_content(&id, "v2");

    set_read_only(&path, true);
    assert!(!manager.save_note(&id).await);
    assert_eq!(manager.failure_count(&id), 1);

    set_read_only(&path, false);
    assert!(manager.save_note(&id).await);
    assert_eq!(manager.failure_count(&id), 0);
    manager.shutdown().await;
}

#[tokio::test]
async fn failed_auto_save_writes_no_emergency_copy() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());
    let path = dir.path().join("ro.md");
    std::fs::write(&path, "v1").unwrap();
    let manager = SaveManager::start(&cfg).await.unwrap();
    let id = manager.open_note(&path).await.unwrap();
    manager.update_content(&id, "v2");

    set_read_only(&path, true);
    assert!(!manager.save_note_with(&id, SavePriority::AutoSave).await.is_saved());
    assert!(!Path::new(&cfg.storage.emergency_dir).exists());
    set_read_only(&path, false);
    manager.shutdown().await;
}

#[tokio::test]
async fn watcher_reports_each_external_change_once() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.watch.enabled = true;
    let path = dir.path().join("watched.md");
    std::fs::write(&path, "v1").unwrap();
    let manager = SaveManager::start(&cfg).await.unwrap();
    let id = manager.open_note(&path).await.unwrap();
    let mut events = manager.subscribe();

    write_externally(&path, "external");
    assert_eq!(
        next_conflict(&mut events, Duration::from_secs(5)).await.as_deref(),
        Some("external")
    );
    // Repeated notifications for the same modification stay quiet.
    manager.check_external_change(&id).await;
    assert_eq!(next_conflict(&mut events, Duration::from_millis(300)).await, None);

    // The conflict still blocks saving.
    manager.update_content(&id, "local");
    assert!(!manager.save_note(&id).await);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "external");
    manager.shutdown().await;
}

#[tokio::test]
async fn own_saves_do_not_look_external() {
    let dir = TempDir::new().unwrap();
    let mut cfg = config(dir.path());
    cfg.watch.enabled = true;
    let path = dir.path().join("self.md");
    let manager = SaveManager::start(&cfg).await.unwrap();
    let id = manager.open_note(&path).await.unwrap();
    let mut events = manager.subscribe();

    for i in 0..3 {
        manager.update_content(&id, format!("rev {i}"));
        assert!(manager.save_note(&id).await);
    }
    assert_eq!(next_conflict(&mut events, Duration::from_millis(400)).await, None);
    manager.shutdown().await;
}

#[tokio::test]
async fn keep_local_forces_the_next_save() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("k.md");
    std::fs::write(&path, "v1").unwrap();
    let manager = SaveManager::start(&config(dir.path())).await.unwrap();
    let id = manager.open_note(&path).await.unwrap();
    manager.update_content(&id, "local");
    write_externally(&path, "external");
    assert!(!manager.save_note(&id).await);

    manager
        .resolve_conflict(&id, ConflictResolution::KeepLocal)
        .await
        .unwrap();
    assert!(manager.save_note(&id).await);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "local");
    assert!(!manager.is_note_dirty(&id));
    manager.shutdown().await;
}

#[tokio::test]
async fn keep_external_discards_local_edits() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("e.md");
    std::fs::write(&path, "v1").unwrap();
    let manager = SaveManager::start(&config(dir.path())).await.unwrap();
    let id = manager.open_note(&path).await.unwrap();
    manager.update_content(&id, "local");
    write_externally(&path, "external");

    manager
        .resolve_conflict(&id, ConflictResolution::KeepExternal)
        .await
        .unwrap();
    assert_eq!(manager.get_content(&id).as_deref(), Some("external"));
    assert_eq!(manager.get_last_saved_content(&id).as_deref(), Some("external"));
    assert!(!manager.is_note_dirty(&id));
    assert!(manager.recover_unpersisted().await.unwrap().is_empty());

    // The reloaded stamp makes later saves go through.
    manager.update_content(&id, "after");
    assert!(manager.save_note(&id).await);
    manager.shutdown().await;
}

#[tokio::test]
async fn merge_is_not_supported() {
    let dir = TempDir::new().unwrap();
    let manager = SaveManager::start(&config(dir.path())).await.unwrap();
    let id = manager.open_note(dir.path().join("m.md")).await.unwrap();
    assert!(matches!(
        manager.resolve_conflict(&id, ConflictResolution::Merge).await,
        Err(SaveError::MergeUnsupported)
    ));
    manager.shutdown().await;
}

#[tokio::test]
async fn save_all_dirty_reports_per_note() {
    let dir = TempDir::new().unwrap();
    let manager = SaveManager::start(&config(dir.path())).await.unwrap();
    for name in ["x.md", "y.md", "z.md"] {
        let id = manager.open_note(dir.path().join(name)).await.unwrap();
        manager.update_content(&id, format!("body of {name}"));
    }
    let clean = manager.open_note(dir.path().join("clean.md")).await.unwrap();

    let result = manager.save_all_dirty().await;
    assert_eq!(result.success_count, 3);
    assert!(result.all_succeeded());
    assert!(manager.dirty_note_ids().is_empty());
    assert!(!manager.is_note_dirty(&clean));
    manager.shutdown().await;
}

#[tokio::test]
async fn save_all_dirty_lists_failures() {
    let dir = TempDir::new().unwrap();
    let good_path = dir.path().join("good.md");
    let bad_path = dir.path().join("bad.md");
    std::fs::write(&bad_path, "").unwrap();
    let manager = SaveManager::start(&config(dir.path())).await.unwrap();
    let good = manager.open_note(&good_path).await.unwrap();
    let bad = manager.open_note(&bad_path).await.unwrap();
    manager.update_content(&good, "ok");
    manager.update_content(&bad, "doomed");

    set_read_only(&bad_path, true);
    let result = manager.save_all_dirty().await;
    assert_eq!(result.success_count, 1);
    assert_eq!(result.failed_ids, vec![bad.clone()]);
    set_read_only(&bad_path, false);
    manager.shutdown().await;
}

#[tokio::test]
async fn failed_close_keeps_the_note_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("stuck.md");
    std::fs::write(&path, "v1").unwrap();
    let manager = SaveManager::start(&config(dir.path())).await.unwrap();
    let id = manager.open_note(&path).await.unwrap();
    manager.update_content(&id, "v2");

    set_read_only(&path, true);
    assert!(!manager.close_note(&id).await);
    assert_eq!(manager.get_content(&id).as_deref(), Some("v2"));
    set_read_only(&path, false);
    manager.shutdown().await;
}

#[tokio::test]
async fn edits_survive_a_restart_through_the_log() {
    let dir = TempDir::new().unwrap();
    let cfg = config(dir.path());
    let path = dir.path().join("crash.md");

    let first = SaveManager::start(&cfg).await.unwrap();
    let id = first.open_note(&path).await.unwrap();
    first.update_content(&id, "never saved");
    first.shutdown().await;

    let second = SaveManager::start(&cfg).await.unwrap();
    let recovered = second.recover_unpersisted().await.unwrap();
    assert_eq!(recovered[&id].content, "never saved");

    // Reopening the same path yields the same id, so the edit lines up.
    let reopened = second.open_note(&path).await.unwrap();
    assert_eq!(reopened, id);
    second.update_content(&reopened, recovered[&id].content.clone());
    assert!(second.save_note(&reopened).await);
    assert!(second.recover_unpersisted().await.unwrap().is_empty());
    second.shutdown().await;
}
