// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Engine-level flows: pooled runs, undo and the watcher

use serde_json::json;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;

use tidydesk::boxes::BoxRegistry;
use tidydesk::config::CleanOptions;
use tidydesk::events::OrganizerEvent;
use tidydesk::{AppConfig, DeskEngine};

fn setup(tmp: &TempDir) -> (PathBuf, AppConfig) {
    let desk = tmp.path().join("desk");
    fs::create_dir_all(&desk).unwrap();
    let config = serde_json::from_value(json!({
        "advanced_rules": [{
            "name": "Pictures",
            "conditions": [{ "field": "extension", "operator": "is", "value": "png" }],
            "action": { "type": "move_to", "path": "Images" }
        }],
        "storage": { "data_dir": tmp.path().join("data").to_string_lossy() },
        "watcher": { "debounce_ms": 200, "settle_ms": 50, "max_settle_ms": 1000, "poll_interval_ms": 20 },
        "workers": { "max_workers": 2 }
    }))
    .unwrap();
    (desk, config)
}

async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_organize_and_undo_through_engine() {
    let tmp = TempDir::new().unwrap();
    let (desk, config) = setup(&tmp);
    fs::write(desk.join("a.png"), "a").unwrap();
    let engine = DeskEngine::new(config).unwrap();
    let mut events = engine.subscribe();

    let summary = engine.organize(&desk).await.unwrap();
    assert_eq!(summary.changed, 1);
    assert!(desk.join("Images/a.png").exists());

    let mut saw_logged = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, OrganizerEvent::OperationLogged(_)) {
            saw_logged = true;
        }
    }
    assert!(saw_logged);

    let outcome = engine.undo().await.unwrap();
    assert!(outcome.success, "{}", outcome.message);
    assert!(desk.join("a.png").exists());

    let again = engine.undo().await.unwrap();
    assert!(!again.success);
    assert_eq!(again.message, "Undo history is empty.");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_history_survives_engine_restart() {
    let tmp = TempDir::new().unwrap();
    let (desk, config) = setup(&tmp);
    fs::write(desk.join("a.png"), "a").unwrap();

    {
        let engine = DeskEngine::new(config.clone()).unwrap();
        engine.organize(&desk).await.unwrap();
    }

    let engine = DeskEngine::new(config).unwrap();
    assert_eq!(engine.undo_manager().len(), 1);
    assert!(engine.undo().await.unwrap().success);
    assert!(desk.join("a.png").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_watcher_auto_organizes_new_files() {
    let tmp = TempDir::new().unwrap();
    let (desk, config) = setup(&tmp);
    let engine = DeskEngine::new(config).unwrap();

    engine.start_watching(&desk).unwrap();
    assert_eq!(engine.watched_dir(), Some(desk.clone()));

    fs::write(desk.join("drop.png"), "d").unwrap();
    fs::write(desk.join("note.txt"), "n").unwrap();

    let moved = desk.join("Images/drop.png");
    assert!(wait_until(Duration::from_secs(5), || moved.exists()).await);
    assert!(desk.join("note.txt").exists());

    assert!(wait_until(Duration::from_secs(2), || engine.undo_manager().len() == 1).await);
    assert!(engine.stop_watching().await.unwrap());
    assert!(!engine.stop_watching().await.unwrap());

    // nothing is picked up once stopped
    fs::write(desk.join("late.png"), "l").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(desk.join("late.png").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_undo_while_watching_leaves_restored_files() {
    let tmp = TempDir::new().unwrap();
    let (desk, config) = setup(&tmp);
    fs::write(desk.join("a.png"), "a").unwrap();
    fs::write(desk.join("b.png"), "b").unwrap();
    let engine = DeskEngine::new(config).unwrap();
    engine.start_watching(&desk).unwrap();

    engine.organize(&desk).await.unwrap();
    assert!(desk.join("Images/a.png").exists());
    assert!(engine.undo().await.unwrap().success);

    let clean = CleanOptions {
        remove_broken_shortcuts: false,
        remove_temp_files: false,
        patterns: vec!["*.png".to_string()],
    };
    let summary = engine.clean(&desk, clean).await.unwrap();
    assert_eq!(summary.changed, 2);
    assert!(engine.undo().await.unwrap().success);

    // Longer than debounce plus settle, so any re-organization would have happened
    tokio::time::sleep(Duration::from_millis(1500)).await;
    engine.stop_watching().await.unwrap();

    assert!(desk.join("a.png").exists());
    assert!(desk.join("b.png").exists());
    assert!(!desk.join("Images/a.png").exists());
    assert!(engine.undo_manager().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_auto_organize_disabled_leaves_files() {
    let tmp = TempDir::new().unwrap();
    let (desk, mut config) = setup(&tmp);
    config.auto_organize_enabled = false;
    let engine = DeskEngine::new(config).unwrap();

    engine.start_watching(&desk).unwrap();
    fs::write(desk.join("drop.png"), "d").unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    engine.stop_watching().await.unwrap();

    assert!(desk.join("drop.png").exists());
    assert!(engine.undo_manager().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_find_duplicates_through_engine() {
    let tmp = TempDir::new().unwrap();
    let (desk, config) = setup(&tmp);
    fs::write(desk.join("a.txt"), "same").unwrap();
    fs::write(desk.join("b.txt"), "same").unwrap();
    let engine = DeskEngine::new(config).unwrap();

    let groups = engine.find_duplicates(&desk).await.unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].paths.len(), 2);
}

struct FixedRegistry {
    root: PathBuf,
}

impl BoxRegistry for FixedRegistry {
    fn box_exists(&self, box_id: &str) -> bool {
        box_id == "inbox"
    }

    fn resolve_shortcut_dir(&self, box_id: &str) -> Option<PathBuf> {
        self.box_exists(box_id).then(|| self.root.join(box_id))
    }
}

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_host_registry_resolves_boxes() {
    let tmp = TempDir::new().unwrap();
    let (desk, mut config) = setup(&tmp);
    config.advanced_rules = serde_json::from_value(json!([{
        "name": "Inbox",
        "conditions": [{ "field": "full_name", "operator": "starts_with", "value": "scan" }],
        "target_box": "inbox"
    }]))
    .unwrap();
    config.storage.relocate_assigned = false;
    fs::write(desk.join("scan_001.pdf"), "s").unwrap();

    let shelf = tmp.path().join("shelf");
    let registry: Arc<dyn BoxRegistry> = Arc::new(FixedRegistry { root: shelf.clone() });
    let engine = DeskEngine::with_registry(config, registry).unwrap();

    engine.organize(&desk).await.unwrap();

    let shortcut = shelf.join("inbox").join("scan_001.pdf");
    assert!(shortcut.symlink_metadata().unwrap().file_type().is_symlink());
    // not relocated, so the original stays put
    assert!(desk.join("scan_001.pdf").exists());
    assert!(engine.undo().await.unwrap().success);
    assert!(shortcut.symlink_metadata().is_err());
}
