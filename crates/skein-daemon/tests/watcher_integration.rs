//! Integration tests for the file watcher against a real filesystem.

use std::time::Duration;

use skein_daemon::{FileOp, FileWatcher, WatchKind};
use skein_storage::write_task_file;
use tempfile::TempDir;

fn sample_task(id: &str) -> skein_core::TaskRecord {
    skein_core::TaskRecord {
        id: id.to_string(),
        title: "Watched".to_string(),
        description: None,
        kind: "task".to_string(),
        status: "open".to_string(),
        priority: 2,
        assigned_agent: None,
        tags: vec![],
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
        due_at: None,
        defer_until: None,
    }
}

async fn setup_dirs() -> (TempDir, std::path::PathBuf, std::path::PathBuf) {
    let temp = TempDir::new().unwrap();
    let tasks_dir = temp.path().join("tasks");
    let deps_dir = temp.path().join("deps");
    tokio::fs::create_dir_all(&tasks_dir).await.unwrap();
    tokio::fs::create_dir_all(&deps_dir).await.unwrap();
    (temp, tasks_dir, deps_dir)
}

#[tokio::test]
async fn test_observes_task_create() {
    let (_temp, tasks_dir, deps_dir) = setup_dirs().await;

    let mut watcher = FileWatcher::new(&tasks_dir, &deps_dir);
    watcher.start().unwrap();
    assert!(watcher.is_running());

    let mut events = watcher.take_events().unwrap();

    write_task_file(&tasks_dir, &sample_task("sk-1")).await.unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("event within timeout")
        .expect("channel open");

    assert_eq!(event.kind, WatchKind::Task);
    assert!(event.path.ends_with("sk-1.json"));
    // The atomic write lands via rename, so either op is acceptable here.
    assert!(matches!(event.op, FileOp::Create | FileOp::Modify));

    watcher.stop().await;
    assert!(!watcher.is_running());
}

#[tokio::test]
async fn test_observes_delete_as_delete() {
    let (_temp, tasks_dir, deps_dir) = setup_dirs().await;

    write_task_file(&tasks_dir, &sample_task("sk-del")).await.unwrap();

    let mut watcher = FileWatcher::new(&tasks_dir, &deps_dir);
    watcher.start().unwrap();
    let mut events = watcher.take_events().unwrap();

    tokio::fs::remove_file(tasks_dir.join("sk-del.json"))
        .await
        .unwrap();

    let mut saw_delete = false;
    while let Ok(Some(event)) =
        tokio::time::timeout(Duration::from_secs(2), events.recv()).await
    {
        if event.op == FileOp::Delete && event.path.ends_with("sk-del.json") {
            saw_delete = true;
            break;
        }
    }
    assert!(saw_delete);

    watcher.stop().await;
}

#[tokio::test]
async fn test_ignores_non_json_files() {
    let (_temp, tasks_dir, deps_dir) = setup_dirs().await;

    let mut watcher = FileWatcher::new(&tasks_dir, &deps_dir);
    watcher.start().unwrap();
    let mut events = watcher.take_events().unwrap();

    tokio::fs::write(tasks_dir.join("README.md"), "hello")
        .await
        .unwrap();

    assert!(
        tokio::time::timeout(Duration::from_millis(500), events.recv())
            .await
            .is_err(),
        "non-json file must not produce an event"
    );

    watcher.stop().await;
}

#[tokio::test]
async fn test_start_is_single_shot() {
    let (_temp, tasks_dir, deps_dir) = setup_dirs().await;

    let mut watcher = FileWatcher::new(&tasks_dir, &deps_dir);
    watcher.start().unwrap();
    assert!(watcher.start().is_err());

    watcher.stop().await;

    // Terminal after stop.
    assert!(watcher.start().is_err());
}

#[tokio::test]
async fn test_stop_closes_event_stream() {
    let (_temp, tasks_dir, deps_dir) = setup_dirs().await;

    let mut watcher = FileWatcher::new(&tasks_dir, &deps_dir);
    watcher.start().unwrap();
    let mut events = watcher.take_events().unwrap();

    watcher.stop().await;

    // Drain whatever arrived before the stop; the stream must then end.
    loop {
        match tokio::time::timeout(Duration::from_secs(1), events.recv()).await {
            Ok(Some(_)) => continue,
            Ok(None) => break,
            Err(_) => panic!("stream did not close after stop"),
        }
    }
}
