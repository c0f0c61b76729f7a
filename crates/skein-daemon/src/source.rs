//! The capability both event feeds share: deliver batches of affected paths.
//!
//! The daemon depends on this trait, not on the concrete feeds. The file
//! watcher delivers one path per batch; the op-log tailer delivers one batch
//! per VCS operation.

use std::path::PathBuf;

use async_trait::async_trait;
use skein_core::{Error, Result};
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::oplog::{OpLogConfig, OpLogTailer};
use crate::watcher::FileWatcher;

/// A source of "these files changed" notifications.
#[async_trait]
pub trait ChangeSource: Send {
    /// Start the feed and return its output. One call per source.
    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<PathBuf>>>;

    /// Stop the feed. The receiver from [`ChangeSource::subscribe`] closes.
    async fn shutdown(&mut self);
}

#[async_trait]
impl ChangeSource for FileWatcher {
    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<PathBuf>>> {
        self.start()?;

        let mut events = self
            .take_events()
            .ok_or_else(|| Error::Watcher("events stream already taken".to_string()))?;
        let mut errors = self
            .take_errors()
            .ok_or_else(|| Error::Watcher("errors stream already taken".to_string()))?;

        tokio::spawn(async move {
            while let Some(e) = errors.recv().await {
                warn!("File watcher error: {}", e);
            }
        });

        let (tx, rx) = mpsc::channel(256);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if tx.send(vec![event.path]).await.is_err() {
                    break;
                }
            }
        });

        Ok(rx)
    }

    async fn shutdown(&mut self) {
        self.stop().await;
    }
}

/// Adapter running an [`OpLogTailer`] as a [`ChangeSource`].
pub struct OpLogSource {
    tailer: Option<OpLogTailer>,
    handle: Option<tokio::task::JoinHandle<()>>,
    repo_path: PathBuf,
}

impl OpLogSource {
    pub fn new(config: OpLogConfig) -> Result<Self> {
        let repo_path = config.repo_path.clone();
        Ok(Self {
            tailer: Some(OpLogTailer::new(config)?),
            handle: None,
            repo_path,
        })
    }
}

#[async_trait]
impl ChangeSource for OpLogSource {
    async fn subscribe(&mut self) -> Result<mpsc::Receiver<Vec<PathBuf>>> {
        let tailer = self.tailer.take().ok_or(Error::AlreadyRunning)?;

        let (tx, rx) = mpsc::channel(256);
        let repo_path = self.repo_path.clone();

        let handle = tokio::spawn(async move {
            let result = tailer
                .watch(move |ops| {
                    let files: Vec<PathBuf> = ops
                        .iter()
                        .flat_map(|op| op.files.iter().map(|f| repo_path.join(f)))
                        .collect();

                    if !files.is_empty() {
                        // try_send keeps the poll loop from blocking on a
                        // slow consumer; a dropped batch is re-observed by
                        // the periodic full refresh.
                        if let Err(e) = tx.try_send(files) {
                            warn!("Dropping op-log batch: {}", e);
                        }
                    }
                    Ok(())
                })
                .await;

            if let Err(e) = result {
                error!("Op-log tailer exited: {}", e);
            }
        });

        self.handle = Some(handle);
        Ok(rx)
    }

    async fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_storage::write_task_file;
    use tempfile::TempDir;

    fn sample_task(id: &str) -> skein_core::TaskRecord {
        skein_core::TaskRecord {
            id: id.to_string(),
            title: "Sample".to_string(),
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

    #[tokio::test]
    async fn test_watcher_as_change_source() {
        let temp = TempDir::new().unwrap();
        let tasks_dir = temp.path().join("tasks");
        let deps_dir = temp.path().join("deps");
        tokio::fs::create_dir_all(&tasks_dir).await.unwrap();
        tokio::fs::create_dir_all(&deps_dir).await.unwrap();

        let mut source: Box<dyn ChangeSource> =
            Box::new(FileWatcher::new(&tasks_dir, &deps_dir));
        let mut rx = source.subscribe().await.unwrap();

        write_task_file(&tasks_dir, &sample_task("sk-1")).await.unwrap();

        let batch = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("event within timeout")
            .expect("channel open");
        assert!(batch[0].ends_with("sk-1.json"));

        source.shutdown().await;
    }

    #[tokio::test]
    async fn test_subscribe_twice_fails() {
        let temp = TempDir::new().unwrap();
        let tasks_dir = temp.path().join("tasks");
        let deps_dir = temp.path().join("deps");
        tokio::fs::create_dir_all(&tasks_dir).await.unwrap();
        tokio::fs::create_dir_all(&deps_dir).await.unwrap();

        let mut watcher = FileWatcher::new(&tasks_dir, &deps_dir);
        let _rx = ChangeSource::subscribe(&mut watcher).await.unwrap();
        assert!(ChangeSource::subscribe(&mut watcher).await.is_err());

        watcher.shutdown().await;
    }
}
