//! The skein sync daemon.
//!
//! Keeps the query cache coherent with the task/dep files on disk. On start
//! it reconciles everything with one full sync, then follows a change feed —
//! OS file events by default, the jj op-log when configured and available —
//! through a per-path debounce into the syncer, refreshing the blocked
//! closure after each batch and on a fixed cadence as a staleness bound.
//!
//! ```text
//! files ──▶ (FileWatcher | OpLogSource) ──▶ pending map ──▶ Syncer ──▶ Cache
//!                                            (debounce)        │
//!                                                              ▼
//!                                                     refresh_blocked_cache
//! ```
//!
//! The running loop never dies from recoverable errors: invalid files,
//! single-row database failures and watcher errors are logged and skipped.
//! Only the startup sync (and the database open before it) is fatal.
//!
//! # Example
//!
//! ```no_run
//! use skein_core::EventBus;
//! use skein_daemon::{Daemon, DaemonConfig};
//! use skein_storage::{Cache, PoolConfig, Syncer};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let cache = Cache::open(".skein/cache.db", PoolConfig::default()).await?;
//! cache.init_schema().await?;
//!
//! let syncer = Arc::new(Syncer::new(
//!     Arc::new(cache),
//!     Path::new("tasks"),
//!     Path::new("deps"),
//!     EventBus::new(),
//! ));
//!
//! let mut daemon = Daemon::new(syncer, ".");
//! daemon.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod oplog;
pub mod source;
pub mod watcher;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use skein_core::{Error, Result, SkeinConfig};
use skein_storage::{SyncStats, Syncer};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};

use crate::watcher::DirMatch;

pub use crate::oplog::{OpLogConfig, OpLogTailer, Operation};
pub use crate::source::{ChangeSource, OpLogSource};
pub use crate::watcher::{FileEvent, FileOp, FileWatcher, WatchKind};

/// Daemon tuning.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Minimum quiescence before a changed path is dispatched. Rapid
    /// successive writes to one path collapse into a single sync.
    /// Default: 100ms.
    pub debounce_interval: Duration,

    /// Unconditional blocked-closure refresh cadence; bounds staleness even
    /// when no events arrive. Default: 5s.
    pub refresh_interval: Duration,

    /// Prefer the jj op-log tailer over the file watcher. Falls back to the
    /// watcher when jj is unavailable. Default: false.
    pub use_oplog: bool,

    /// Op-log polling cadence (only used with `use_oplog`). Default: 100ms.
    pub poll_interval: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            debounce_interval: Duration::from_millis(100),
            refresh_interval: Duration::from_secs(5),
            use_oplog: false,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl From<&SkeinConfig> for DaemonConfig {
    fn from(config: &SkeinConfig) -> Self {
        Self {
            debounce_interval: config.debounce_interval(),
            refresh_interval: config.refresh_interval(),
            use_oplog: false,
            poll_interval: config.poll_interval(),
        }
    }
}

/// Clonable handle for requesting a shutdown from outside `run`.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    tx: mpsc::Sender<()>,
}

impl DaemonHandle {
    pub async fn shutdown(&self) {
        let _ = self.tx.send(()).await;
    }
}

/// Orchestrates the file-to-cache pipeline.
pub struct Daemon {
    syncer: Arc<Syncer>,
    root: PathBuf,
    config: DaemonConfig,
    pending: Arc<Mutex<HashMap<PathBuf, Instant>>>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: Option<mpsc::Receiver<()>>,
}

impl Daemon {
    /// Create a daemon with default configuration.
    pub fn new(syncer: Arc<Syncer>, root: impl AsRef<Path>) -> Self {
        Self::with_config(syncer, root, DaemonConfig::default())
    }

    /// Create a daemon with custom configuration.
    pub fn with_config(
        syncer: Arc<Syncer>,
        root: impl AsRef<Path>,
        config: DaemonConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Self {
            syncer,
            root: root.as_ref().to_path_buf(),
            config,
            pending: Arc::new(Mutex::new(HashMap::new())),
            shutdown_tx,
            shutdown_rx: Some(shutdown_rx),
        }
    }

    /// Handle for stopping the daemon from another task.
    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Request a shutdown.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }

    /// Run until stopped.
    ///
    /// Startup order: full sync (fatal on failure), subscribe to the change
    /// feed, then three cooperating loops — event ingest, debounced dispatch,
    /// periodic closure refresh.
    pub async fn run(&mut self) -> Result<()> {
        let mut shutdown_rx = self.shutdown_rx.take().ok_or(Error::AlreadyRunning)?;

        let tasks_dir = self.syncer.tasks_dir().to_path_buf();
        let deps_dir = self.syncer.deps_dir().to_path_buf();

        tokio::fs::create_dir_all(&tasks_dir).await?;
        tokio::fs::create_dir_all(&deps_dir).await?;

        info!("Starting daemon at {}", self.root.display());

        let stats = self
            .syncer
            .full_sync()
            .await
            .map_err(|e| Error::Database(format!("startup sync failed: {}", e)))?;
        info!(
            "Startup sync: {} tasks, {} deps ({} errors)",
            stats.tasks_synced,
            stats.deps_synced,
            stats.total_failed()
        );

        let mut change_source = self.make_source(&tasks_dir, &deps_dir).await;
        let mut changes = change_source.subscribe().await?;

        // Ingest: every affected path lands in the pending map, keyed by
        // path so bursts collapse.
        let ingest = {
            let pending = self.pending.clone();
            tokio::spawn(async move {
                while let Some(batch) = changes.recv().await {
                    let mut map = pending.lock().await;
                    let now = Instant::now();
                    for path in batch {
                        debug!("Queued change: {}", path.display());
                        map.insert(path, now);
                    }
                }
            })
        };

        // Debounced dispatch.
        let dispatcher = {
            let syncer = self.syncer.clone();
            let pending = self.pending.clone();
            let debounce = self.config.debounce_interval;
            let tasks = DirMatch::new(&tasks_dir);
            let deps = DirMatch::new(&deps_dir);

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(debounce);
                loop {
                    ticker.tick().await;
                    Self::process_pending(&syncer, &pending, debounce, &tasks, &deps).await;
                }
            })
        };

        // Periodic refresh bounds closure staleness in the absence of events.
        let refresher = {
            let syncer = self.syncer.clone();
            let interval = self.config.refresh_interval;

            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    debug!("Periodic blocked-cache refresh");
                    if let Err(e) = syncer.refresh_blocked_cache().await {
                        error!("Failed to refresh blocked cache: {}", e);
                    }
                }
            })
        };

        let _ = shutdown_rx.recv().await;
        info!("Received shutdown signal");

        change_source.shutdown().await;
        ingest.abort();
        dispatcher.abort();
        refresher.abort();

        // Pending changes are discarded; the next start reconverges with a
        // full sync.
        let dropped = {
            let mut map = self.pending.lock().await;
            let n = map.len();
            map.clear();
            n
        };
        if dropped > 0 {
            info!("Discarded {} pending changes on shutdown", dropped);
        }

        info!("Daemon stopped");
        Ok(())
    }

    /// Out-of-band full sync for callers that cannot wait for the feed.
    pub async fn perform_full_sync(&self) -> Result<SyncStats> {
        self.syncer
            .full_sync()
            .await
            .map_err(|e| Error::Database(e.to_string()))
    }

    async fn make_source(&self, tasks_dir: &Path, deps_dir: &Path) -> Box<dyn ChangeSource> {
        if self.config.use_oplog {
            if OpLogTailer::is_jj_available().await && OpLogTailer::is_jj_repo(&self.root).await {
                let config = OpLogConfig {
                    repo_path: self.root.clone(),
                    poll_interval: self.config.poll_interval,
                    tasks_dir: dir_name(tasks_dir, "tasks"),
                    deps_dir: dir_name(deps_dir, "deps"),
                    last_op_id: None,
                };

                match OpLogSource::new(config) {
                    Ok(source) => {
                        info!("Using jj op-log tailer for change detection");
                        return Box::new(source);
                    }
                    Err(e) => warn!("Failed to create op-log tailer: {}", e),
                }
            } else {
                warn!("Op-log tailer requested but jj is unavailable, using file watcher");
            }
        }

        Box::new(FileWatcher::new(tasks_dir, deps_dir))
    }

    /// Dispatch every pending path older than the debounce interval, then
    /// refresh the closure once if anything was dispatched.
    async fn process_pending(
        syncer: &Arc<Syncer>,
        pending: &Arc<Mutex<HashMap<PathBuf, Instant>>>,
        debounce: Duration,
        tasks: &DirMatch,
        deps: &DirMatch,
    ) {
        let due: Vec<PathBuf> = {
            let mut map = pending.lock().await;
            let now = Instant::now();
            let due: Vec<PathBuf> = map
                .iter()
                .filter(|(_, queued_at)| now.duration_since(**queued_at) >= debounce)
                .map(|(path, _)| path.clone())
                .collect();
            for path in &due {
                map.remove(path);
            }
            due
        };

        if due.is_empty() {
            return;
        }

        let mut refresh_needed = false;
        for path in due {
            refresh_needed = true;
            if let Err(e) = Self::dispatch(syncer, &path, tasks, deps).await {
                error!("Error processing change {}: {}", path.display(), e);
            }
        }

        if refresh_needed {
            if let Err(e) = syncer.refresh_blocked_cache().await {
                // Retried at the next tick or event.
                error!("Failed to refresh blocked cache: {}", e);
            }
        }
    }

    /// Apply one settled path: sync it if it exists, otherwise delete the
    /// entity its filename names.
    async fn dispatch(
        syncer: &Arc<Syncer>,
        path: &Path,
        tasks: &DirMatch,
        deps: &DirMatch,
    ) -> Result<()> {
        let is_task = tasks.contains(path);
        let is_dep = deps.contains(path);

        if !is_task && !is_dep {
            debug!("Ignoring out-of-scope path: {}", path.display());
            return Ok(());
        }

        let exists = tokio::fs::metadata(path).await.is_ok();

        if exists {
            if is_task {
                syncer
                    .sync_task(path)
                    .await
                    .map_err(|e| Error::Database(e.to_string()))?;
            } else {
                syncer
                    .sync_dep(path)
                    .await
                    .map_err(|e| Error::Database(e.to_string()))?;
            }
            return Ok(());
        }

        // Gone from disk: recover the identity from the filename.
        let filename = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Parse(format!("unusable path: {}", path.display())))?;

        if is_task {
            let id = skein_core::task_id_from_filename(filename)?;
            syncer
                .delete_task(&id)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        } else {
            let (from, kind, to) = skein_core::parse_dep_filename(filename)?;
            syncer
                .delete_dep(&from, &kind, &to)
                .await
                .map_err(|e| Error::Database(e.to_string()))?;
        }

        Ok(())
    }
}

fn dir_name(dir: &Path, fallback: &str) -> String {
    dir.file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use skein_core::{EventBus, TaskRecord};
    use skein_storage::{write_task_file, Cache, PoolConfig, ReadyOptions};
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<Syncer>) {
        let temp = TempDir::new().unwrap();
        let cache = Cache::open(temp.path().join(".skein/cache.db"), PoolConfig::default())
            .await
            .unwrap();
        cache.init_schema().await.unwrap();

        let syncer = Arc::new(Syncer::new(
            Arc::new(cache),
            &temp.path().join("tasks"),
            &temp.path().join("deps"),
            EventBus::new(),
        ));
        (temp, syncer)
    }

    fn task(id: &str, title: &str) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            title: title.to_string(),
            description: None,
            kind: "task".to_string(),
            status: "open".to_string(),
            priority: 2,
            assigned_agent: None,
            tags: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
            due_at: None,
            defer_until: None,
        }
    }

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.debounce_interval, Duration::from_millis(100));
        assert_eq!(config.refresh_interval, Duration::from_secs(5));
        assert!(!config.use_oplog);
        assert_eq!(config.poll_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_config_from_skein_config() {
        let config = DaemonConfig::from(&SkeinConfig::default());
        assert_eq!(config.debounce_interval, Duration::from_millis(100));
        assert_eq!(config.refresh_interval, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_pending_map_coalesces_by_path() {
        let pending: Arc<Mutex<HashMap<PathBuf, Instant>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let path = PathBuf::from("/repo/tasks/sk-1.json");
        for _ in 0..5 {
            pending.lock().await.insert(path.clone(), Instant::now());
        }

        assert_eq!(pending.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_process_pending_honors_debounce() {
        let (temp, syncer) = setup().await;
        let tasks_dir = temp.path().join("tasks");

        write_task_file(&tasks_dir, &task("sk-1", "First")).await.unwrap();
        let path = tasks_dir.join("sk-1.json");

        let pending = Arc::new(Mutex::new(HashMap::new()));
        pending.lock().await.insert(path.clone(), Instant::now());

        let tasks = DirMatch::new(&tasks_dir);
        let deps = DirMatch::new(&temp.path().join("deps"));
        let debounce = Duration::from_millis(100);

        // Too fresh: nothing is dispatched.
        Daemon::process_pending(&syncer, &pending, debounce, &tasks, &deps).await;
        assert_eq!(pending.lock().await.len(), 1);
        assert!(syncer.cache().get_task_by_id("sk-1").await.is_err());

        tokio::time::sleep(Duration::from_millis(150)).await;

        Daemon::process_pending(&syncer, &pending, debounce, &tasks, &deps).await;
        assert!(pending.lock().await.is_empty());
        assert!(syncer.cache().get_task_by_id("sk-1").await.is_ok());
    }

    // Five rapid rewrites of one path produce one dispatch reflecting the
    // final contents.
    #[tokio::test]
    async fn test_rapid_writes_coalesce_to_final_state() {
        let (temp, syncer) = setup().await;
        let tasks_dir = temp.path().join("tasks");
        let path = tasks_dir.join("sk-1.json");

        let pending = Arc::new(Mutex::new(HashMap::new()));

        for i in 1..=5 {
            write_task_file(&tasks_dir, &task("sk-1", &format!("Revision {}", i)))
                .await
                .unwrap();
            pending.lock().await.insert(path.clone(), Instant::now());
            tokio::time::sleep(Duration::from_millis(30)).await;
        }

        assert_eq!(pending.lock().await.len(), 1);

        tokio::time::sleep(Duration::from_millis(250)).await;

        let tasks = DirMatch::new(&tasks_dir);
        let deps = DirMatch::new(&temp.path().join("deps"));
        Daemon::process_pending(
            &syncer,
            &pending,
            Duration::from_millis(200),
            &tasks,
            &deps,
        )
        .await;

        let row = syncer.cache().get_task_by_id("sk-1").await.unwrap();
        assert_eq!(row.title, "Revision 5");
    }

    #[tokio::test]
    async fn test_dispatch_deletes_missing_task_file() {
        let (temp, syncer) = setup().await;
        let tasks_dir = temp.path().join("tasks");
        tokio::fs::create_dir_all(&tasks_dir).await.unwrap();

        syncer
            .cache()
            .upsert_task(&task("sk-gone", "Doomed"))
            .await
            .unwrap();

        let tasks = DirMatch::new(&tasks_dir);
        let deps = DirMatch::new(&temp.path().join("deps"));

        // The path no longer exists on disk.
        Daemon::dispatch(&syncer, &tasks_dir.join("sk-gone.json"), &tasks, &deps)
            .await
            .unwrap();

        assert!(syncer.cache().get_task_by_id("sk-gone").await.is_err());

        // Duplicate deletes are fine.
        Daemon::dispatch(&syncer, &tasks_dir.join("sk-gone.json"), &tasks, &deps)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_dispatch_deletes_missing_dep_file() {
        let (temp, syncer) = setup().await;
        let deps_dir = temp.path().join("deps");
        tokio::fs::create_dir_all(&deps_dir).await.unwrap();

        syncer.cache().upsert_task(&task("a", "A")).await.unwrap();
        syncer.cache().upsert_task(&task("b", "B")).await.unwrap();
        syncer
            .cache()
            .upsert_dep(&skein_core::DepRecord {
                from: "a".to_string(),
                to: "b".to_string(),
                kind: "blocks".to_string(),
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let tasks = DirMatch::new(&temp.path().join("tasks"));
        let deps = DirMatch::new(&deps_dir);

        Daemon::dispatch(
            &syncer,
            &deps_dir.join("a--blocks--b.json"),
            &tasks,
            &deps,
        )
        .await
        .unwrap();

        assert_eq!(syncer.cache().dep_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_startup_full_sync() {
        let (temp, syncer) = setup().await;
        let tasks_dir = temp.path().join("tasks");

        write_task_file(&tasks_dir, &task("boot-1", "Boot 1")).await.unwrap();
        write_task_file(&tasks_dir, &task("boot-2", "Boot 2")).await.unwrap();

        let mut daemon = Daemon::new(syncer.clone(), temp.path());
        let handle = daemon.handle();

        let run = tokio::spawn(async move { daemon.run().await });

        tokio::time::sleep(Duration::from_millis(500)).await;

        assert!(syncer.cache().get_task_by_id("boot-1").await.is_ok());
        assert!(syncer.cache().get_task_by_id("boot-2").await.is_ok());

        let ready = syncer
            .cache()
            .get_ready_tasks(ReadyOptions::default())
            .await
            .unwrap();
        assert_eq!(ready.len(), 2);

        handle.shutdown().await;
        run.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let (temp, syncer) = setup().await;

        let mut daemon = Daemon::new(syncer, temp.path());
        let handle = daemon.handle();

        handle.shutdown().await;
        daemon.run().await.unwrap();

        assert!(matches!(daemon.run().await, Err(Error::AlreadyRunning)));
    }
}
