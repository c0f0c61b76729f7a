//! File-to-cache bridge.
//!
//! The [`Syncer`] lifts the cache's write surface one level: given a path,
//! read-validate-upsert; given an identity, delete; given the two
//! directories, reconcile everything in one sweep. It holds no sync state of
//! its own — all writes are single-row upserts and the closure refresh is
//! transactional — so multiple syncers over one cache are safe.
//!
//! ```text
//! tasks/*.json  deps/*.json
//!        │         │
//!        ▼         ▼
//!      Syncer (read → validate → upsert/delete)
//!                │
//!                ▼
//!      Cache (tasks, deps, blocked_cache)
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use skein_core::{DepAction, Event, EventBus, TaskAction, TaskRecord};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::db::Cache;
use crate::dep_io::{read_dep_file, write_dep_file};
use crate::task_io::{read_task_file, write_task_file};

/// Counters for one sync sweep.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    pub tasks_synced: usize,
    pub tasks_failed: usize,
    pub deps_synced: usize,
    pub deps_failed: usize,
    pub deleted: usize,
}

impl SyncStats {
    pub fn has_errors(&self) -> bool {
        self.tasks_failed > 0 || self.deps_failed > 0
    }

    pub fn total_synced(&self) -> usize {
        self.tasks_synced + self.deps_synced + self.deleted
    }

    pub fn total_failed(&self) -> usize {
        self.tasks_failed + self.deps_failed
    }
}

/// Counters for one export sweep.
#[derive(Debug, Clone, Default)]
pub struct ExportStats {
    pub tasks_exported: usize,
    pub tasks_failed: usize,
    pub deps_exported: usize,
    pub deps_failed: usize,
}

impl ExportStats {
    pub fn has_errors(&self) -> bool {
        self.tasks_failed > 0 || self.deps_failed > 0
    }

    pub fn total_exported(&self) -> usize {
        self.tasks_exported + self.deps_exported
    }
}

/// Bridges the on-disk files and the cache.
pub struct Syncer {
    cache: Arc<Cache>,
    tasks_dir: PathBuf,
    deps_dir: PathBuf,
    bus: EventBus,
}

impl Syncer {
    pub fn new(cache: Arc<Cache>, tasks_dir: &Path, deps_dir: &Path, bus: EventBus) -> Self {
        Self {
            cache,
            tasks_dir: tasks_dir.to_path_buf(),
            deps_dir: deps_dir.to_path_buf(),
            bus,
        }
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn tasks_dir(&self) -> &Path {
        &self.tasks_dir
    }

    pub fn deps_dir(&self) -> &Path {
        &self.deps_dir
    }

    /// Sync a single task file into the cache and announce it.
    ///
    /// Parse and validation failures are returned to the caller; batched
    /// callers (the daemon) log and move on.
    pub async fn sync_task(&self, path: &Path) -> crate::Result<TaskRecord> {
        let existed = {
            // Identity comes from the filename, which is authoritative.
            match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => match skein_core::task_id_from_filename(name) {
                    Ok(id) => self.cache.get_task_by_id(&id).await.is_ok(),
                    Err(_) => false,
                },
                None => false,
            }
        };

        let task = self.apply_task_file(path).await?;

        let action = if existed {
            TaskAction::Updated
        } else {
            TaskAction::Created
        };
        self.bus.publish(task_event(&task, action));

        Ok(task)
    }

    /// Sync a single dependency file into the cache and announce it.
    pub async fn sync_dep(&self, path: &Path) -> crate::Result<()> {
        let dep = read_dep_file(path).await?;
        self.cache.upsert_dep(&dep).await?;

        debug!("Synced dep: {} --{}--> {}", dep.from, dep.kind, dep.to);
        self.bus.publish(Event::DepUpdate {
            from: dep.from,
            to: dep.to,
            kind: dep.kind,
            action: DepAction::Added,
        });

        Ok(())
    }

    /// Remove a task from the cache by id. Idempotent.
    pub async fn delete_task(&self, id: &str) -> crate::Result<()> {
        self.cache.delete_task(id).await?;

        info!("Deleted task from cache: {}", id);
        self.bus.publish(Event::TaskUpdate {
            task_id: id.to_string(),
            action: TaskAction::Deleted,
            status: None,
            title: None,
            priority: None,
            assignee: None,
        });

        Ok(())
    }

    /// Remove a dependency edge from the cache. Idempotent.
    pub async fn delete_dep(&self, from: &str, kind: &str, to: &str) -> crate::Result<()> {
        self.cache.delete_dep(from, kind, to).await?;

        info!("Deleted dep from cache: {} --{}--> {}", from, kind, to);
        self.bus.publish(Event::DepUpdate {
            from: from.to_string(),
            to: to.to_string(),
            kind: kind.to_string(),
            action: DepAction::Removed,
        });

        Ok(())
    }

    /// Reconcile every file in both directories with the cache.
    ///
    /// Individual file failures are warned about and counted, never fatal: a
    /// best-effort sweep followed by one closure refresh beats failing the
    /// whole operation. Missing directories are treated as empty. Per-entity
    /// events are suppressed — one `sync_complete` describes the sweep.
    pub async fn full_sync(&self) -> crate::Result<SyncStats> {
        info!(
            "Starting full sync: tasks={}, deps={}",
            self.tasks_dir.display(),
            self.deps_dir.display()
        );

        let started = Instant::now();
        let mut stats = SyncStats::default();

        // Tasks first so that edge foreign keys have their endpoints.
        self.sweep_dir(&self.tasks_dir, true, &mut stats).await?;
        self.sweep_dir(&self.deps_dir, false, &mut stats).await?;

        self.cache.refresh_blocked_cache().await?;
        self.publish_blocked_counts().await;

        let duration = started.elapsed();
        info!(
            "Full sync complete in {:?}: tasks={} (failed={}), deps={} (failed={})",
            duration, stats.tasks_synced, stats.tasks_failed, stats.deps_synced, stats.deps_failed
        );

        self.bus.publish(Event::SyncComplete {
            tasks_processed: stats.tasks_synced,
            deps_processed: stats.deps_synced,
            duration_ns: duration.as_nanos() as u64,
        });
        self.publish_stats().await;

        Ok(stats)
    }

    /// Recompute the blocked closure and announce the new counts.
    pub async fn refresh_blocked_cache(&self) -> crate::Result<()> {
        self.cache.refresh_blocked_cache().await?;
        self.publish_blocked_counts().await;
        Ok(())
    }

    /// Write every cached task and edge back out as files.
    ///
    /// Recovery path: useful when the cache survived but the files did not,
    /// or to seed a fresh checkout.
    pub async fn export_all(&self) -> crate::Result<ExportStats> {
        info!(
            "Exporting cache to tasks={}, deps={}",
            self.tasks_dir.display(),
            self.deps_dir.display()
        );

        let mut stats = ExportStats::default();

        fs::create_dir_all(&self.tasks_dir).await?;
        fs::create_dir_all(&self.deps_dir).await?;

        for task in self.cache.list_all_tasks().await? {
            match write_task_file(&self.tasks_dir, &task).await {
                Ok(_) => stats.tasks_exported += 1,
                Err(e) => {
                    warn!("Failed to export task {}: {}", task.id, e);
                    stats.tasks_failed += 1;
                }
            }
        }

        for dep in self.cache.list_all_deps().await? {
            match write_dep_file(&self.deps_dir, &dep).await {
                Ok(_) => stats.deps_exported += 1,
                Err(e) => {
                    warn!(
                        "Failed to export dep {} --{}--> {}: {}",
                        dep.from, dep.kind, dep.to, e
                    );
                    stats.deps_failed += 1;
                }
            }
        }

        info!(
            "Export complete: tasks={} (failed={}), deps={} (failed={})",
            stats.tasks_exported, stats.tasks_failed, stats.deps_exported, stats.deps_failed
        );

        Ok(stats)
    }

    async fn apply_task_file(&self, path: &Path) -> crate::Result<TaskRecord> {
        let task = read_task_file(path).await?;
        self.cache.upsert_task(&task).await?;
        debug!("Synced task: {} ({})", task.id, task.title);
        Ok(task)
    }

    async fn sweep_dir(
        &self,
        dir: &Path,
        is_tasks: bool,
        stats: &mut SyncStats,
    ) -> crate::Result<()> {
        if !dir.exists() {
            info!("Directory does not exist, treating as empty: {}", dir.display());
            return Ok(());
        }

        for path in crate::fsio::json_files(dir).await? {
            if is_tasks {
                match self.apply_task_file(&path).await {
                    Ok(_) => stats.tasks_synced += 1,
                    Err(e) => {
                        warn!("Failed to sync task {}: {}", path.display(), e);
                        stats.tasks_failed += 1;
                    }
                }
            } else {
                match async {
                    let dep = read_dep_file(&path).await?;
                    self.cache.upsert_dep(&dep).await
                }
                .await
                {
                    Ok(_) => stats.deps_synced += 1,
                    Err(e) => {
                        warn!("Failed to sync dep {}: {}", path.display(), e);
                        stats.deps_failed += 1;
                    }
                }
            }
        }

        Ok(())
    }

    async fn publish_blocked_counts(&self) {
        match (
            self.cache.blocked_count().await,
            self.cache.ready_count().await,
        ) {
            (Ok(blocked_count), Ok(ready_count)) => {
                self.bus.publish(Event::BlockedCache {
                    blocked_count,
                    ready_count,
                });
            }
            (Err(e), _) | (_, Err(e)) => {
                warn!("Failed to read blocked/ready counts: {}", e);
            }
        }
    }

    async fn publish_stats(&self) {
        match self.cache.statistics().await {
            Ok(stats) => self.bus.publish(Event::Stats {
                total: stats.total,
                by_status: stats.by_status,
                blocked: stats.blocked,
                ready: stats.ready,
                in_progress: stats.in_progress,
            }),
            Err(e) => warn!("Failed to compute statistics: {}", e),
        }
    }
}

fn task_event(task: &TaskRecord, action: TaskAction) -> Event {
    Event::TaskUpdate {
        task_id: task.id.clone(),
        action,
        status: Some(task.status.clone()),
        title: Some(task.title.clone()),
        priority: Some(task.priority),
        assignee: task.assigned_agent.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::ReadyOptions;
    use crate::pool::PoolConfig;
    use chrono::Utc;
    use skein_core::DepRecord;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Syncer) {
        let temp = TempDir::new().unwrap();
        let cache = Cache::open(temp.path().join("cache.db"), PoolConfig::default())
            .await
            .unwrap();
        cache.init_schema().await.unwrap();

        let tasks_dir = temp.path().join("tasks");
        let deps_dir = temp.path().join("deps");
        let syncer = Syncer::new(Arc::new(cache), &tasks_dir, &deps_dir, EventBus::new());
        (temp, syncer)
    }

    fn task(id: &str) -> TaskRecord {
        TaskRecord {
            id: id.to_string(),
            title: format!("Task {}", id),
            description: None,
            kind: "feature".to_string(),
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

    fn edge(from: &str, to: &str, kind: &str) -> DepRecord {
        DepRecord {
            from: from.to_string(),
            to: to.to_string(),
            kind: kind.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_full_sync_empty_dirs() {
        let (_temp, syncer) = setup().await;

        let stats = syncer.full_sync().await.unwrap();
        assert_eq!(stats.total_synced(), 0);
        assert!(!stats.has_errors());
    }

    #[tokio::test]
    async fn test_full_sync_tasks_and_deps() {
        let (_temp, syncer) = setup().await;

        write_task_file(syncer.tasks_dir(), &task("sk-1")).await.unwrap();
        write_task_file(syncer.tasks_dir(), &task("sk-2")).await.unwrap();
        write_dep_file(syncer.deps_dir(), &edge("sk-1", "sk-2", "blocks"))
            .await
            .unwrap();

        let stats = syncer.full_sync().await.unwrap();
        assert_eq!(stats.tasks_synced, 2);
        assert_eq!(stats.deps_synced, 1);
        assert!(!stats.has_errors());

        // The sweep ends with a closure refresh: sk-2 is blocked.
        let ready = syncer
            .cache()
            .get_ready_tasks(ReadyOptions::default())
            .await
            .unwrap();
        let ids: Vec<&str> = ready.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["sk-1"]);
    }

    #[tokio::test]
    async fn test_full_sync_tolerates_invalid_file() {
        let (_temp, syncer) = setup().await;

        write_task_file(syncer.tasks_dir(), &task("sk-1")).await.unwrap();
        tokio::fs::write(
            syncer.tasks_dir().join("broken.json"),
            r#"{"id": "broken", "type": "task", "status": "open", "priority": 2}"#,
        )
        .await
        .unwrap();

        let stats = syncer.full_sync().await.unwrap();
        assert_eq!(stats.tasks_synced, 1);
        assert_eq!(stats.tasks_failed, 1);
        assert!(stats.has_errors());
    }

    #[tokio::test]
    async fn test_sync_task_emits_created_then_updated() {
        let (_temp, syncer) = setup().await;
        let mut rx = syncer.bus().subscribe();

        write_task_file(syncer.tasks_dir(), &task("sk-1")).await.unwrap();
        let path = syncer.tasks_dir().join("sk-1.json");

        syncer.sync_task(&path).await.unwrap();
        match rx.recv().await.unwrap() {
            Event::TaskUpdate { action, .. } => assert_eq!(action, TaskAction::Created),
            other => panic!("unexpected event: {:?}", other),
        }

        syncer.sync_task(&path).await.unwrap();
        match rx.recv().await.unwrap() {
            Event::TaskUpdate { action, .. } => assert_eq!(action, TaskAction::Updated),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_idempotent_sync() {
        let (_temp, syncer) = setup().await;

        write_task_file(syncer.tasks_dir(), &task("sk-1")).await.unwrap();
        let path = syncer.tasks_dir().join("sk-1.json");

        syncer.sync_task(&path).await.unwrap();
        syncer.sync_task(&path).await.unwrap();

        assert_eq!(syncer.cache().task_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_task_is_idempotent() {
        let (_temp, syncer) = setup().await;

        syncer.cache().upsert_task(&task("sk-1")).await.unwrap();
        syncer.delete_task("sk-1").await.unwrap();
        syncer.delete_task("sk-1").await.unwrap();

        assert_eq!(syncer.cache().task_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_export_all() {
        let (_temp, syncer) = setup().await;

        syncer.cache().upsert_task(&task("sk-1")).await.unwrap();
        syncer.cache().upsert_task(&task("sk-2")).await.unwrap();
        syncer
            .cache()
            .upsert_dep(&edge("sk-1", "sk-2", "blocks"))
            .await
            .unwrap();

        let stats = syncer.export_all().await.unwrap();
        assert_eq!(stats.tasks_exported, 2);
        assert_eq!(stats.deps_exported, 1);

        assert!(syncer.tasks_dir().join("sk-1.json").exists());
        assert!(syncer.deps_dir().join("sk-1--blocks--sk-2.json").exists());
    }
}
