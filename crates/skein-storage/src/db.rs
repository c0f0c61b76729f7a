//! Embedded query cache over the task and dependency files.
//!
//! The cache is a strictly derivable projection of `tasks/` and `deps/`; it
//! may be rebuilt from scratch at any time. It lives in a single libSQL file
//! (WAL mode, so readers never block on the writer) behind a bounded
//! connection pool, and materializes the transitive blocked closure so that
//! "what is ready?" is a single indexed query.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use chrono::{DateTime, Utc};
use skein_core::{DepRecord, TaskRecord};
use turso::params;

use crate::pool::{Pool, PoolConfig};

/// Cache-layer errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("libsql error: {0}")]
    Db(#[from] turso::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("core error: {0}")]
    Core(#[from] skein_core::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CacheError>;

/// Options for [`Cache::get_ready_tasks`].
#[derive(Debug, Clone, Default)]
pub struct ReadyOptions {
    /// Include tasks whose `defer_until` lies in the future.
    pub include_deferred: bool,

    /// Limit the number of results (0 = no limit).
    pub limit: usize,

    /// Restrict to tasks assigned to this agent.
    pub assigned_agent: Option<String>,
}

/// Filter for [`Cache::list_tasks`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<String>,
    pub kind: Option<String>,
    pub priority: Option<i32>,
    pub assigned_agent: Option<String>,
    pub tag: Option<String>,

    /// Limit the number of results (0 = no limit).
    pub limit: usize,

    /// Skip the first N results.
    pub offset: usize,
}

/// Aggregate counts over the cached backlog.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub total: i64,
    pub by_status: HashMap<String, i64>,
    pub blocked: i64,
    pub ready: i64,
    pub in_progress: i64,
}

const TASK_COLUMNS: &str = "id, title, description, type, status, priority, \
     assigned_agent, tags, created_at, updated_at, due_at, defer_until";

/// Handle on the cache database.
///
/// All methods take `&self`; each call borrows a pooled connection, so
/// concurrent readers proceed in parallel and the closure refresh is the only
/// multi-statement writer.
pub struct Cache {
    pool: Pool,
    path: String,
}

impl Cache {
    /// Open (creating if necessary) the cache database at `path`.
    ///
    /// The parent directory is created, and every pooled connection is set up
    /// with WAL journaling, a busy timeout and foreign-key enforcement.
    pub async fn open<P: AsRef<Path>>(path: P, config: PoolConfig) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = path.as_ref().parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let pool = Pool::open(&path_str, config).await?;

        Ok(Cache {
            pool,
            path: path_str,
        })
    }

    /// Returns the database file path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Close the cache. Connections are released on drop; flush policy is
    /// the driver's default.
    pub async fn close(self) -> Result<()> {
        Ok(())
    }

    /// Create tables and indexes. Idempotent.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = vec![
            r#"CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                priority INTEGER NOT NULL DEFAULT 2,
                assigned_agent TEXT,
                description TEXT,
                tags TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                due_at TEXT,
                defer_until TEXT,
                is_blocked INTEGER NOT NULL DEFAULT 0,
                blocking_count INTEGER NOT NULL DEFAULT 0
            )"#,
            r#"CREATE TABLE IF NOT EXISTS deps (
                from_id TEXT NOT NULL,
                to_id TEXT NOT NULL,
                type TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (from_id, to_id, type),
                FOREIGN KEY (from_id) REFERENCES tasks(id) ON DELETE CASCADE,
                FOREIGN KEY (to_id) REFERENCES tasks(id) ON DELETE CASCADE
            )"#,
            r#"CREATE TABLE IF NOT EXISTS blocked_cache (
                task_id TEXT PRIMARY KEY,
                blocked_by TEXT,
                computed_at TEXT NOT NULL,
                FOREIGN KEY (task_id) REFERENCES tasks(id) ON DELETE CASCADE
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(priority)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_assigned ON tasks(assigned_agent)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_defer ON tasks(defer_until)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_blocked ON tasks(is_blocked)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_type ON tasks(type)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_ready_work ON tasks(status, is_blocked, defer_until, priority)",
            "CREATE INDEX IF NOT EXISTS idx_deps_to ON deps(to_id)",
            "CREATE INDEX IF NOT EXISTS idx_deps_from ON deps(from_id)",
            "CREATE INDEX IF NOT EXISTS idx_deps_blocks ON deps(type, from_id) WHERE type = 'blocks'",
        ];

        let conn = self.pool.get().await?;
        for stmt in statements {
            conn.execute(stmt, params![]).await?;
        }

        Ok(())
    }

    /// Insert a task or update all its mutable columns.
    ///
    /// `is_blocked` and `blocking_count` are owned by the closure refresh and
    /// are never written here.
    pub async fn upsert_task(&self, task: &TaskRecord) -> Result<()> {
        task.validate()?;

        let tags_json = serde_json::to_string(&task.tags)?;

        let query = r#"
            INSERT INTO tasks (
                id, title, description, type, status, priority,
                assigned_agent, tags, created_at, updated_at,
                due_at, defer_until, is_blocked, blocking_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, 0)
            ON CONFLICT(id) DO UPDATE SET
                title = excluded.title,
                description = excluded.description,
                type = excluded.type,
                status = excluded.status,
                priority = excluded.priority,
                assigned_agent = excluded.assigned_agent,
                tags = excluded.tags,
                updated_at = excluded.updated_at,
                due_at = excluded.due_at,
                defer_until = excluded.defer_until
        "#;

        let conn = self.pool.get().await?;
        conn.execute(
            query,
            params![
                task.id.clone(),
                task.title.clone(),
                task.description.clone(),
                task.kind.clone(),
                task.status.clone(),
                task.priority,
                task.assigned_agent.clone(),
                tags_json,
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
                task.due_at.map(|dt| dt.to_rfc3339()),
                task.defer_until.map(|dt| dt.to_rfc3339()),
            ],
        )
        .await?;

        Ok(())
    }

    /// Remove a task. Cascades to `deps` and `blocked_cache`; no-op when the
    /// task is absent.
    pub async fn delete_task(&self, task_id: &str) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute("DELETE FROM tasks WHERE id = ?", params![task_id])
            .await?;
        Ok(())
    }

    /// Insert a dependency edge or refresh its `created_at`.
    pub async fn upsert_dep(&self, dep: &DepRecord) -> Result<()> {
        dep.validate()?;

        let query = r#"
            INSERT INTO deps (from_id, to_id, type, created_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(from_id, to_id, type) DO UPDATE SET
                created_at = excluded.created_at
        "#;

        let conn = self.pool.get().await?;
        conn.execute(
            query,
            params![
                dep.from.clone(),
                dep.to.clone(),
                dep.kind.clone(),
                dep.created_at.to_rfc3339(),
            ],
        )
        .await?;

        Ok(())
    }

    /// Remove a dependency edge. Idempotent.
    pub async fn delete_dep(&self, from: &str, kind: &str, to: &str) -> Result<()> {
        let conn = self.pool.get().await?;
        conn.execute(
            "DELETE FROM deps WHERE from_id = ? AND to_id = ? AND type = ?",
            params![from, to, kind],
        )
        .await?;
        Ok(())
    }

    /// Fetch a single task, or `TaskNotFound`.
    pub async fn get_task_by_id(&self, id: &str) -> Result<TaskRecord> {
        let query = format!("SELECT {} FROM tasks WHERE id = ?", TASK_COLUMNS);

        let conn = self.pool.get().await?;
        let mut rows = conn.query(&query, params![id]).await?;

        if let Some(row) = rows.next().await? {
            parse_task_row(&row)
        } else {
            Err(CacheError::TaskNotFound(id.to_string()))
        }
    }

    /// List tasks matching the filter, ordered by `priority ASC, created_at
    /// ASC`.
    pub async fn list_tasks(&self, filter: TaskFilter) -> Result<Vec<TaskRecord>> {
        let mut conditions = Vec::new();
        let mut params_vec: Vec<turso::Value> = Vec::new();

        if let Some(status) = &filter.status {
            conditions.push("status = ?");
            params_vec.push(status.clone().into());
        }

        if let Some(kind) = &filter.kind {
            conditions.push("type = ?");
            params_vec.push(kind.clone().into());
        }

        if let Some(priority) = filter.priority {
            conditions.push("priority = ?");
            params_vec.push(priority.into());
        }

        if let Some(agent) = &filter.assigned_agent {
            conditions.push("assigned_agent = ?");
            params_vec.push(agent.clone().into());
        }

        // Tags are stored as a JSON array; a quoted substring match stands in
        // for a JSON-contains operator.
        if let Some(tag) = &filter.tag {
            conditions.push("tags LIKE ?");
            params_vec.push(format!("%\"{}\"%", tag).into());
        }

        let mut query = format!("SELECT {} FROM tasks", TASK_COLUMNS);

        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }

        query.push_str(" ORDER BY priority ASC, created_at ASC");

        if filter.limit > 0 {
            query.push_str(" LIMIT ?");
            params_vec.push((filter.limit as i64).into());
        }

        if filter.offset > 0 {
            query.push_str(" OFFSET ?");
            params_vec.push((filter.offset as i64).into());
        }

        let conn = self.pool.get().await?;
        let mut rows = conn.query(&query, params_vec).await?;
        let mut tasks = Vec::new();

        while let Some(row) = rows.next().await? {
            tasks.push(parse_task_row(&row)?);
        }

        Ok(tasks)
    }

    /// Find tasks that are ready to work on: open, not blocked, and (unless
    /// `include_deferred`) not deferred into the future.
    ///
    /// Ordered by `priority ASC, created_at ASC`; no other ordering is
    /// promised.
    pub async fn get_ready_tasks(&self, opts: ReadyOptions) -> Result<Vec<TaskRecord>> {
        let mut conditions = vec!["status = 'open'", "is_blocked = 0"];
        let mut params_vec: Vec<turso::Value> = Vec::new();

        if !opts.include_deferred {
            conditions.push("(defer_until IS NULL OR defer_until <= ?)");
            params_vec.push(Utc::now().to_rfc3339().into());
        }

        if let Some(agent) = &opts.assigned_agent {
            conditions.push("assigned_agent = ?");
            params_vec.push(agent.clone().into());
        }

        let mut query = format!(
            "SELECT {} FROM tasks WHERE {} ORDER BY priority ASC, created_at ASC",
            TASK_COLUMNS,
            conditions.join(" AND ")
        );

        if opts.limit > 0 {
            query.push_str(" LIMIT ?");
            params_vec.push((opts.limit as i64).into());
        }

        let conn = self.pool.get().await?;
        let mut rows = conn.query(&query, params_vec).await?;
        let mut tasks = Vec::new();

        while let Some(row) = rows.next().await? {
            tasks.push(parse_task_row(&row)?);
        }

        Ok(tasks)
    }

    /// All open tasks transitively blocking `task_id`, ordered by
    /// `priority ASC, created_at ASC`.
    ///
    /// Walks the same edge set the closure refresh uses: `blocks` edges whose
    /// source is open, self-loops excluded. A closed task neither blocks nor
    /// transmits blockage.
    pub async fn get_blocking_tasks(&self, task_id: &str) -> Result<Vec<TaskRecord>> {
        let conn = self.pool.get().await?;

        let mut blocked_by: HashMap<String, Vec<String>> = HashMap::new();
        let mut rows = conn
            .query(
                "SELECT d.from_id, d.to_id
                 FROM deps d JOIN tasks t ON t.id = d.from_id
                 WHERE d.type = 'blocks' AND t.status != 'closed'
                   AND d.from_id != d.to_id",
                params![],
            )
            .await?;

        while let Some(row) = rows.next().await? {
            let from_id: String = row.get(0)?;
            let to_id: String = row.get(1)?;
            blocked_by.entry(to_id).or_default().push(from_id);
        }
        drop(rows);

        // BFS upstream; every node reached is open by construction.
        let mut blockers = HashSet::new();
        let mut queue = VecDeque::new();

        if let Some(direct) = blocked_by.get(task_id) {
            queue.extend(direct.iter().cloned());
        }

        while let Some(current) = queue.pop_front() {
            if !blockers.insert(current.clone()) {
                continue;
            }
            if let Some(upstream) = blocked_by.get(&current) {
                queue.extend(upstream.iter().cloned());
            }
        }

        if blockers.is_empty() {
            return Ok(Vec::new());
        }

        let placeholders = vec!["?"; blockers.len()].join(",");
        let query = format!(
            "SELECT {} FROM tasks WHERE id IN ({}) ORDER BY priority ASC, created_at ASC",
            TASK_COLUMNS, placeholders
        );

        let params_vec: Vec<turso::Value> = blockers.into_iter().map(|id| id.into()).collect();

        let mut rows = conn.query(&query, params_vec).await?;
        let mut tasks = Vec::new();

        while let Some(row) = rows.next().await? {
            tasks.push(parse_task_row(&row)?);
        }

        Ok(tasks)
    }

    /// All edges touching a task, in either direction.
    pub async fn get_deps_for_task(&self, task_id: &str) -> Result<Vec<DepRecord>> {
        let conn = self.pool.get().await?;
        let mut rows = conn
            .query(
                "SELECT from_id, to_id, type, created_at
                 FROM deps
                 WHERE from_id = ? OR to_id = ?
                 ORDER BY created_at ASC",
                params![task_id, task_id],
            )
            .await?;

        let mut deps = Vec::new();
        while let Some(row) = rows.next().await? {
            deps.push(parse_dep_row(&row)?);
        }

        Ok(deps)
    }

    /// Recompute the blocked closure and `is_blocked` flags.
    ///
    /// Runs inside a single transaction, so readers observe either the old
    /// closure or the new one, never a partial state. The closure is the
    /// fixed point of "blocked by" over `blocks` edges with open sources;
    /// iteration is monotone over a finite lattice, so cycles terminate.
    pub async fn refresh_blocked_cache(&self) -> Result<()> {
        let mut conn = self.pool.get().await?;
        let tx = conn.transaction().await?;

        tx.execute("DELETE FROM blocked_cache", params![]).await?;
        tx.execute("UPDATE tasks SET is_blocked = 0", params![])
            .await?;

        let mut open_tasks = HashSet::new();
        let mut rows = tx
            .query("SELECT id FROM tasks WHERE status != 'closed'", params![])
            .await?;

        while let Some(row) = rows.next().await? {
            let id: String = row.get(0)?;
            open_tasks.insert(id);
        }
        drop(rows);

        // Direct blockers, restricted to open sources. Self-loops carry no
        // meaning for the closure and are skipped.
        let mut closure: HashMap<String, HashSet<String>> = HashMap::new();
        let mut rows = tx
            .query(
                "SELECT from_id, to_id FROM deps WHERE type = 'blocks' AND from_id != to_id",
                params![],
            )
            .await?;

        while let Some(row) = rows.next().await? {
            let from_id: String = row.get(0)?;
            let to_id: String = row.get(1)?;

            if open_tasks.contains(&from_id) {
                closure.entry(to_id).or_default().insert(from_id);
            }
        }
        drop(rows);

        // Fixed point: fold each blocker's own blockers in until a full pass
        // adds nothing.
        let mut changed = true;
        while changed {
            changed = false;
            let task_ids: Vec<String> = closure.keys().cloned().collect();

            for task_id in task_ids {
                let direct: Vec<String> = match closure.get(&task_id) {
                    Some(set) => set.iter().cloned().collect(),
                    None => continue,
                };

                let mut additions = Vec::new();
                for blocker in &direct {
                    if let Some(upstream) = closure.get(blocker) {
                        additions.extend(upstream.iter().cloned());
                    }
                }

                if let Some(set) = closure.get_mut(&task_id) {
                    for id in additions {
                        if set.insert(id) {
                            changed = true;
                        }
                    }
                }
            }
        }

        let now = Utc::now().to_rfc3339();

        for (task_id, blockers) in closure {
            if blockers.is_empty() {
                continue;
            }

            let blocker_list: Vec<String> = blockers.into_iter().collect();
            let blocked_by_json = serde_json::to_string(&blocker_list)?;

            tx.execute(
                "INSERT INTO blocked_cache (task_id, blocked_by, computed_at) VALUES (?, ?, ?)",
                params![task_id.clone(), blocked_by_json, now.clone()],
            )
            .await?;

            tx.execute(
                "UPDATE tasks SET is_blocked = 1 WHERE id = ?",
                params![task_id],
            )
            .await?;
        }

        tx.commit().await?;

        Ok(())
    }

    /// Total number of cached tasks.
    pub async fn task_count(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM tasks").await
    }

    /// Total number of cached edges.
    pub async fn dep_count(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM deps").await
    }

    /// Number of tasks currently flagged blocked.
    pub async fn blocked_count(&self) -> Result<i64> {
        self.scalar("SELECT COUNT(*) FROM tasks WHERE is_blocked = 1")
            .await
    }

    /// Number of tasks currently ready to work on.
    pub async fn ready_count(&self) -> Result<i64> {
        let conn = self.pool.get().await?;
        let mut rows = conn
            .query(
                "SELECT COUNT(*) FROM tasks
                 WHERE status = 'open' AND is_blocked = 0
                   AND (defer_until IS NULL OR defer_until <= ?)",
                params![Utc::now().to_rfc3339()],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }

    /// Aggregate counts: total, per-status, blocked, ready, in-progress.
    pub async fn statistics(&self) -> Result<CacheStats> {
        let mut by_status = HashMap::new();
        let mut total = 0;

        let conn = self.pool.get().await?;
        let mut rows = conn
            .query(
                "SELECT status, COUNT(*) FROM tasks GROUP BY status",
                params![],
            )
            .await?;

        while let Some(row) = rows.next().await? {
            let status: String = row.get(0)?;
            let count: i64 = row.get(1)?;
            total += count;
            by_status.insert(status, count);
        }
        drop(rows);
        drop(conn);

        let in_progress = by_status.get("in_progress").copied().unwrap_or(0);

        Ok(CacheStats {
            total,
            blocked: self.blocked_count().await?,
            ready: self.ready_count().await?,
            in_progress,
            by_status,
        })
    }

    /// Every cached task, newest first. Export support.
    pub async fn list_all_tasks(&self) -> Result<Vec<TaskRecord>> {
        let query = format!(
            "SELECT {} FROM tasks ORDER BY created_at DESC",
            TASK_COLUMNS
        );

        let conn = self.pool.get().await?;
        let mut rows = conn.query(&query, params![]).await?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await? {
            tasks.push(parse_task_row(&row)?);
        }

        Ok(tasks)
    }

    /// Every cached edge, newest first. Export support.
    pub async fn list_all_deps(&self) -> Result<Vec<DepRecord>> {
        let conn = self.pool.get().await?;
        let mut rows = conn
            .query(
                "SELECT from_id, to_id, type, created_at FROM deps ORDER BY created_at DESC",
                params![],
            )
            .await?;

        let mut deps = Vec::new();
        while let Some(row) = rows.next().await? {
            deps.push(parse_dep_row(&row)?);
        }

        Ok(deps)
    }

    async fn scalar(&self, query: &str) -> Result<i64> {
        let conn = self.pool.get().await?;
        let mut rows = conn.query(query, params![]).await?;

        match rows.next().await? {
            Some(row) => Ok(row.get(0)?),
            None => Ok(0),
        }
    }
}

fn parse_task_row(row: &turso::Row) -> Result<TaskRecord> {
    let tags_json: String = row.get(7)?;
    // Older serializers wrote the literal string "null" for no tags.
    let tags: Vec<String> = if tags_json.is_empty() || tags_json == "null" {
        Vec::new()
    } else {
        serde_json::from_str(&tags_json)?
    };

    let created_at_str: String = row.get(8)?;
    let updated_at_str: String = row.get(9)?;
    let due_at_str: Option<String> = row.get(10)?;
    let defer_until_str: Option<String> = row.get(11)?;

    Ok(TaskRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        kind: row.get(3)?,
        status: row.get(4)?,
        priority: row.get(5)?,
        assigned_agent: row.get(6)?,
        tags,
        created_at: parse_timestamp(&created_at_str, "created_at")?,
        updated_at: parse_timestamp(&updated_at_str, "updated_at")?,
        due_at: due_at_str.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }),
        defer_until: defer_until_str.and_then(|s| {
            DateTime::parse_from_rfc3339(&s)
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }),
    })
}

fn parse_dep_row(row: &turso::Row) -> Result<DepRecord> {
    let created_at_str: String = row.get(3)?;

    Ok(DepRecord {
        from: row.get(0)?,
        to: row.get(1)?,
        kind: row.get(2)?,
        created_at: parse_timestamp(&created_at_str, "created_at")?,
    })
}

fn parse_timestamp(value: &str, column: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| CacheError::Other(format!("failed to parse {}: {}", column, e)))
}
