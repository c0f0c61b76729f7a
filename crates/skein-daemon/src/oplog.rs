//! Operation-log tailer: change detection through the VCS instead of the OS.
//!
//! Where the file watcher reacts to raw filesystem events, the tailer polls
//! the jj operation log and asks the VCS which task/dep files each new
//! operation touched. That makes it the better source when every mutation
//! flows through the VCS anyway: one operation maps to one batch of affected
//! files, however many writes it contained.
//!
//! The log is requested as one tab-separated record per line (`id <TAB>
//! description`), so a poll is: read the window, cut it at the last id we
//! acted on, resolve each fresh operation's file set, hand the batch to the
//! callback oldest-first.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use skein_core::{Error, Result};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

/// How many log entries one poll inspects. Anything older than this window
/// is treated like a garbage-collected baseline.
const LOG_WINDOW: &str = "50";

/// A single entry from the operation log.
#[derive(Debug, Clone)]
pub struct Operation {
    /// Opaque operation id (hex string).
    pub id: String,

    /// Human-readable description, e.g. "snapshot working copy".
    pub description: String,

    /// Task/dep files this operation touched, relative to the repo root.
    pub files: Vec<PathBuf>,
}

/// Tailer configuration.
#[derive(Debug, Clone)]
pub struct OpLogConfig {
    /// Repository root to poll.
    pub repo_path: PathBuf,

    /// Polling cadence.
    pub poll_interval: Duration,

    /// Task directory name, relative to the repo root.
    pub tasks_dir: String,

    /// Dep directory name, relative to the repo root.
    pub deps_dir: String,

    /// Resume point. `None` starts from the most recent operation.
    pub last_op_id: Option<String>,
}

impl Default for OpLogConfig {
    fn default() -> Self {
        Self {
            repo_path: PathBuf::from("."),
            poll_interval: Duration::from_millis(100),
            tasks_dir: "tasks".to_string(),
            deps_dir: "deps".to_string(),
            last_op_id: None,
        }
    }
}

/// Polls the jj operation log and reports affected files per operation.
pub struct OpLogTailer {
    config: OpLogConfig,
    last_seen: Option<String>,
}

impl OpLogTailer {
    pub fn new(config: OpLogConfig) -> Result<Self> {
        if !config.repo_path.exists() {
            return Err(Error::OpLog(format!(
                "repository path does not exist: {}",
                config.repo_path.display()
            )));
        }

        Ok(Self {
            last_seen: config.last_op_id.clone(),
            config,
        })
    }

    /// True when a `jj` binary is on PATH.
    pub async fn is_jj_available() -> bool {
        probe(&["--version"], None).await
    }

    /// True when `repo_path` is inside a jj repository.
    pub async fn is_jj_repo(repo_path: &Path) -> bool {
        probe(&["workspace", "root"], Some(repo_path)).await
    }

    /// Id of the most recent operation. Callers persisting a resume point
    /// feed this back in as [`OpLogConfig::last_op_id`].
    pub async fn latest_operation_id(&self) -> Result<String> {
        let out = self.run_jj(&["op", "log", "--no-graph", "-n", "1", "-T", "id"]).await?;
        let id = out.trim();
        if id.is_empty() {
            return Err(Error::OpLog("operation log is empty".to_string()));
        }
        Ok(id.to_string())
    }

    /// Poll until cancelled, delivering new operations to `callback` in
    /// chronological order (oldest first).
    ///
    /// Transient jj failures and callback errors are logged; the loop keeps
    /// going and retries at the next tick.
    pub async fn watch<F>(mut self, callback: F) -> Result<()>
    where
        F: Fn(&[Operation]) -> Result<()> + Send + Sync + 'static,
    {
        if !Self::is_jj_available().await {
            return Err(Error::OpLog("no jj binary on PATH".to_string()));
        }
        if !Self::is_jj_repo(&self.config.repo_path).await {
            return Err(Error::OpLog(format!(
                "{} is not inside a jj repository",
                self.config.repo_path.display()
            )));
        }

        info!(
            "Tailing jj op log at {} every {:?}",
            self.config.repo_path.display(),
            self.config.poll_interval
        );

        let mut ticker = tokio::time::interval(self.config.poll_interval);

        loop {
            ticker.tick().await;

            let batch = match self.collect_new().await {
                Ok(batch) => batch,
                Err(e) => {
                    // Retried at the next tick.
                    error!("Op-log poll failed: {}", e);
                    continue;
                }
            };

            if batch.is_empty() {
                continue;
            }

            debug!("{} new operations", batch.len());
            self.last_seen = batch.last().map(|op| op.id.clone());

            if let Err(e) = callback(&batch) {
                error!("Op-log callback error: {}", e);
            }
        }
    }

    /// One poll: read the log window, keep what is newer than `last_seen`,
    /// resolve affected files, return oldest-first.
    pub(crate) async fn collect_new(&self) -> Result<Vec<Operation>> {
        let entries = self.read_log().await?;
        let mut fresh = newer_than(&entries, self.last_seen.as_deref());
        fresh.reverse();

        for op in fresh.iter_mut() {
            op.files = match self.op_diff_files(&op.id).await {
                Ok(files) => files,
                Err(e) => {
                    warn!("No file set for operation {}: {}", brief(&op.id), e);
                    Vec::new()
                }
            };
        }

        Ok(fresh)
    }

    /// The newest `LOG_WINDOW` operations, newest first.
    async fn read_log(&self) -> Result<Vec<Operation>> {
        let out = self
            .run_jj(&[
                "op",
                "log",
                "--no-graph",
                "-n",
                LOG_WINDOW,
                "-T",
                r#"id ++ "\t" ++ description ++ "\n""#,
            ])
            .await?;
        Ok(parse_log_lines(&out))
    }

    /// Files changed by one operation, filtered to in-scope `.json` paths.
    async fn op_diff_files(&self, op_id: &str) -> Result<Vec<PathBuf>> {
        let out = self
            .run_jj(&["op", "show", op_id, "--op-diff", "--patch"])
            .await?;
        Ok(scope_files(&out, &self.config.tasks_dir, &self.config.deps_dir))
    }

    async fn run_jj(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("jj")
            .args(args)
            .current_dir(&self.config.repo_path)
            .output()
            .await
            .map_err(|e| Error::OpLog(format!("could not spawn jj: {}", e)))?;

        if !output.status.success() {
            return Err(Error::OpLog(format!(
                "jj {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Cheap yes/no jj invocation.
async fn probe(args: &[&str], dir: Option<&Path>) -> bool {
    let mut cmd = Command::new("jj");
    cmd.args(args);
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }
    matches!(cmd.output().await, Ok(out) if out.status.success())
}

fn brief(id: &str) -> &str {
    &id[..id.len().min(12)]
}

/// Parse tab-separated log records. A line without a tab continues the
/// previous entry's description (jj descriptions may wrap).
fn parse_log_lines(text: &str) -> Vec<Operation> {
    let mut ops: Vec<Operation> = Vec::new();

    for line in text.lines() {
        match line.split_once('\t') {
            Some((id, description)) if !id.trim().is_empty() => ops.push(Operation {
                id: id.trim().to_string(),
                description: description.trim().to_string(),
                files: Vec::new(),
            }),
            _ => {
                let continuation = line.trim();
                if continuation.is_empty() {
                    continue;
                }
                if let Some(prev) = ops.last_mut() {
                    prev.description.push(' ');
                    prev.description.push_str(continuation);
                }
            }
        }
    }

    ops
}

/// Cut a newest-first entry list at `last_seen`.
///
/// Without a baseline only the newest entry is returned — the first poll
/// establishes where "new" begins rather than replaying history. The same
/// applies when `last_seen` has aged out of the window (garbage-collected).
fn newer_than(entries: &[Operation], last_seen: Option<&str>) -> Vec<Operation> {
    let Some(last) = last_seen else {
        return entries.iter().take(1).cloned().collect();
    };

    let fresh: Vec<Operation> = entries
        .iter()
        .take_while(|entry| entry.id != last)
        .cloned()
        .collect();

    if fresh.len() == entries.len() {
        entries.iter().take(1).cloned().collect()
    } else {
        fresh
    }
}

fn file_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:Added|Modified|Removed) regular file (?P<path>.+):$")
            .expect("static pattern")
    })
}

/// Pull in-scope `.json` paths out of `jj op show --op-diff --patch` output.
///
/// A path is in scope when it sits directly in the tasks or deps directory;
/// anything nested deeper is someone else's file.
fn scope_files(diff: &str, tasks_dir: &str, deps_dir: &str) -> Vec<PathBuf> {
    let mut seen = HashSet::new();

    diff.lines()
        .filter_map(|line| file_line_re().captures(line.trim()))
        .filter_map(|caps| caps.name("path").map(|m| m.as_str().to_string()))
        .filter(|path| path.ends_with(".json"))
        .filter(|path| directly_in(path, tasks_dir) || directly_in(path, deps_dir))
        .filter(|path| seen.insert(path.clone()))
        .map(PathBuf::from)
        .collect()
}

fn directly_in(path: &str, dir: &str) -> bool {
    path.strip_prefix(dir)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|name| !name.is_empty() && !name.contains('/'))
}
