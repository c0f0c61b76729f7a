//! Reading and writing task JSON files.
//!
//! One task per file under `tasks/`, pretty-printed, named `{id}.json`. The
//! filename is the identity: a reader rejects a file whose body claims a
//! different id, since downstream deletes resolve ids from filenames alone.

use skein_core::{task_id_from_filename, Error, Result, TaskRecord};
use std::path::Path;
use tokio::fs;
use tracing::warn;

use crate::fsio;

/// Read, validate, and identity-check a single task file.
pub async fn read_task_file(path: &Path) -> Result<TaskRecord> {
    let raw = fs::read_to_string(path).await?;
    let task: TaskRecord = serde_json::from_str(&raw)?;
    task.validate()?;

    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        let id = task_id_from_filename(name)?;
        if id != task.id {
            return Err(Error::Validation(format!(
                "file {} holds task id {}",
                name, task.id
            )));
        }
    }

    Ok(task)
}

/// Write a task to `{tasks_dir}/{id}.json` as pretty-printed JSON, via an
/// atomic temp-then-rename so no reader ever sees a half-written record.
pub async fn write_task_file(tasks_dir: &Path, task: &TaskRecord) -> Result<()> {
    task.validate()?;

    let body = serde_json::to_vec_pretty(task)?;
    fsio::write_json_atomic(&tasks_dir.join(task.filename()), &body).await
}

/// Read every task file in a directory, skipping unreadable ones with a
/// warning. A missing directory is an empty store.
pub async fn read_all_task_files(tasks_dir: &Path) -> Result<Vec<TaskRecord>> {
    let mut tasks = Vec::new();

    for path in fsio::json_files(tasks_dir).await? {
        match read_task_file(&path).await {
            Ok(task) => tasks.push(task),
            Err(e) => warn!("Skipping task file {}: {}", path.display(), e),
        }
    }

    Ok(tasks)
}

/// Delete `{tasks_dir}/{id}.json`. Idempotent.
pub async fn delete_task_file(tasks_dir: &Path, id: &str) -> Result<()> {
    fsio::remove_if_present(&tasks_dir.join(format!("{}.json", id))).await
}
