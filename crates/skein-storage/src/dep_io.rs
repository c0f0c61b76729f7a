//! Reading and writing dependency edge files.
//!
//! One edge per file under `deps/`, named `{from}--{type}--{to}.json`. The
//! triple in the filename is the identity; a reader rejects a file whose
//! body disagrees with it, since downstream deletes resolve the triple from
//! the filename alone.

use skein_core::{parse_dep_filename, DepRecord, Error, Result};
use std::path::Path;
use tokio::fs;
use tracing::warn;

use crate::fsio;

/// Read, validate, and identity-check a single edge file.
pub async fn read_dep_file(path: &Path) -> Result<DepRecord> {
    let raw = fs::read_to_string(path).await?;
    let dep: DepRecord = serde_json::from_str(&raw)?;
    dep.validate()?;

    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
        let (from, kind, to) = parse_dep_filename(name)?;
        if (from.as_str(), kind.as_str(), to.as_str())
            != (dep.from.as_str(), dep.kind.as_str(), dep.to.as_str())
        {
            return Err(Error::Validation(format!(
                "file {} holds edge {} --{}--> {}",
                name, dep.from, dep.kind, dep.to
            )));
        }
    }

    Ok(dep)
}

/// Write an edge to `{deps_dir}/{from}--{type}--{to}.json`, atomically like
/// task writes.
pub async fn write_dep_file(deps_dir: &Path, dep: &DepRecord) -> Result<()> {
    dep.validate()?;

    let body = serde_json::to_vec_pretty(dep)?;
    fsio::write_json_atomic(&deps_dir.join(dep.filename()), &body).await
}

/// Read every edge file in a directory, skipping unreadable ones with a
/// warning. A missing directory is an empty store.
pub async fn read_all_dep_files(deps_dir: &Path) -> Result<Vec<DepRecord>> {
    let mut deps = Vec::new();

    for path in fsio::json_files(deps_dir).await? {
        match read_dep_file(&path).await {
            Ok(dep) => deps.push(dep),
            Err(e) => warn!("Skipping dep file {}: {}", path.display(), e),
        }
    }

    Ok(deps)
}

/// Delete `{deps_dir}/{from}--{type}--{to}.json`. Idempotent.
pub async fn delete_dep_file(deps_dir: &Path, from: &str, kind: &str, to: &str) -> Result<()> {
    fsio::remove_if_present(&deps_dir.join(format!("{}--{}--{}.json", from, kind, to))).await
}

/// Every edge whose filename names `task_id` as either endpoint.
///
/// The triple comes from the filename, so only matching files are opened at
/// all; unparseable names are skipped with a warning.
pub async fn find_deps_for_task(deps_dir: &Path, task_id: &str) -> Result<Vec<DepRecord>> {
    let mut deps = Vec::new();

    for path in fsio::json_files(deps_dir).await? {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        let (from, _, to) = match parse_dep_filename(name) {
            Ok(triple) => triple,
            Err(e) => {
                warn!("Skipping dep file with unparseable name {}: {}", name, e);
                continue;
            }
        };

        if from != task_id && to != task_id {
            continue;
        }

        match read_dep_file(&path).await {
            Ok(dep) => deps.push(dep),
            Err(e) => warn!("Skipping dep file {}: {}", name, e),
        }
    }

    Ok(deps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::TempDir;

    fn edge(from: &str, to: &str, kind: &str) -> DepRecord {
        DepRecord {
            from: from.to_string(),
            to: to.to_string(),
            kind: kind.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_write_and_read_round_trip() {
        let temp = TempDir::new().unwrap();

        let dep = edge("sk-1", "sk-2", "blocks");
        write_dep_file(temp.path(), &dep).await.unwrap();

        let path = temp.path().join("sk-1--blocks--sk-2.json");
        assert!(path.exists());

        let read = read_dep_file(&path).await.unwrap();
        assert_eq!(read.from, "sk-1");
        assert_eq!(read.to, "sk-2");
        assert_eq!(read.kind, "blocks");
    }

    #[tokio::test]
    async fn test_read_rejects_filename_triple_mismatch() {
        let temp = TempDir::new().unwrap();

        write_dep_file(temp.path(), &edge("sk-1", "sk-2", "blocks"))
            .await
            .unwrap();
        fs::rename(
            temp.path().join("sk-1--blocks--sk-2.json"),
            temp.path().join("sk-1--related--sk-2.json"),
        )
        .await
        .unwrap();

        assert!(
            read_dep_file(&temp.path().join("sk-1--related--sk-2.json"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_find_deps_for_task() {
        let temp = TempDir::new().unwrap();

        write_dep_file(temp.path(), &edge("sk-1", "sk-2", "blocks"))
            .await
            .unwrap();
        write_dep_file(temp.path(), &edge("sk-2", "sk-3", "related"))
            .await
            .unwrap();
        write_dep_file(temp.path(), &edge("sk-4", "sk-5", "blocks"))
            .await
            .unwrap();

        let deps = find_deps_for_task(temp.path(), "sk-2").await.unwrap();
        assert_eq!(deps.len(), 2);

        let deps = find_deps_for_task(temp.path(), "sk-5").await.unwrap();
        assert_eq!(deps.len(), 1);

        let deps = find_deps_for_task(temp.path(), "sk-999").await.unwrap();
        assert!(deps.is_empty());
    }

    #[tokio::test]
    async fn test_read_all_skips_invalid() {
        let temp = TempDir::new().unwrap();

        write_dep_file(temp.path(), &edge("sk-1", "sk-2", "blocks"))
            .await
            .unwrap();
        fs::write(temp.path().join("sk-9--x--sk-8.json"), "{}")
            .await
            .unwrap();

        let deps = read_all_dep_files(temp.path()).await.unwrap();
        assert_eq!(deps.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let temp = TempDir::new().unwrap();

        write_dep_file(temp.path(), &edge("sk-1", "sk-2", "blocks"))
            .await
            .unwrap();

        delete_dep_file(temp.path(), "sk-1", "blocks", "sk-2")
            .await
            .unwrap();
        assert!(!temp.path().join("sk-1--blocks--sk-2.json").exists());

        delete_dep_file(temp.path(), "sk-1", "blocks", "sk-2")
            .await
            .unwrap();
    }
}
