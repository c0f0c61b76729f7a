//! Shared filesystem plumbing for the two flat-file stores.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use skein_core::Result;
use tokio::fs;

/// Every regular `.json` file directly inside `dir`. A missing directory is
/// an empty store, not an error.
pub(crate) async fn json_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();

    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(found),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|s| s.to_str()) == Some("json") && path.is_file() {
            found.push(path);
        }
    }

    Ok(found)
}

/// Remove a file, treating "already gone" as success.
pub(crate) async fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// Write `data` to `path` atomically: land it in a `.json.tmp` sibling
/// (invisible to the `.json` filters downstream) and rename into place.
/// Creates the parent directory as needed.
pub(crate) async fn write_json_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await?;
    }

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).await?;
    fs::rename(&tmp, path).await?;

    Ok(())
}
