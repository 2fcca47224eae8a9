//! Filesystem helpers shared across modules.
//!
//! These helpers provide consistent error context (operation + path) and
//! reduce duplicated `create_dir_all` / parent-directory checks.

use std::path::Path;

use crate::{Error, Result};

/// Convert an IO error into an application error with operation + path context.
pub fn io_error(op: &'static str, path: &Path, source: std::io::Error) -> Error {
    Error::io_path(op, path, source)
}

/// Ensure a directory exists, creating it (recursively) if needed.
pub async fn ensure_dir_all_with_op(op: &'static str, path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| io_error(op, path, e))
}

/// Ensure the parent directory of a file path exists.
pub async fn ensure_parent_dir(path: &Path) -> Result<()> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    ensure_dir_all_with_op("creating directory", parent).await
}

/// Ensure a directory exists (synchronous variant) with a custom operation label.
pub fn ensure_dir_all_sync_with_op(op: &'static str, path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).map_err(|e| io_error(op, path, e))
}

/// Whether a file exists at `path`.
pub async fn file_exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| io_error("checking", path, e))
}

/// Write `contents` to `path`, creating parent directories first.
///
/// Data goes to a sibling `.part` file that is then renamed over the target.
pub async fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    ensure_parent_dir(path).await?;

    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".part");
    let tmp = std::path::PathBuf::from(tmp);

    tokio::fs::write(&tmp, contents)
        .await
        .map_err(|e| io_error("writing", &tmp, e))?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(io_error("renaming", path, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_file_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/c.strm");

        assert!(!file_exists(&path).await.unwrap());
        write_file(&path, b"http://host/d/c.mp4").await.unwrap();
        assert!(file_exists(&path).await.unwrap());
        assert_eq!(
            tokio::fs::read_to_string(&path).await.unwrap(),
            "http://host/d/c.mp4"
        );

        write_file(&path, b"replaced").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "replaced");
        assert!(!file_exists(&dir.path().join("a/b/c.strm.part")).await.unwrap());
    }
}
