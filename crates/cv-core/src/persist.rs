//! Atomic JSON document storage shared by the on-disk stores.
//!
//! Writes go to a sibling `*.tmp` file which is fsynced and renamed over the
//! target, so readers never observe a half-written document.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::AsyncWriteExt;

/// Serialize `value` as pretty JSON and atomically replace `path`.
pub async fn write_json_atomic<T, E>(path: &Path, value: &T) -> Result<(), E>
where
    T: Serialize + ?Sized,
    E: From<std::io::Error> + From<serde_json::Error>,
{
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(value)?;

    let tmp = tmp_path(path);
    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

/// Read a JSON document, returning `None` when the file does not exist.
pub async fn read_json_opt<T, E>(path: &Path) -> Result<Option<T>, E>
where
    T: DeserializeOwned,
    E: From<std::io::Error> + From<serde_json::Error>,
{
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
