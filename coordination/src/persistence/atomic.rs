//! Write-to-temp-then-rename, the one primitive every persisted file goes
//! through.

use serde::Serialize;
use std::path::Path;

use super::{PersistenceError, PersistenceResult};

pub async fn write_atomic<T: Serialize>(path: &Path, value: &T) -> PersistenceResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| PersistenceError::Io { path: parent.to_path_buf(), source })?;
    }
    let text = serde_json::to_string_pretty(value)?;
    let tmp_path = path.with_extension(format!("tmp.{}", std::process::id()));
    tokio::fs::write(&tmp_path, text)
        .await
        .map_err(|source| PersistenceError::Io { path: tmp_path.clone(), source })?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|source| PersistenceError::Io { path: path.to_path_buf(), source })?;
    Ok(())
}
