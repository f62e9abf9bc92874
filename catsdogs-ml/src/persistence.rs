//! Atomic JSON persistence for cached run results.
//!
//! Results are written to a `.tmp` sibling and renamed into place, so a crash
//! mid-write never leaves a truncated result file under the final name.

use crate::error::MlError;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Serialize `data` as pretty JSON and write it atomically to `path`.
///
/// Creates parent directories if they don't exist.
pub fn atomic_write_json<T: Serialize>(path: &Path, data: &T) -> Result<(), MlError> {
    let json = serde_json::to_string_pretty(data)?;
    atomic_write(path, json.as_bytes())
}

/// Write raw bytes to a `.tmp` sibling, then rename onto `path`.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), MlError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read and deserialize JSON from `path`.
///
/// Returns `Ok(None)` when the file doesn't exist. A file that exists but
/// does not parse is an error; callers never silently recompute over it.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, MlError> {
    if !path.exists() {
        return Ok(None);
    }
    let data = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&data)?))
}
