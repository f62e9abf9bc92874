//! Run cache: skip experiments whose results are already on disk.
//!
//! Each orchestrator declares one key struct naming exactly the fields that
//! identify a run. The key is serialized to canonical JSON (object keys
//! sorted), prefixed with its kind and version, and hashed with SHA-256. The
//! result file is `<prefix>_<16 hex chars>.json` inside the cache directory.

use crate::error::MlError;
use crate::persistence::{atomic_write_json, load_json};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::info;

/// Hex characters of the digest kept in the file name.
const FINGERPRINT_LEN: usize = 16;

/// An explicit, versioned description of what a cached result depends on.
pub trait CacheKey: Serialize {
    /// File name prefix, e.g. `single_model_run`.
    const PREFIX: &'static str;
    /// Bump when the key fields or the result layout change.
    const VERSION: u32;
    /// Human-readable name used in the cache-hit notice.
    const LABEL: &'static str;
}

#[derive(Serialize)]
struct Fingerprinted<'a, K> {
    kind: &'static str,
    version: u32,
    key: &'a K,
}

/// On-disk layout of a cached result.
#[derive(Debug, Serialize, Deserialize)]
pub struct CacheEntry<K, T> {
    pub kind: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub key: K,
    pub result: T,
}

/// Canonical JSON of `key` with its kind and version. Object keys are sorted,
/// so the text depends only on field values.
pub fn canonical_json<K: CacheKey>(key: &K) -> Result<String, MlError> {
    let value = serde_json::to_value(Fingerprinted {
        kind: K::PREFIX,
        version: K::VERSION,
        key,
    })?;
    Ok(serde_json::to_string(&value)?)
}

/// Full SHA-256 hex digest of [`canonical_json`].
pub fn fingerprint<K: CacheKey>(key: &K) -> Result<String, MlError> {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json(key)?.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

/// Directory of cached run results.
#[derive(Debug, Clone)]
pub struct RunCache {
    dir: PathBuf,
}

impl RunCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Result file for `key`.
    pub fn path_for<K: CacheKey>(&self, key: &K) -> Result<PathBuf, MlError> {
        let digest = fingerprint(key)?;
        Ok(self
            .dir
            .join(format!("{}_{}.json", K::PREFIX, &digest[..FINGERPRINT_LEN])))
    }

    pub fn contains<K: CacheKey>(&self, key: &K) -> Result<bool, MlError> {
        Ok(self.path_for(key)?.exists())
    }

    /// Load the result for `key` if its file exists, otherwise run `compute`,
    /// persist its result atomically and return it.
    ///
    /// An existing file is trusted as complete. If it cannot be parsed the
    /// error is returned; the run is not recomputed.
    pub fn get_or_compute<K, T, F>(&self, key: &K, compute: F) -> Result<T, MlError>
    where
        K: CacheKey,
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, MlError>,
    {
        let path = self.path_for(key)?;

        if let Some(entry) = load_json::<CacheEntry<serde_json::Value, T>>(&path)? {
            info!(
                path = %path.display(),
                created_at = %entry.created_at,
                "{} already complete, loading results from disk.",
                K::LABEL
            );
            return Ok(entry.result);
        }

        info!(path = %path.display(), "{} not cached, computing", K::LABEL);
        let result = compute()?;

        let entry = CacheEntry {
            kind: K::PREFIX.to_string(),
            version: K::VERSION,
            created_at: Utc::now(),
            key,
            result: &result,
        };
        atomic_write_json(&path, &entry)?;
        Ok(result)
    }
}
