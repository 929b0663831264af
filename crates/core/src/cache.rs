//! Content-addressed, disk-backed store of accepted generation outputs.
//!
//! Layout, one pair of files per entry:
//!
//! ```text
//! {cache_dir}/{key}.cache   JSON record {value, timestamp, ttl}
//! {cache_dir}/{key}.png     image payload
//! ```
//!
//! Both files are written to a temporary name and renamed into place,
//! payload first, so a reader never sees a record whose payload is
//! missing or half-written. Expiry is checked by [`ResultCache::get`];
//! expired and unreadable entries are deleted on access and reported as
//! misses, never as errors.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::{Clock, SystemClock};
use crate::error::CoreError;
use crate::types::Timestamp;

const RECORD_EXT: &str = "cache";
const PAYLOAD_EXT: &str = "png";
const TMP_MARKER: &str = ".tmp-";

/// Metadata stored alongside a cached image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedValue {
    /// File name of the payload, relative to the cache directory.
    pub payload_file: String,
    pub backend_used: String,
    pub score: Option<f64>,
}

/// On-disk record format.
#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    value: CachedValue,
    timestamp: Timestamp,
    /// Time-to-live in seconds.
    ttl: u64,
}

/// A valid (unexpired) cache entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: String,
    pub payload_path: PathBuf,
    pub created_at: Timestamp,
    pub ttl: Duration,
    pub backend_used: String,
    pub score: Option<f64>,
}

/// Whether an entry created at `created_at` is still valid at `now`.
pub fn is_fresh(created_at: Timestamp, ttl: Duration, now: Timestamp) -> bool {
    match chrono::Duration::from_std(ttl) {
        Ok(ttl) => now.signed_duration_since(created_at) < ttl,
        // A TTL too large for chrono never expires.
        Err(_) => true,
    }
}

/// Disk-backed result cache rooted at one directory.
pub struct ResultCache {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultCache").field("dir", &self.dir).finish()
    }
}

impl ResultCache {
    /// Open (creating if needed) a cache directory using wall-clock time.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, CoreError> {
        Self::with_clock(dir, Arc::new(SystemClock)).await
    }

    /// Open a cache directory with an explicit time source.
    pub async fn with_clock(
        dir: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir, clock })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Look up a key. Absent, expired and corrupt entries all return `None`.
    pub async fn get(&self, key: &str) -> Option<CacheEntry> {
        if validate_key(key).is_err() {
            return None;
        }

        let record = match self.read_record(key).await {
            Ok(Some(record)) => record,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "Discarding unreadable cache entry");
                self.remove_entry(key).await;
                return None;
            }
        };

        let ttl = Duration::from_secs(record.ttl);
        if !is_fresh(record.timestamp, ttl, self.clock.now()) {
            tracing::debug!(key, "Cache entry expired");
            self.remove_entry(key).await;
            return None;
        }

        let payload_path = self.dir.join(&record.value.payload_file);
        if !tokio::fs::try_exists(&payload_path).await.unwrap_or(false) {
            tracing::warn!(key, "Cache record without payload, discarding");
            self.remove_entry(key).await;
            return None;
        }

        Some(CacheEntry {
            key: key.to_string(),
            payload_path,
            created_at: record.timestamp,
            ttl,
            backend_used: record.value.backend_used,
            score: record.value.score,
        })
    }

    /// Store `payload` (PNG bytes) under `key` for `ttl`.
    pub async fn put(
        &self,
        key: &str,
        payload: &[u8],
        backend_used: &str,
        score: Option<f64>,
        ttl: Duration,
    ) -> Result<CacheEntry, CoreError> {
        validate_key(key)?;

        let payload_file = format!("{key}.{PAYLOAD_EXT}");
        let payload_path = self.dir.join(&payload_file);
        write_atomic(&payload_path, payload).await?;

        let created_at = self.clock.now();
        let record = CacheRecord {
            value: CachedValue {
                payload_file,
                backend_used: backend_used.to_string(),
                score,
            },
            timestamp: created_at,
            ttl: ttl.as_secs(),
        };
        let bytes = serde_json::to_vec(&record)
            .map_err(|e| CoreError::Internal(format!("Failed to serialize cache record: {e}")))?;
        write_atomic(&self.record_path(key), &bytes).await?;

        tracing::debug!(key, bytes = payload.len(), ttl_secs = ttl.as_secs(), "Cache entry written");

        Ok(CacheEntry {
            key: key.to_string(),
            payload_path,
            created_at,
            ttl: Duration::from_secs(ttl.as_secs()),
            backend_used: backend_used.to_string(),
            score,
        })
    }

    /// Read a cached image. A payload that cannot be decoded invalidates the entry.
    pub async fn load_image(&self, entry: &CacheEntry) -> Option<image::DynamicImage> {
        let decoded = match tokio::fs::read(&entry.payload_path).await {
            Ok(bytes) => image::load_from_memory(&bytes).map_err(CoreError::from),
            Err(e) => Err(CoreError::from(e)),
        };
        match decoded {
            Ok(img) => Some(img),
            Err(e) => {
                let corruption = CoreError::CacheCorruption {
                    key: entry.key.clone(),
                    reason: e.to_string(),
                };
                tracing::warn!(error = %corruption, "Discarding cache entry");
                self.remove_entry(&entry.key).await;
                None
            }
        }
    }

    /// Delete one entry if present.
    pub async fn invalidate(&self, key: &str) {
        if validate_key(key).is_ok() {
            self.remove_entry(key).await;
        }
    }

    /// Remove expired and corrupt entries, orphaned payloads and stale temp files.
    ///
    /// Returns the number of entries removed.
    pub async fn purge_expired(&self) -> Result<usize, CoreError> {
        let now = self.clock.now();
        let mut removed = 0usize;
        let mut live_payloads = Vec::new();
        let mut candidates = Vec::new();

        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name().to_string_lossy().into_owned();
            if name.contains(TMP_MARKER) {
                let _ = tokio::fs::remove_file(item.path()).await;
                continue;
            }
            if let Some(key) = name.strip_suffix(&format!(".{RECORD_EXT}")) {
                let key = key.to_string();
                match self.read_record(&key).await {
                    Ok(Some(record)) if is_fresh(record.timestamp, Duration::from_secs(record.ttl), now) => {
                        live_payloads.push(record.value.payload_file);
                    }
                    Ok(None) => {}
                    _ => {
                        self.remove_entry(&key).await;
                        removed += 1;
                    }
                }
            } else if name.ends_with(&format!(".{PAYLOAD_EXT}")) {
                candidates.push(name);
            }
        }

        for payload in candidates {
            if !live_payloads.contains(&payload) {
                let _ = tokio::fs::remove_file(self.dir.join(&payload)).await;
            }
        }

        if removed > 0 {
            tracing::info!(removed, "Purged expired cache entries");
        }
        Ok(removed)
    }

    /// Remove every entry. Returns the number of records deleted.
    pub async fn clear(&self) -> Result<usize, CoreError> {
        let mut removed = 0usize;
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            if path.extension().is_some_and(|ext| ext == RECORD_EXT) {
                removed += 1;
            }
            if item.file_type().await?.is_file() {
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(removed)
    }

    // ---- private helpers ----

    fn record_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{RECORD_EXT}"))
    }

    /// `Ok(None)` when the record does not exist; `Err` when it is unreadable.
    async fn read_record(&self, key: &str) -> Result<Option<CacheRecord>, CoreError> {
        let bytes = match tokio::fs::read(self.record_path(key)).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let record: CacheRecord =
            serde_json::from_slice(&bytes).map_err(|e| CoreError::CacheCorruption {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
        if record.value.payload_file.contains(['/', '\\']) {
            return Err(CoreError::CacheCorruption {
                key: key.to_string(),
                reason: "payload path escapes cache directory".to_string(),
            });
        }
        Ok(Some(record))
    }

    async fn remove_entry(&self, key: &str) {
        for path in [
            self.record_path(key),
            self.dir.join(format!("{key}.{PAYLOAD_EXT}")),
        ] {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "Failed to remove cache file");
                }
            }
        }
    }
}

/// Keys are hex digests; anything else could escape the cache directory.
fn validate_key(key: &str) -> Result<(), CoreError> {
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(CoreError::Validation(format!("Invalid cache key '{key}'")));
    }
    Ok(())
}

/// Write to a sibling temp file, then rename over the destination.
async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), CoreError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!("{file_name}{TMP_MARKER}{}", uuid::Uuid::new_v4()));

    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
