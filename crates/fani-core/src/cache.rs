//! Local bytecode cache with single-flight fetches.
//!
//! Bytecode is materialized as one file per address under the cache
//! directory. A fetch writes to a uniquely named temporary file, checks the
//! hash, and only then renames the file into place, so a file named after
//! an address always holds exactly those bytes.
//!
//! Concurrent [`BytecodeCache::ensure`] calls for the same address share a
//! single fetch and all observe its outcome. Distinct addresses never wait
//! on each other beyond the short bookkeeping critical sections.

use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use fani_store::{ContentAddress, ContentStore};
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Suffix of in-progress downloads, which are prefixed with a dot.
const PARTIAL_SUFFIX: &str = ".partial";

type SharedFetch = Shared<BoxFuture<'static, Result<CacheEntry>>>;

/// A bytecode blob materialized on local disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub address: ContentAddress,
    /// Path of the verified blob.
    pub path: PathBuf,
    pub fetched_at: DateTime<Utc>,
    /// Size in bytes.
    pub size: u64,
}

/// Cache statistics for observability.
///
/// All counters are atomic and can be read without locking.
#[derive(Debug, Default)]
pub struct CacheStats {
    /// `ensure` calls answered without a store fetch.
    pub hits: AtomicU64,
    /// Store fetches started.
    pub fetches: AtomicU64,
    /// Fetches rejected because the content hashed to another address.
    pub integrity_failures: AtomicU64,
}

impl CacheStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn integrity_failures(&self) -> u64 {
        self.integrity_failures.load(Ordering::Relaxed)
    }
}

/// De-duplicating on-disk cache of bytecode, keyed by content address.
pub struct BytecodeCache {
    dir: PathBuf,
    store: Arc<dyn ContentStore>,
    entries: RwLock<HashMap<ContentAddress, CacheEntry>>,
    inflight: Mutex<HashMap<ContentAddress, SharedFetch>>,
    stats: Arc<CacheStats>,
}

impl BytecodeCache {
    /// Open a cache rooted at `dir`, creating the directory if needed.
    pub async fn open(dir: impl Into<PathBuf>, store: Arc<dyn ContentStore>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| cache_io(&dir, e))?;
        remove_partials(&dir).await?;
        tracing::debug!(dir = %dir.display(), "Opened bytecode cache");
        Ok(Self {
            dir,
            store,
            entries: RwLock::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            stats: Arc::new(CacheStats::default()),
        })
    }

    /// Directory holding the cached blobs.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Make sure the blob at `address` is on local disk and return its entry.
    pub async fn ensure(&self, address: &ContentAddress) -> Result<CacheEntry> {
        if let Some(entry) = self.lookup(address).await {
            return Ok(entry);
        }

        let fetch = {
            let mut inflight = self.inflight.lock().await;
            // A fetch may have completed between the lookup and the lock
            if let Some(entry) = self.lookup(address).await {
                return Ok(entry);
            }
            match inflight.get(address) {
                Some(fetch) => {
                    tracing::trace!(address = %address, "Joining in-flight fetch");
                    fetch.clone()
                }
                None => {
                    let fetch = materialize(
                        self.dir.clone(),
                        Arc::clone(&self.store),
                        *address,
                        Arc::clone(&self.stats),
                    )
                    .boxed()
                    .shared();
                    inflight.insert(*address, fetch.clone());
                    fetch
                }
            }
        };

        let result = fetch.clone().await;

        // Record the entry before clearing the slot so no caller can miss both
        if let Ok(entry) = &result {
            self.entries.write().await.insert(*address, entry.clone());
        }
        let mut inflight = self.inflight.lock().await;
        if inflight
            .get(address)
            .is_some_and(|current| Shared::ptr_eq(current, &fetch))
        {
            inflight.remove(address);
        }

        result
    }

    /// Drop the blob at `address` from the cache. Returns whether anything
    /// was removed.
    pub async fn evict(&self, address: &ContentAddress) -> Result<bool> {
        let indexed = self.entries.write().await.remove(address).is_some();
        let path = self.dir.join(address.to_string());
        let removed = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => false,
            Err(e) => return Err(cache_io(&path, e)),
        };
        if indexed || removed {
            tracing::debug!(address = %address, "Evicted bytecode");
        }
        Ok(indexed || removed)
    }

    async fn lookup(&self, address: &ContentAddress) -> Option<CacheEntry> {
        let entry = self.entries.read().await.get(address).cloned()?;
        // Files may be removed outside this process
        if !tokio::fs::try_exists(&entry.path).await.unwrap_or(false) {
            tracing::warn!(address = %address, path = %entry.path.display(), "Cached file is gone, refetching");
            self.entries.write().await.remove(address);
            return None;
        }
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(address = %address, "Bytecode cache hit");
        Some(entry)
    }
}

/// Bring `address` onto disk, reusing a verified file from an earlier run.
async fn materialize(
    dir: PathBuf,
    store: Arc<dyn ContentStore>,
    address: ContentAddress,
    stats: Arc<CacheStats>,
) -> Result<CacheEntry> {
    let path = dir.join(address.to_string());

    if let Some(entry) = reuse_existing(&path, address).await? {
        stats.hits.fetch_add(1, Ordering::Relaxed);
        return Ok(entry);
    }

    stats.fetches.fetch_add(1, Ordering::Relaxed);
    tracing::debug!(address = %address, "Fetching bytecode");
    let data = store.get(&address).await?;

    let partial = dir.join(format!(".{address}.{}{PARTIAL_SUFFIX}", Uuid::new_v4()));
    tokio::fs::write(&partial, &data)
        .await
        .map_err(|e| cache_io(&partial, e))?;

    let actual = ContentAddress::of(&data);
    if actual != address {
        stats.integrity_failures.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = tokio::fs::remove_file(&partial).await {
            tracing::warn!(path = %partial.display(), error = %e, "Failed to remove partial file");
        }
        tracing::error!(expected = %address, actual = %actual, "Fetched bytecode failed verification");
        return Err(CoreError::IntegrityMismatch {
            expected: address,
            actual,
        });
    }

    tokio::fs::rename(&partial, &path)
        .await
        .map_err(|e| cache_io(&path, e))?;

    tracing::info!(address = %address, size = data.len(), "Cached bytecode");
    Ok(CacheEntry {
        address,
        path,
        fetched_at: Utc::now(),
        size: data.len() as u64,
    })
}

async fn reuse_existing(path: &Path, address: ContentAddress) -> Result<Option<CacheEntry>> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(cache_io(path, e)),
    };

    if ContentAddress::of(&data) != address {
        tracing::warn!(path = %path.display(), "Cached file is corrupt, refetching");
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| cache_io(path, e))?;
        return Ok(None);
    }

    let fetched_at = tokio::fs::metadata(path)
        .await
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now());

    tracing::debug!(address = %address, "Reusing cached bytecode from disk");
    Ok(Some(CacheEntry {
        address,
        path: path.to_path_buf(),
        fetched_at,
        size: data.len() as u64,
    }))
}

/// Remove temporary files left by fetches that never finished.
async fn remove_partials(dir: &Path) -> Result<()> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| cache_io(dir, e))?;
    while let Some(entry) = entries.next_entry().await.map_err(|e| cache_io(dir, e))? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with('.') && name.ends_with(PARTIAL_SUFFIX)) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => tracing::debug!(file = %name, "Removed leftover partial file"),
            Err(e) => tracing::warn!(file = %name, error = %e, "Failed to remove partial file"),
        }
    }
    Ok(())
}

fn cache_io(path: &Path, e: io::Error) -> CoreError {
    CoreError::ContentUnavailable(format!("cache I/O on {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use fani_store::MemoryStore;

    async fn cache_with(data: &'static [u8]) -> (tempfile::TempDir, BytecodeCache, ContentAddress) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let address = store.put(Bytes::from_static(data)).await.unwrap();
        let cache = BytecodeCache::open(dir.path().join("cache"), store)
            .await
            .unwrap();
        (dir, cache, address)
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let (_dir, cache, address) = cache_with(b"module bytes").await;

        let entry = cache.ensure(&address).await.unwrap();
        assert_eq!(entry.address, address);
        assert_eq!(entry.size, 12);
        assert_eq!(entry.path, cache.dir().join(address.to_string()));
        assert_eq!(tokio::fs::read(&entry.path).await.unwrap(), b"module bytes");

        let again = cache.ensure(&address).await.unwrap();
        assert_eq!(again, entry);
        assert_eq!(cache.stats().fetches(), 1);
        assert_eq!(cache.stats().hits(), 1);
    }

    #[tokio::test]
    async fn test_reuses_file_from_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let address = store.put(Bytes::from_static(b"persisted")).await.unwrap();

        let first = BytecodeCache::open(dir.path(), store.clone()).await.unwrap();
        first.ensure(&address).await.unwrap();

        // Fresh cache over the same directory and an empty store
        let second = BytecodeCache::open(dir.path(), Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        let entry = second.ensure(&address).await.unwrap();
        assert_eq!(entry.size, 9);
        assert_eq!(second.stats().fetches(), 0);
    }

    #[tokio::test]
    async fn test_corrupt_file_on_disk_is_refetched() {
        let (_dir, cache, address) = cache_with(b"genuine").await;
        let path = cache.dir().join(address.to_string());
        tokio::fs::write(&path, b"bit rot").await.unwrap();

        let entry = cache.ensure(&address).await.unwrap();
        assert_eq!(tokio::fs::read(&entry.path).await.unwrap(), b"genuine");
        assert_eq!(cache.stats().fetches(), 1);
    }

    #[tokio::test]
    async fn test_missing_content_is_unavailable_and_not_cached() {
        let (_dir, cache, _) = cache_with(b"x").await;
        let missing = ContentAddress::of(b"absent");
        let err = cache.ensure(&missing).await.unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ContentUnavailable);
        assert!(cache.inflight.lock().await.is_empty());
        assert!(!cache.dir().join(missing.to_string()).exists());
    }

    #[tokio::test]
    async fn test_evict() {
        let (_dir, cache, address) = cache_with(b"evict me").await;
        let entry = cache.ensure(&address).await.unwrap();

        assert!(cache.evict(&address).await.unwrap());
        assert!(!entry.path.exists());
        assert!(!cache.evict(&address).await.unwrap());

        cache.ensure(&address).await.unwrap();
        assert_eq!(cache.stats().fetches(), 2);
    }

    #[tokio::test]
    async fn test_file_removed_externally_is_refetched() {
        let (_dir, cache, address) = cache_with(b"removed behind our back").await;
        let entry = cache.ensure(&address).await.unwrap();
        tokio::fs::remove_file(&entry.path).await.unwrap();

        let entry = cache.ensure(&address).await.unwrap();
        assert_eq!(
            tokio::fs::read(&entry.path).await.unwrap(),
            b"removed behind our back"
        );
        assert_eq!(cache.stats().fetches(), 2);
        assert_eq!(cache.stats().hits(), 0);
    }

    #[tokio::test]
    async fn test_open_removes_leftover_partials() {
        let dir = tempfile::tempdir().unwrap();
        let address = ContentAddress::of(b"kept");
        let leftover = dir.path().join(format!(".{address}.1234.partial"));
        let blob = dir.path().join(address.to_string());
        std::fs::write(&leftover, b"half").unwrap();
        std::fs::write(&blob, b"kept").unwrap();

        let cache = BytecodeCache::open(dir.path(), Arc::new(MemoryStore::new()))
            .await
            .unwrap();
        assert!(!leftover.exists());
        assert!(blob.exists());
        assert_eq!(cache.ensure(&address).await.unwrap().size, 4);
    }
}
