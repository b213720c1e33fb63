//! File cache: on-disk content cache keyed by `(bucket,
//! object, generation)`, one download job per key, LRU eviction with
//! pinning, remount wipes the cache directory.

pub mod download_job;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::clock::SharedClock;
use crate::error::{FsError, FsResult};
use crate::object_client::ObjectClientFacade;

pub use download_job::{DownloadJob, JobState};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub bucket: String,
    pub object: String,
    pub generation: u64,
}

struct Entry {
    local_path: PathBuf,
    size: u64,
    pinned_count: u64,
    last_access: Instant,
    job: Arc<DownloadJob>,
}

/// Tunable file-cache behavior.
#[derive(Debug, Clone, Copy)]
pub struct FileCachePolicy {
    pub cache_for_range_reads: bool,
    pub enable_o_direct: bool,
    pub sequential_read_chunk_bytes: u64,
}

impl Default for FileCachePolicy {
    fn default() -> Self {
        Self {
            cache_for_range_reads: true,
            enable_o_direct: false,
            sequential_read_chunk_bytes: 8 * 1024 * 1024,
        }
    }
}

pub struct FileCache {
    root: PathBuf,
    capacity_bytes: u64,
    entries: Mutex<HashMap<CacheKey, Entry>>,
    total_bytes: Mutex<u64>,
    policy: FileCachePolicy,
    clock: SharedClock,
}

impl FileCache {
    /// Remount semantics: the cache directory is
    /// untrusted on mount and is emptied before any download job
    /// starts.
    pub fn new(
        root: PathBuf,
        capacity_bytes: u64,
        policy: FileCachePolicy,
        clock: SharedClock,
    ) -> std::io::Result<Self> {
        if root.exists() {
            std::fs::remove_dir_all(&root)?;
        }
        std::fs::create_dir_all(&root)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&root, std::fs::Permissions::from_mode(0o700))?;
        }
        Ok(Self {
            root,
            capacity_bytes,
            entries: Mutex::new(HashMap::new()),
            total_bytes: Mutex::new(0),
            policy,
            clock,
        })
    }

    pub fn policy(&self) -> FileCachePolicy {
        self.policy
    }

    fn local_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(&key.bucket).join(&key.object)
    }

    /// Returns the existing job for `key`, starting a new one (and
    /// evicting to make room) if absent. `expected_size` must be the
    /// current generation's size, supplied by the caller from a fresh
    /// stat.
    pub fn get_or_start<C: crate::object_client::ObjectClient + 'static>(
        &self,
        key: CacheKey,
        expected_size: u64,
        object_client: Arc<ObjectClientFacade<C>>,
    ) -> FsResult<Arc<DownloadJob>> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&key) {
            entry.last_access = self.clock.now();
            return Ok(entry.job.clone());
        }

        self.make_room(&mut entries, expected_size)?;

        let local_path = self.local_path(&key);
        if let Some(parent) = local_path.parent() {
            std::fs::create_dir_all(parent).map_err(FsError::Io)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700));
            }
        }

        let job = DownloadJob::spawn(
            key.bucket.clone(),
            key.object.clone(),
            key.generation,
            expected_size,
            local_path.clone(),
            object_client,
            self.policy.sequential_read_chunk_bytes,
        );

        entries.insert(
            key,
            Entry {
                local_path,
                size: expected_size,
                pinned_count: 0,
                last_access: self.clock.now(),
                job: job.clone(),
            },
        );
        *self.total_bytes.lock() += expected_size;
        Ok(job)
    }

    /// Marks the entry for `key` as `Invalid` (generation changed
    /// underneath it) and removes it so the next access starts fresh.
    pub fn invalidate(&self, key: &CacheKey) {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.remove(key) {
            *self.total_bytes.lock() -= entry.size;
            let _ = std::fs::remove_file(&entry.local_path);
        }
    }

    pub fn pin(&self, key: &CacheKey) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.pinned_count += 1;
        }
    }

    pub fn unpin(&self, key: &CacheKey) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.pinned_count = entry.pinned_count.saturating_sub(1);
        }
    }

    /// LRU eviction of unpinned entries until `incoming_size` fits, or
    /// `CacheFull` if no unpinned candidate remains.
    fn make_room(
        &self,
        entries: &mut HashMap<CacheKey, Entry>,
        incoming_size: u64,
    ) -> FsResult<()> {
        loop {
            let total = *self.total_bytes.lock();
            if total + incoming_size <= self.capacity_bytes {
                return Ok(());
            }
            let victim = entries
                .iter()
                .filter(|(_, e)| e.pinned_count == 0)
                .min_by_key(|(_, e)| e.last_access)
                .map(|(k, _)| k.clone());
            match victim {
                Some(key) => {
                    let entry = entries.remove(&key).expect("just found by key");
                    *self.total_bytes.lock() -= entry.size;
                    let _ = std::fs::remove_file(&entry.local_path);
                }
                None => return Err(FsError::CacheFull),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FakeClock;
    use crate::object_client::{ObjectClientFacade, RetryPolicy};
    use crate::testing::InMemoryObjectClient;

    fn facade(client: InMemoryObjectClient) -> Arc<ObjectClientFacade<InMemoryObjectClient>> {
        Arc::new(ObjectClientFacade::new(client, RetryPolicy::default()))
    }

    fn key(name: &str) -> CacheKey {
        CacheKey {
            bucket: "bucket".to_string(),
            object: name.to_string(),
            generation: 1,
        }
    }

    #[test]
    fn new_wipes_existing_root() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("stale"), b"leftover").unwrap();

        let cache = FileCache::new(root.clone(), 1024, FileCachePolicy::default(), FakeClock::new()).unwrap();
        assert!(!root.join("stale").exists());
        drop(cache);
    }

    #[tokio::test]
    async fn get_or_start_returns_same_job_for_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(
            dir.path().join("cache"),
            1_000_000,
            FileCachePolicy::default(),
            FakeClock::new(),
        )
        .unwrap();

        let client = InMemoryObjectClient::new();
        client.seed("bucket", "a", b"hello".to_vec());
        let facade = facade(client);

        let job1 = cache.get_or_start(key("a"), 5, facade.clone()).unwrap();
        let job2 = cache.get_or_start(key("a"), 5, facade).unwrap();
        assert!(Arc::ptr_eq(&job1, &job2));
    }

    #[tokio::test]
    async fn make_room_evicts_lru_unpinned_entry() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(
            dir.path().join("cache"),
            10,
            FileCachePolicy::default(),
            FakeClock::new(),
        )
        .unwrap();

        let client = InMemoryObjectClient::new();
        client.seed("bucket", "a", vec![0u8; 6]);
        client.seed("bucket", "b", vec![0u8; 6]);
        let facade = facade(client);

        cache.get_or_start(key("a"), 6, facade.clone()).unwrap();
        // "a" is evicted to make room for "b" since 6+6 > capacity 10.
        cache.get_or_start(key("b"), 6, facade.clone()).unwrap();

        assert!(!cache.entries.lock().contains_key(&key("a")));
        assert!(cache.entries.lock().contains_key(&key("b")));
    }

    #[tokio::test]
    async fn pinned_entry_is_not_evicted() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(
            dir.path().join("cache"),
            10,
            FileCachePolicy::default(),
            FakeClock::new(),
        )
        .unwrap();

        let client = InMemoryObjectClient::new();
        client.seed("bucket", "a", vec![0u8; 6]);
        client.seed("bucket", "b", vec![0u8; 6]);
        let facade = facade(client);

        cache.get_or_start(key("a"), 6, facade.clone()).unwrap();
        cache.pin(&key("a"));

        let err = cache.get_or_start(key("b"), 6, facade).unwrap_err();
        assert!(matches!(err, FsError::CacheFull));
    }

    #[tokio::test]
    async fn invalidate_removes_entry_and_frees_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileCache::new(
            dir.path().join("cache"),
            10,
            FileCachePolicy::default(),
            FakeClock::new(),
        )
        .unwrap();

        let client = InMemoryObjectClient::new();
        client.seed("bucket", "a", vec![0u8; 6]);
        client.seed("bucket", "b", vec![0u8; 6]);
        let facade = facade(client);

        cache.get_or_start(key("a"), 6, facade.clone()).unwrap();
        cache.invalidate(&key("a"));
        cache.get_or_start(key("b"), 6, facade).unwrap();

        assert!(!cache.entries.lock().contains_key(&key("a")));
        assert!(cache.entries.lock().contains_key(&key("b")));
    }
}
