//! Read path: cached mode (backed by the file cache / download job) or
//! passthrough mode (direct ranged reads against the object client).

use std::sync::Arc;

use crate::cache::{CacheKey, FileCache, JobState};
use crate::error::{FsError, FsResult};
use crate::object_client::{ObjectClient, ObjectClientFacade, ReadHandleHint};

#[derive(Debug, Clone, Copy)]
pub struct OpenFileTarget {
    pub generation: u64,
    pub size: u64,
}

/// A read-only file handle. Cached mode serves bytes by subscribing to
/// a download job and then `pread`-ing the local cache file;
/// passthrough mode issues a direct ranged read per call.
pub struct ReadHandle<C> {
    bucket: String,
    object_name: String,
    target: OpenFileTarget,
    file_cache: Option<Arc<FileCache>>,
    object_client: Arc<ObjectClientFacade<C>>,
}

impl<C: ObjectClient + 'static> ReadHandle<C> {
    pub fn open(
        bucket: String,
        object_name: String,
        target: OpenFileTarget,
        file_cache: Option<Arc<FileCache>>,
        object_client: Arc<ObjectClientFacade<C>>,
    ) -> Self {
        Self {
            bucket,
            object_name,
            target,
            file_cache,
            object_client,
        }
    }

    /// Decides cached vs. passthrough per call, since a single handle
    /// can see both a sequential first read (offset 0) and later random
    /// reads: offset 0 always uses the cache when one is configured; an
    /// offset > 0 read only populates the cache if `cache_for_range_reads`
    /// is set, otherwise it is served directly from the object client.
    pub async fn read(&self, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        if offset >= self.target.size {
            return Ok(Vec::new());
        }
        let end = std::cmp::min(offset + size as u64, self.target.size);

        let use_cache = match &self.file_cache {
            Some(cache) => offset == 0 || cache.policy().cache_for_range_reads,
            None => false,
        };
        if use_cache {
            let key = CacheKey {
                bucket: self.bucket.clone(),
                object: self.object_name.clone(),
                generation: self.target.generation,
            };
            self.read_cached(&key, offset, end).await
        } else {
            self.read_passthrough(offset, end - offset).await
        }
    }

    async fn read_cached(&self, key: &CacheKey, offset: u64, end: u64) -> FsResult<Vec<u8>> {
        let cache = self.file_cache.as_ref().expect("cached mode implies a file cache");
        let job = cache.get_or_start(key.clone(), self.target.size, self.object_client.clone())?;

        let state = job.subscribe_at(end).await;
        match state {
            JobState::Invalid => {
                cache.invalidate(key);
                return self.read_passthrough(offset, end - offset).await;
            }
            JobState::Failed(msg) => return Err(FsError::Object(crate::object_client::ObjectError::Other(msg))),
            _ => {}
        }

        let path = job.local_path().to_path_buf();
        let len = (end - offset) as usize;
        tokio::task::spawn_blocking(move || -> FsResult<Vec<u8>> {
            use std::io::{Read, Seek, SeekFrom};
            let mut file = std::fs::File::open(&path).map_err(FsError::Io)?;
            file.seek(SeekFrom::Start(offset)).map_err(FsError::Io)?;
            let mut buf = vec![0u8; len];
            file.read_exact(&mut buf).map_err(FsError::Io)?;
            Ok(buf)
        })
        .await
        .expect("blocking read task panicked")
    }

    async fn read_passthrough(&self, offset: u64, limit: u64) -> FsResult<Vec<u8>> {
        use futures_util::StreamExt;
        let resp = self
            .object_client
            .read_range(
                &self.bucket,
                &self.object_name,
                self.target.generation,
                offset,
                limit,
                ReadHandleHint::default(),
            )
            .await?;
        let mut stream = resp.stream;
        let mut out = Vec::with_capacity(limit as usize);
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{FileCachePolicy, FileCache};
    use crate::clock::FakeClock;
    use crate::object_client::RetryPolicy;
    use crate::testing::InMemoryObjectClient;

    #[tokio::test]
    async fn passthrough_read_returns_requested_range() {
        let client = InMemoryObjectClient::new();
        let generation = client.seed("bucket", "obj", b"hello world".to_vec());
        let facade = Arc::new(ObjectClientFacade::new(client, RetryPolicy::default()));

        let handle = ReadHandle::open(
            "bucket".to_string(),
            "obj".to_string(),
            OpenFileTarget { generation, size: 11 },
            None,
            facade,
        );
        let data = handle.read(6, 5).await.unwrap();
        assert_eq!(data, b"world");
    }

    #[tokio::test]
    async fn read_past_end_of_file_returns_empty() {
        let client = InMemoryObjectClient::new();
        let generation = client.seed("bucket", "obj", b"hi".to_vec());
        let facade = Arc::new(ObjectClientFacade::new(client, RetryPolicy::default()));

        let handle = ReadHandle::open(
            "bucket".to_string(),
            "obj".to_string(),
            OpenFileTarget { generation, size: 2 },
            None,
            facade,
        );
        let data = handle.read(10, 5).await.unwrap();
        assert!(data.is_empty());
    }

    #[tokio::test]
    async fn cached_sequential_open_reads_through_the_download_job() {
        let client = InMemoryObjectClient::new();
        let generation = client.seed("bucket", "obj", b"hello world".to_vec());
        let facade = Arc::new(ObjectClientFacade::new(client, RetryPolicy::default()));

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(
            FileCache::new(dir.path().join("cache"), 1_000_000, FileCachePolicy::default(), FakeClock::new())
                .unwrap(),
        );

        let handle = ReadHandle::open(
            "bucket".to_string(),
            "obj".to_string(),
            OpenFileTarget { generation, size: 11 },
            Some(cache),
            facade,
        );
        let data = handle.read(0, 5).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn random_read_bypasses_cache_when_range_reads_not_cached() {
        let client = InMemoryObjectClient::new();
        let generation = client.seed("bucket", "obj", b"hello world".to_vec());
        let facade = Arc::new(ObjectClientFacade::new(client, RetryPolicy::default()));

        let dir = tempfile::tempdir().unwrap();
        let policy = FileCachePolicy {
            cache_for_range_reads: false,
            ..FileCachePolicy::default()
        };
        let cache = Arc::new(
            FileCache::new(dir.path().join("cache"), 1_000_000, policy, FakeClock::new()).unwrap(),
        );

        let handle = ReadHandle::open(
            "bucket".to_string(),
            "obj".to_string(),
            OpenFileTarget { generation, size: 11 },
            Some(cache),
            facade,
        );
        let data = handle.read(6, 5).await.unwrap();
        assert_eq!(data, b"world");
    }
}
