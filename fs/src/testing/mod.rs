//! An in-memory `ObjectClient` used by unit and integration tests so
//! they can exercise the dispatcher/inode/cache stack without a
//! running `refstore` server.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::object_client::{
    ChunkWriter, ComposeSource, ListPage, ObjectClient, ObjectError, ObjectRecord, Precondition,
    ReadHandleHint, ReadRangeResponse, SystemTimeKey,
};

#[derive(Debug, Clone)]
struct StoredObject {
    record: ObjectRecord,
    data: Vec<u8>,
}

struct State {
    objects: HashMap<String, StoredObject>,
    next_generation: u64,
}

/// A flat in-memory store keyed by `(bucket, name)`, generation-ordered
/// so preconditions behave the way the HTTP backend's does.
pub struct InMemoryObjectClient {
    state: Arc<Mutex<State>>,
    fail_next_n_writes: Arc<AtomicU64>,
}

impl InMemoryObjectClient {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                objects: HashMap::new(),
                next_generation: 1,
            })),
            fail_next_n_writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Makes the next `n` chunk-append calls fail with a transient
    /// error, for exercising the streaming-write sticky-error path.
    pub fn fail_next_writes(&self, n: u64) {
        self.fail_next_n_writes.store(n, Ordering::SeqCst);
    }

    fn key(bucket: &str, name: &str) -> String {
        format!("{bucket}/{name}")
    }

    /// Seeds an object directly, bypassing the upload path; useful for
    /// test setup.
    pub fn seed(&self, bucket: &str, name: &str, data: Vec<u8>) -> u64 {
        let mut state = self.state.lock();
        let generation = state.next_generation;
        state.next_generation += 1;
        let record = ObjectRecord {
            bucket: bucket.to_string(),
            name: name.to_string(),
            generation,
            meta_generation: 1,
            size: data.len() as u64,
            content_type: "application/octet-stream".to_string(),
            updated_at: SystemTimeKey::from(SystemTime::now()),
            md5: None,
            crc32c: None,
            metadata: HashMap::new(),
        };
        state
            .objects
            .insert(Self::key(bucket, name), StoredObject { record, data });
        generation
    }
}

impl Default for InMemoryObjectClient {
    fn default() -> Self {
        Self::new()
    }
}

fn check_precondition(existing: Option<&StoredObject>, precondition: Precondition) -> Result<(), ObjectError> {
    match precondition {
        Precondition::None => Ok(()),
        Precondition::IfGenerationMatch(expected) => {
            let actual = existing.map(|o| o.record.generation).unwrap_or(0);
            if actual == expected {
                Ok(())
            } else {
                Err(ObjectError::PreconditionFailed)
            }
        }
        Precondition::IfMetaGenerationMatch(expected) => {
            let actual = existing.map(|o| o.record.meta_generation).unwrap_or(0);
            if actual == expected {
                Ok(())
            } else {
                Err(ObjectError::PreconditionFailed)
            }
        }
    }
}

#[async_trait]
impl ObjectClient for InMemoryObjectClient {
    async fn raw_stat(&self, bucket: &str, name: &str) -> Result<ObjectRecord, ObjectError> {
        self.state
            .lock()
            .objects
            .get(&Self::key(bucket, name))
            .map(|o| o.record.clone())
            .ok_or(ObjectError::NotFound)
    }

    async fn raw_list_page(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
        _continuation: Option<&str>,
    ) -> Result<ListPage, ObjectError> {
        let state = self.state.lock();
        let bucket_prefix = format!("{bucket}/");
        let mut objects = Vec::new();
        let mut subdirs = std::collections::BTreeSet::new();
        for (key, stored) in state.objects.iter() {
            let Some(rest) = key.strip_prefix(&bucket_prefix) else { continue };
            let Some(child) = rest.strip_prefix(prefix) else { continue };
            if child.is_empty() {
                continue;
            }
            match child.find(delimiter) {
                Some(idx) => {
                    subdirs.insert(format!("{prefix}{}", &child[..idx + delimiter.len()]));
                }
                None => objects.push(stored.record.clone()),
            }
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(ListPage {
            objects,
            subdirs: subdirs.into_iter().collect(),
            next_continuation: None,
        })
    }

    async fn raw_read_range(
        &self,
        bucket: &str,
        name: &str,
        generation: u64,
        start: u64,
        limit: u64,
        _read_handle: ReadHandleHint,
    ) -> Result<ReadRangeResponse, ObjectError> {
        let state = self.state.lock();
        let stored = state.objects.get(&Self::key(bucket, name)).ok_or(ObjectError::NotFound)?;
        if stored.record.generation != generation {
            return Err(ObjectError::NotFound);
        }
        let start = start.min(stored.data.len() as u64) as usize;
        let end = (start as u64 + limit).min(stored.data.len() as u64) as usize;
        let chunk = Bytes::copy_from_slice(&stored.data[start..end]);
        let stream = futures_util::stream::once(async move { Ok(chunk) });
        Ok(ReadRangeResponse {
            stream: Box::pin(stream),
            next_read_handle: ReadHandleHint::default(),
        })
    }

    async fn raw_create_chunk_writer(
        &self,
        bucket: &str,
        name: &str,
        precondition: Precondition,
    ) -> Result<Box<dyn ChunkWriter>, ObjectError> {
        let state = self.state.lock();
        let existing = state.objects.get(&Self::key(bucket, name));
        check_precondition(existing, precondition)?;
        Ok(Box::new(InMemoryChunkWriter {
            bucket: bucket.to_string(),
            name: name.to_string(),
            precondition,
            buffer: Vec::new(),
            state: self.state.clone(),
            fail_next_n_writes: self.fail_next_n_writes.clone(),
        }))
    }

    async fn raw_compose(
        &self,
        bucket: &str,
        dest: &str,
        parts: &[ComposeSource],
        precondition: Precondition,
    ) -> Result<ObjectRecord, ObjectError> {
        let mut state = self.state.lock();
        check_precondition(state.objects.get(&Self::key(bucket, dest)), precondition)?;
        let mut data = Vec::new();
        for part in parts {
            let stored = state
                .objects
                .get(&Self::key(bucket, &part.name))
                .ok_or(ObjectError::NotFound)?;
            if stored.record.generation != part.generation {
                return Err(ObjectError::PreconditionFailed);
            }
            data.extend_from_slice(&stored.data);
        }
        let generation = state.next_generation;
        state.next_generation += 1;
        let record = ObjectRecord {
            bucket: bucket.to_string(),
            name: dest.to_string(),
            generation,
            meta_generation: 1,
            size: data.len() as u64,
            content_type: "application/octet-stream".to_string(),
            updated_at: SystemTimeKey::from(SystemTime::now()),
            md5: None,
            crc32c: None,
            metadata: HashMap::new(),
        };
        state.objects.insert(Self::key(bucket, dest), StoredObject { record: record.clone(), data });
        Ok(record)
    }

    async fn raw_delete(&self, bucket: &str, name: &str, precondition: Precondition) -> Result<(), ObjectError> {
        let mut state = self.state.lock();
        let key = Self::key(bucket, name);
        check_precondition(state.objects.get(&key), precondition)?;
        state.objects.remove(&key);
        Ok(())
    }
}

struct InMemoryChunkWriter {
    bucket: String,
    name: String,
    precondition: Precondition,
    buffer: Vec<u8>,
    state: Arc<Mutex<State>>,
    fail_next_n_writes: Arc<AtomicU64>,
}

#[async_trait]
impl ChunkWriter for InMemoryChunkWriter {
    async fn append_chunk(&mut self, bytes: Bytes) -> Result<(), ObjectError> {
        loop {
            let remaining = self.fail_next_n_writes.load(Ordering::SeqCst);
            if remaining == 0 {
                break;
            }
            if self
                .fail_next_n_writes
                .compare_exchange(remaining, remaining - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Err(ObjectError::Transient { status: 503 });
            }
        }
        self.buffer.extend_from_slice(&bytes);
        Ok(())
    }

    /// Commits the buffered bytes into the shared store under the
    /// precondition recorded at writer creation, re-checked now since
    /// the object may have been created concurrently in between.
    async fn finalize(self: Box<Self>) -> Result<ObjectRecord, ObjectError> {
        let mut state = self.state.lock();
        let key = InMemoryObjectClient::key(&self.bucket, &self.name);
        check_precondition(state.objects.get(&key), self.precondition)?;
        let generation = state.next_generation;
        state.next_generation += 1;
        let record = ObjectRecord {
            bucket: self.bucket,
            name: self.name,
            generation,
            meta_generation: 1,
            size: self.buffer.len() as u64,
            content_type: "application/octet-stream".to_string(),
            updated_at: SystemTimeKey::from(SystemTime::now()),
            md5: None,
            crc32c: None,
            metadata: HashMap::new(),
        };
        state.objects.insert(key, StoredObject { record: record.clone(), data: self.buffer });
        Ok(record)
    }
}
