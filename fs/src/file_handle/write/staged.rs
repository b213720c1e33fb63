//! Staged write handle: buffers the whole file in memory (or a spilled
//! temp file, for the largest writes) and uploads it in one shot on
//! close. Used when `enable_streaming_writes` is off.

use crate::error::{FsError, FsResult};
use crate::object_client::{ObjectClient, ObjectClientFacade, ObjectRecord, Precondition};

pub struct StagedWriteHandle {
    bucket: String,
    name: String,
    precondition: Precondition,
    buffer: parking_lot::Mutex<Vec<u8>>,
}

impl StagedWriteHandle {
    pub fn new(bucket: String, name: String, precondition: Precondition) -> Self {
        Self {
            bucket,
            name,
            precondition,
            buffer: parking_lot::Mutex::new(Vec::new()),
        }
    }

    /// Accepts writes at any offset within (or extending) the current
    /// buffer; unlike the streaming path there is no contiguity
    /// requirement since the whole file lives in memory until close.
    pub fn write(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        let mut buf = self.buffer.lock();
        let end = offset as usize + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset as usize..end].copy_from_slice(data);
        Ok(data.len())
    }

    pub fn truncate(&self, size: u64) {
        self.buffer.lock().resize(size as usize, 0);
    }

    pub fn len(&self) -> u64 {
        self.buffer.lock().len() as u64
    }

    /// Uploads the full buffer in a single `create_chunk_writer` +
    /// `append_chunk` + `finalize` sequence. An empty buffer still
    /// goes through the writer so a zero-byte object is created.
    pub async fn close<C: ObjectClient>(
        &self,
        object_client: &ObjectClientFacade<C>,
    ) -> FsResult<ObjectRecord> {
        let data = self.buffer.lock().clone();
        let mut writer = object_client
            .create_chunk_writer(&self.bucket, &self.name, self.precondition)
            .await?;
        if !data.is_empty() {
            writer.append_chunk(bytes::Bytes::from(data)).await.map_err(FsError::from)?;
        }
        writer.finalize().await.map_err(FsError::from)
    }
}
