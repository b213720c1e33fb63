//! Streaming write handle: chunked writes backed by the block pool and
//! an upload handler, enforcing the strictly-increasing-contiguous-
//! from-0 buffering invariant.
//!
//! Finalizing the upload is the dispatcher's job, not this handle's:
//! several `StreamingWriteHandle`s may share one `UploadHandler` (the
//! kernel is allowed to open a file multiple times while a write is in
//! flight), and only the handle that closes last should finalize.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::block_pool::{Block, BlockPool};
use crate::cancel::CancelToken;
use crate::error::FsResult;

use super::upload_handler::UploadHandler;

struct Buffer {
    /// The block currently being filled, if any.
    current: Option<Block>,
    /// Total bytes accepted so far; also the next expected write offset.
    write_end: u64,
}

pub struct StreamingWriteHandle {
    pool: Arc<BlockPool>,
    upload: UploadHandler,
    buffer: Mutex<Buffer>,
    cancel: CancelToken,
}

impl StreamingWriteHandle {
    pub fn new(pool: Arc<BlockPool>, upload: UploadHandler, cancel: CancelToken) -> Self {
        Self {
            pool,
            upload,
            buffer: Mutex::new(Buffer {
                current: None,
                write_end: 0,
            }),
            cancel,
        }
    }

    pub fn upload_handler(&self) -> &UploadHandler {
        &self.upload
    }

    /// Writes `data` at `offset`. Offsets inside the already-buffered
    /// current block are accepted as in-place overwrites; any other
    /// offset must equal `write_end` or the write fails with
    /// `NonSequentialWrite`.
    pub async fn write(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        if let Some(sticky) = self.upload.sticky_error() {
            return Err(sticky);
        }

        let block_size = self.pool.block_size() as u64;
        let mut written = 0usize;
        let mut cursor = offset;
        let mut remaining = data;

        while !remaining.is_empty() {
            let block_start = {
                let buf = self.buffer.lock();
                buf.current.as_ref().map(|b| b.offset_in_file)
            };

            let in_current = match block_start {
                Some(start) => cursor >= start && cursor < start + block_size,
                None => false,
            };

            if !in_current {
                let write_end = self.buffer.lock().write_end;
                if cursor != write_end {
                    return Err(crate::error::FsError::NonSequentialWrite);
                }
                self.ensure_current_block(write_end).await?;
            }

            let (block_start, block_size) = {
                let buf = self.buffer.lock();
                let b = buf.current.as_ref().expect("ensured above");
                (b.offset_in_file, self.pool.block_size())
            };
            let pos_in_block = (cursor - block_start) as usize;
            let take = std::cmp::min(remaining.len(), block_size - pos_in_block);

            let should_flush = {
                let mut buf = self.buffer.lock();
                let block = buf.current.as_mut().expect("ensured above");
                block.data[pos_in_block..pos_in_block + take].copy_from_slice(&remaining[..take]);
                block.len = std::cmp::max(block.len, pos_in_block + take);
                let new_write_end = std::cmp::max(buf.write_end, block_start + block.len as u64);
                buf.write_end = new_write_end;
                block.len == block_size
            };

            if should_flush {
                self.flush_current().await;
            }

            written += take;
            cursor += take as u64;
            remaining = &remaining[take..];
        }

        Ok(written)
    }

    async fn ensure_current_block(&self, offset: u64) -> FsResult<()> {
        let need_new = self.buffer.lock().current.is_none();
        if need_new {
            let mut block = self.pool.acquire(&self.cancel).await?;
            block.reset(offset);
            self.buffer.lock().current = Some(block);
        }
        Ok(())
    }

    async fn flush_current(&self) {
        let block = self.buffer.lock().current.take();
        if let Some(block) = block {
            self.upload.submit(block).await;
        }
    }

    /// Flushes any partial block on close. Does not finalize; that is
    /// the dispatcher's responsibility once it has confirmed this was
    /// the last open handle for the file.
    pub async fn close(&self) -> FsResult<()> {
        if let Some(sticky) = self.upload.sticky_error() {
            return Err(sticky);
        }
        self.flush_current().await;
        Ok(())
    }

    pub fn write_end(&self) -> u64 {
        self.buffer.lock().write_end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;
    use crate::object_client::{ObjectClientFacade, Precondition, RetryPolicy};
    use crate::testing::InMemoryObjectClient;

    fn handle(pool: Arc<BlockPool>) -> StreamingWriteHandle {
        let client = InMemoryObjectClient::new();
        let facade = Arc::new(ObjectClientFacade::new(client, RetryPolicy::default()));
        let (upload, _finalize) =
            UploadHandler::spawn("bucket".to_string(), "obj".to_string(), Precondition::None, pool.clone(), facade);
        StreamingWriteHandle::new(pool, upload, CancelToken::new())
    }

    #[tokio::test]
    async fn sequential_writes_advance_write_end() {
        let pool = BlockPool::new(16, 4);
        let h = handle(pool);
        h.write(0, b"hello").await.unwrap();
        assert_eq!(h.write_end(), 5);
        h.write(5, b" world").await.unwrap();
        assert_eq!(h.write_end(), 11);
    }

    #[tokio::test]
    async fn overwrite_within_current_block_is_allowed() {
        let pool = BlockPool::new(16, 4);
        let h = handle(pool);
        h.write(0, b"hello").await.unwrap();
        h.write(0, b"HELLO").await.unwrap();
        assert_eq!(h.write_end(), 5);
    }

    #[tokio::test]
    async fn non_sequential_write_is_rejected() {
        let pool = BlockPool::new(16, 4);
        let h = handle(pool);
        h.write(0, b"hello").await.unwrap();
        let err = h.write(20, b"gap").await.unwrap_err();
        assert!(matches!(err, FsError::NonSequentialWrite));
    }

    #[tokio::test]
    async fn write_spanning_multiple_blocks_flushes_intermediate_blocks() {
        let pool = BlockPool::new(4, 4);
        let h = handle(pool);
        h.write(0, b"abcdefgh").await.unwrap();
        assert_eq!(h.write_end(), 8);
        h.close().await.unwrap();
    }
}
