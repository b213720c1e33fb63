//! Write path: staged (buffer-then-single-shot) or streaming
//! (chunked, block-pool-backed) depending on `enable_streaming_writes`.

pub mod staged;
pub mod streaming;
pub mod upload_handler;

pub use staged::StagedWriteHandle;
pub use streaming::StreamingWriteHandle;
pub use upload_handler::{FinalizeHandle, UploadHandler, UploadState};

use crate::error::FsResult;
use crate::object_client::{ObjectClient, ObjectClientFacade, ObjectRecord};

/// Either write mode presents the same narrow surface to the
/// dispatcher; which variant a file gets is decided once, at open.
/// Streaming's finalize is driven by the dispatcher (multiple handles
/// can share one upload), so `close` only returns a record for the
/// staged variant.
pub enum WriteHandle {
    Staged(StagedWriteHandle),
    Streaming(StreamingWriteHandle),
}

impl WriteHandle {
    pub async fn write(&self, offset: u64, data: &[u8]) -> FsResult<usize> {
        match self {
            WriteHandle::Staged(h) => h.write(offset, data),
            WriteHandle::Streaming(h) => h.write(offset, data).await,
        }
    }

    pub async fn close<C: ObjectClient>(
        &self,
        object_client: &ObjectClientFacade<C>,
    ) -> FsResult<Option<ObjectRecord>> {
        match self {
            WriteHandle::Staged(h) => h.close(object_client).await.map(Some),
            WriteHandle::Streaming(h) => {
                h.close().await?;
                Ok(None)
            }
        }
    }
}
