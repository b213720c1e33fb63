//! Upload handler: the single background worker per file that drains
//! blocks from a streaming write handle into a resumable upload, with
//! a sticky first-terminal-error that is surfaced to every handle
//! until all of them close.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::block_pool::{Block, BlockPool};
use crate::error::{FsError, FsResult};
use crate::object_client::{ChunkWriter, ObjectClient, ObjectClientFacade, ObjectRecord, Precondition};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Fresh,
    Buffering,
    Uploading,
    Finalizing,
    Done,
    Failed,
}

struct Shared {
    state: Mutex<UploadState>,
    sticky_error: Mutex<Option<String>>,
    notify: Notify,
}

impl Shared {
    fn set_sticky(&self, msg: String) {
        let mut sticky = self.sticky_error.lock();
        if sticky.is_none() {
            *sticky = Some(msg);
            *self.state.lock() = UploadState::Failed;
        }
        self.notify.notify_waiters();
    }

    fn sticky(&self) -> Option<String> {
        self.sticky_error.lock().clone()
    }
}

/// Handle shared by every write handle open against the same file;
/// cheaply cloneable.
#[derive(Clone)]
pub struct UploadHandler {
    shared: Arc<Shared>,
    block_tx: mpsc::Sender<Block>,
    pool: Arc<BlockPool>,
}

impl UploadHandler {
    /// Spawns the worker; `finalize_rx` carries the single finalize
    /// request, sent once all writers agree the file is complete.
    pub fn spawn<C: ObjectClient + 'static>(
        bucket: String,
        name: String,
        precondition: Precondition,
        pool: Arc<BlockPool>,
        object_client: Arc<ObjectClientFacade<C>>,
    ) -> (Self, FinalizeHandle) {
        let shared = Arc::new(Shared {
            state: Mutex::new(UploadState::Fresh),
            sticky_error: Mutex::new(None),
            notify: Notify::new(),
        });
        let (block_tx, block_rx) = mpsc::channel::<Block>(1);
        let (finalize_tx, finalize_rx) = tokio::sync::oneshot::channel();

        let worker_shared = shared.clone();
        let worker_pool = pool.clone();
        tokio::spawn(run_worker(
            bucket,
            name,
            precondition,
            worker_shared,
            worker_pool,
            object_client,
            block_rx,
            finalize_rx,
        ));

        (
            Self {
                shared,
                block_tx,
                pool,
            },
            FinalizeHandle { finalize_tx: Some(finalize_tx) },
        )
    }

    /// Hands a filled block to the worker. If the sticky error is
    /// already set, the block is immediately released back to the
    /// pool without being written, matching the drop-on-sticky-error
    /// rule.
    pub async fn submit(&self, block: Block) {
        if self.shared.sticky().is_some() {
            self.pool.release(block).await;
            return;
        }
        if self.block_tx.send(block).await.is_err() {
            self.pool.release(block).await;
        }
    }

    pub fn sticky_error(&self) -> Option<FsError> {
        self.shared.sticky().map(FsError::UploadAborted)
    }

    pub fn state(&self) -> UploadState {
        *self.shared.state.lock()
    }
}

pub struct FinalizeHandle {
    finalize_tx: Option<tokio::sync::oneshot::Sender<tokio::sync::oneshot::Sender<FsResult<Option<ObjectRecord>>>>>,
}

impl FinalizeHandle {
    /// Requests the worker finalize the upload and waits for the
    /// result. `Ok(None)` means no chunk writer was ever created (no
    /// bytes written) and the caller should fall back to a
    /// single-shot empty-object create.
    pub async fn finalize(mut self) -> FsResult<Option<ObjectRecord>> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        let Some(tx) = self.finalize_tx.take() else {
            return Err(FsError::BadFileDescriptor);
        };
        if tx.send(reply_tx).is_err() {
            return Err(FsError::UploadAborted("upload worker exited".to_string()));
        }
        reply_rx
            .await
            .unwrap_or_else(|_| Err(FsError::UploadAborted("upload worker exited".to_string())))
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_worker<C: ObjectClient>(
    bucket: String,
    name: String,
    precondition: Precondition,
    shared: Arc<Shared>,
    pool: Arc<BlockPool>,
    object_client: Arc<ObjectClientFacade<C>>,
    mut block_rx: mpsc::Receiver<Block>,
    mut finalize_rx: tokio::sync::oneshot::Receiver<tokio::sync::oneshot::Sender<FsResult<Option<ObjectRecord>>>>,
) {
    let mut writer: Option<Box<dyn ChunkWriter>> = None;

    loop {
        tokio::select! {
            biased;
            block = block_rx.recv() => {
                let Some(block) = block else { continue };
                if shared.sticky().is_some() {
                    pool.release(block).await;
                    continue;
                }
                *shared.state.lock() = UploadState::Uploading;
                if writer.is_none() {
                    match object_client.create_chunk_writer(&bucket, &name, precondition).await {
                        Ok(w) => writer = Some(w),
                        Err(e) => {
                            shared.set_sticky(e.to_string());
                            pool.release(block).await;
                            continue;
                        }
                    }
                }
                let bytes = bytes::Bytes::copy_from_slice(&block.data[..block.len]);
                if let Err(e) = writer.as_mut().expect("created above").append_chunk(bytes).await {
                    shared.set_sticky(e.to_string());
                    pool.release(block).await;
                    continue;
                }
                pool.release(block).await;
                *shared.state.lock() = UploadState::Buffering;
            }
            reply = &mut finalize_rx => {
                let Ok(reply_tx) = reply else { return };
                *shared.state.lock() = UploadState::Finalizing;
                if let Some(sticky) = shared.sticky() {
                    let _ = reply_tx.send(Err(FsError::UploadAborted(sticky)));
                    return;
                }
                let result = match writer.take() {
                    None => Ok(None),
                    Some(w) => match w.finalize().await {
                        Ok(rec) => {
                            *shared.state.lock() = UploadState::Done;
                            Ok(Some(rec))
                        }
                        Err(e) => {
                            shared.set_sticky(e.to_string());
                            Err(FsError::UploadAborted(e.to_string()))
                        }
                    },
                };
                let _ = reply_tx.send(result);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_pool::BlockPool;
    use crate::cancel::CancelToken;
    use crate::object_client::RetryPolicy;
    use crate::testing::InMemoryObjectClient;

    #[tokio::test]
    async fn finalize_with_no_writes_returns_none() {
        let pool = BlockPool::new(64, 2);
        let client = InMemoryObjectClient::new();
        let facade = Arc::new(ObjectClientFacade::new(client, RetryPolicy::default()));
        let (_handler, finalize) = UploadHandler::spawn(
            "bucket".to_string(),
            "obj".to_string(),
            Precondition::None,
            pool,
            facade,
        );
        let result = finalize.finalize().await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn submit_then_finalize_commits_bytes() {
        let pool = BlockPool::new(64, 2);
        let cancel = CancelToken::new();
        let client = InMemoryObjectClient::new();
        let facade = Arc::new(ObjectClientFacade::new(client, RetryPolicy::default()));
        let (handler, finalize) = UploadHandler::spawn(
            "bucket".to_string(),
            "obj".to_string(),
            Precondition::None,
            pool.clone(),
            facade,
        );

        let mut block = pool.acquire(&cancel).await.unwrap();
        block.data[..5].copy_from_slice(b"hello");
        block.len = 5;
        handler.submit(block).await;

        let result = finalize.finalize().await.unwrap();
        let record = result.expect("writer was created");
        assert_eq!(record.size, 5);
    }

    #[tokio::test]
    async fn write_failure_sets_sticky_error_for_later_submits() {
        let pool = BlockPool::new(64, 2);
        let cancel = CancelToken::new();
        let client = InMemoryObjectClient::new();
        client.fail_next_writes(1);
        let facade = Arc::new(ObjectClientFacade::new(client, RetryPolicy::default()));
        let (handler, finalize) = UploadHandler::spawn(
            "bucket".to_string(),
            "obj".to_string(),
            Precondition::None,
            pool.clone(),
            facade,
        );

        let mut block = pool.acquire(&cancel).await.unwrap();
        block.data[..3].copy_from_slice(b"abc");
        block.len = 3;
        handler.submit(block).await;

        // Give the worker a chance to observe the failed append.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(handler.sticky_error().is_some());

        let err = finalize.finalize().await.unwrap_err();
        assert!(matches!(err, FsError::UploadAborted(_)));
    }
}
