//! Block pool: a fixed-count, fixed-size pool of reusable
//! buffers with a bounded free channel and a weighted semaphore for
//! admission.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};

use crate::cancel::CancelToken;
use crate::error::{FsError, FsResult};

/// A fixed-size buffer tagged with its offset in the file it backs.
/// Owned by exactly one of the pool, a write handle's queue, or the upload
/// handler's in-flight slot at any time;
/// the state itself isn't tracked on the block (it's implied by who
/// holds it: the pool's free channel, a write handle's queue, or the
/// upload handler's in-flight slot).
#[derive(Debug)]
pub struct Block {
    pub data: Vec<u8>,
    pub offset_in_file: u64,
    pub len: usize,
}

impl Block {
    fn new(block_size: usize) -> Self {
        Self {
            data: vec![0u8; block_size],
            offset_in_file: 0,
            len: 0,
        }
    }

    pub fn reset(&mut self, offset_in_file: u64) {
        self.offset_in_file = offset_in_file;
        self.len = 0;
    }
}

/// Created with `(block_size, max_blocks)`. `acquire()` takes a
/// semaphore permit then returns a block, allocating lazily up to
/// `max_blocks`; `release(block)` returns it to the free channel.
pub struct BlockPool {
    block_size: usize,
    max_blocks: usize,
    semaphore: Arc<Semaphore>,
    free_tx: mpsc::Sender<Block>,
    free_rx: tokio::sync::Mutex<mpsc::Receiver<Block>>,
    allocated: AtomicUsize,
}

impl BlockPool {
    pub fn new(block_size: usize, max_blocks: usize) -> Arc<Self> {
        let (free_tx, free_rx) = mpsc::channel(max_blocks);
        Arc::new(Self {
            block_size,
            max_blocks,
            semaphore: Arc::new(Semaphore::new(max_blocks)),
            free_tx,
            free_rx: tokio::sync::Mutex::new(free_rx),
            allocated: AtomicUsize::new(0),
        })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks only when all `max_blocks` are checked out; suspends
    /// until a `release` occurs or `cancel` fires. No block is ever
    /// handed to two holders at once: the semaphore permit plus the
    /// exclusive receiver lock guarantee that.
    pub async fn acquire(&self, cancel: &CancelToken) -> FsResult<Block> {
        let permit = tokio::select! {
            p = self.semaphore.acquire() => p.expect("semaphore never closed"),
            _ = Self::wait_cancelled(cancel) => return Err(FsError::Interrupted),
        };
        permit.forget();

        // Prefer lazily allocating a fresh block over waiting on the
        // free channel until max_blocks have actually been created.
        if self.allocated.load(Ordering::Relaxed) < self.max_blocks {
            let prior = self.allocated.fetch_add(1, Ordering::SeqCst);
            if prior < self.max_blocks {
                return Ok(Block::new(self.block_size));
            }
            // Lost the race; another acquirer already allocated this
            // slot. Fall through to the free channel below.
        }

        let mut rx = self.free_rx.lock().await;
        tokio::select! {
            block = rx.recv() => block.ok_or(FsError::CacheFull),
            _ = Self::wait_cancelled(cancel) => Err(FsError::Interrupted),
        }
    }

    pub async fn release(&self, mut block: Block) {
        block.reset(0);
        // The channel's capacity equals max_blocks, so this never
        // blocks; a full channel would mean more blocks are free than
        // were ever checked out, which is a pool invariant violation.
        let _ = self.free_tx.send(block).await;
        self.semaphore.add_permits(1);
    }

    async fn wait_cancelled(cancel: &CancelToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_blocks_when_exhausted() {
        let pool = BlockPool::new(4096, 1);
        let cancel = CancelToken::new();
        let b1 = pool.acquire(&cancel).await.unwrap();

        let pool2 = pool.clone();
        let cancel2 = CancelToken::new();
        let handle = tokio::spawn(async move { pool2.acquire(&cancel2).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        pool.release(b1).await;
        let b2 = handle.await.unwrap().unwrap();
        assert_eq!(b2.data.len(), 4096);
    }

    #[tokio::test]
    async fn acquire_honours_cancellation() {
        let pool = BlockPool::new(4096, 1);
        let cancel = CancelToken::new();
        let _b1 = pool.acquire(&cancel).await.unwrap();

        let pool2 = pool.clone();
        let cancel2 = CancelToken::new();
        let cancel2_clone = cancel2.clone();
        let handle = tokio::spawn(async move { pool2.acquire(&cancel2_clone).await });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        cancel2.cancel();
        let res = handle.await.unwrap();
        assert!(matches!(res, Err(FsError::Interrupted)));
    }
}
