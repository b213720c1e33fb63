//! The object client facade: a uniform view of the remote
//! store, with retries and a documented 503 quirk layered on top of
//! whatever transport a concrete implementation uses.

mod http;
mod retry;
mod types;

pub use http::HttpObjectClient;
pub use retry::RetryClassifier;
pub use types::{
    ChunkWriter, ComposeSource, ListPage, ObjectRecord, Precondition, ReadHandleHint,
    ReadRangeResponse, SystemTimeKey,
};

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

#[derive(Debug, thiserror::Error, Clone)]
pub enum ObjectError {
    #[error("object not found")]
    NotFound,
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("unauthenticated")]
    Unauthenticated,
    #[error("transient error (http {status})")]
    Transient { status: u16 },
    #[error("object store error: {0}")]
    Other(String),
}

impl ObjectError {
    pub fn errno(&self) -> libc::c_int {
        match self {
            ObjectError::NotFound => libc::ENOENT,
            ObjectError::PreconditionFailed => libc::EIO,
            ObjectError::Unauthenticated => libc::EIO,
            ObjectError::Transient { .. } => libc::EIO,
            ObjectError::Other(_) => libc::EIO,
        }
    }
}

/// A streamed byte range returned by `read_range`.
pub type ByteStream =
    std::pin::Pin<Box<dyn futures_util::Stream<Item = Result<Bytes, ObjectError>> + Send>>;

/// The operations a remote object store must expose. Implementations (the HTTP
/// backend, or an in-memory test double) only need to implement
/// `raw_*`; the blanket `retrying` wrapper below applies the
/// classifier and backoff uniformly, matching how the Go original
/// centralizes retry behaviour instead of duplicating it per call
/// site.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    async fn raw_stat(&self, bucket: &str, name: &str) -> Result<ObjectRecord, ObjectError>;

    async fn raw_list_page(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage, ObjectError>;

    async fn raw_read_range(
        &self,
        bucket: &str,
        name: &str,
        generation: u64,
        start: u64,
        limit: u64,
        read_handle: ReadHandleHint,
    ) -> Result<ReadRangeResponse, ObjectError>;

    async fn raw_create_chunk_writer(
        &self,
        bucket: &str,
        name: &str,
        precondition: Precondition,
    ) -> Result<Box<dyn ChunkWriter>, ObjectError>;

    async fn raw_compose(
        &self,
        bucket: &str,
        dest: &str,
        parts: &[ComposeSource],
        precondition: Precondition,
    ) -> Result<ObjectRecord, ObjectError>;

    async fn raw_delete(
        &self,
        bucket: &str,
        name: &str,
        precondition: Precondition,
    ) -> Result<(), ObjectError>;
}

/// Retry policy knobs.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_sleep: Duration,
    pub max_sleep: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_sleep: Duration::from_millis(100),
            max_sleep: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

/// Wraps any `ObjectClient` with the retry classifier and backoff
/// policy. This is the type the rest of the crate actually depends on.
pub struct ObjectClientFacade<C> {
    inner: C,
    classifier: RetryClassifier,
    policy: RetryPolicy,
}

impl<C: ObjectClient> ObjectClientFacade<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self {
            inner,
            classifier: RetryClassifier::new(),
            policy,
        }
    }

    async fn retrying<T, F, Fut>(&self, mut op: F) -> Result<T, ObjectError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ObjectError>>,
    {
        let mut sleep = self.policy.initial_sleep;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if !self.classifier.should_retry(&e) {
                        return Err(e);
                    }
                    tokio::time::sleep(sleep).await;
                    sleep = std::cmp::min(
                        Duration::from_secs_f64(sleep.as_secs_f64() * self.policy.multiplier),
                        self.policy.max_sleep,
                    );
                }
            }
        }
    }

    pub async fn stat(&self, bucket: &str, name: &str) -> Result<ObjectRecord, ObjectError> {
        self.retrying(|| self.inner.raw_stat(bucket, name)).await
    }

    pub async fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage, ObjectError> {
        self.retrying(|| self.inner.raw_list_page(bucket, prefix, delimiter, continuation))
            .await
    }

    pub async fn read_range(
        &self,
        bucket: &str,
        name: &str,
        generation: u64,
        start: u64,
        limit: u64,
        read_handle: ReadHandleHint,
    ) -> Result<ReadRangeResponse, ObjectError> {
        self.retrying(|| {
            self.inner
                .raw_read_range(bucket, name, generation, start, limit, read_handle.clone())
        })
        .await
    }

    /// Precondition failures are mapped to `PreconditionFailed` and
    /// deliberately never retried.
    pub async fn create_chunk_writer(
        &self,
        bucket: &str,
        name: &str,
        precondition: Precondition,
    ) -> Result<Box<dyn ChunkWriter>, ObjectError> {
        match self
            .retrying(|| self.inner.raw_create_chunk_writer(bucket, name, precondition))
            .await
        {
            Ok(w) => Ok(w),
            Err(e) => Err(e),
        }
    }

    pub async fn compose(
        &self,
        bucket: &str,
        dest: &str,
        parts: &[ComposeSource],
        precondition: Precondition,
    ) -> Result<ObjectRecord, ObjectError> {
        self.retrying(|| self.inner.raw_compose(bucket, dest, parts, precondition))
            .await
    }

    pub async fn delete(
        &self,
        bucket: &str,
        name: &str,
        precondition: Precondition,
    ) -> Result<(), ObjectError> {
        self.retrying(|| self.inner.raw_delete(bucket, name, precondition))
            .await
    }
}
