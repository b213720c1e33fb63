//! Download job: one per cache key, state machine
//! `NotStarted -> Downloading -> Completed | Failed | Invalid`, driving
//! a sequential range-read pipeline into a local cache file and waking
//! offset-subscribed waiters as bytes land.

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::watch;

use crate::object_client::{ObjectClientFacade, ObjectError, ReadHandleHint};

#[derive(Debug, Clone)]
pub enum JobState {
    NotStarted,
    Downloading { bytes_present: u64 },
    Completed { size: u64 },
    Failed(String),
    Invalid,
}

impl JobState {
    pub fn bytes_present(&self) -> u64 {
        match self {
            JobState::Downloading { bytes_present } => *bytes_present,
            JobState::Completed { size } => *size,
            _ => 0,
        }
    }

    pub fn is_terminal_non_completed(&self) -> bool {
        matches!(self, JobState::Failed(_) | JobState::Invalid)
    }
}

pub struct DownloadJob {
    state: watch::Sender<JobState>,
    local_path: PathBuf,
}

impl DownloadJob {
    /// Spawns the background download task and returns the handle
    /// immediately; the task races ahead independently of any
    /// subscriber.
    pub fn spawn<C: crate::object_client::ObjectClient + 'static>(
        bucket: String,
        object: String,
        generation: u64,
        expected_size: u64,
        local_path: PathBuf,
        object_client: Arc<ObjectClientFacade<C>>,
        sequential_read_chunk: u64,
    ) -> Arc<Self> {
        let (tx, _rx) = watch::channel(JobState::NotStarted);
        let job = Arc::new(Self {
            state: tx,
            local_path,
        });
        let job_for_task = job.clone();
        tokio::spawn(async move {
            job_for_task
                .run(
                    bucket,
                    object,
                    generation,
                    expected_size,
                    object_client,
                    sequential_read_chunk,
                )
                .await;
        });
        job
    }

    pub fn watch(&self) -> watch::Receiver<JobState> {
        self.state.subscribe()
    }

    pub fn local_path(&self) -> &std::path::Path {
        &self.local_path
    }

    /// Completes when `bytes_present >= offset` or the job reaches a
    /// terminal non-`Completed` state.
    pub async fn subscribe_at(&self, offset: u64) -> JobState {
        let mut rx = self.watch();
        loop {
            let current = rx.borrow().clone();
            if current.bytes_present() >= offset || current.is_terminal_non_completed() {
                return current;
            }
            if rx.changed().await.is_err() {
                return rx.borrow().clone();
            }
        }
    }

    fn mark_invalid(&self) {
        let _ = self.state.send(JobState::Invalid);
    }

    async fn run<C: crate::object_client::ObjectClient>(
        self: Arc<Self>,
        bucket: String,
        object: String,
        generation: u64,
        expected_size: u64,
        object_client: Arc<ObjectClientFacade<C>>,
        sequential_read_chunk: u64,
    ) {
        let _ = self.state.send(JobState::Downloading { bytes_present: 0 });

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.local_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                let _ = self.state.send(JobState::Failed(e.to_string()));
                return;
            }
        };
        if let Err(e) = file.set_len(expected_size).await {
            let _ = self.state.send(JobState::Failed(e.to_string()));
            return;
        }
        let mut file = file;

        let mut offset = 0u64;
        let mut read_handle = ReadHandleHint::default();
        while offset < expected_size {
            let limit = std::cmp::min(sequential_read_chunk, expected_size - offset);
            let resp = match object_client
                .read_range(&bucket, &object, generation, offset, limit, read_handle.clone())
                .await
            {
                Ok(r) => r,
                Err(ObjectError::NotFound) => {
                    self.mark_invalid();
                    return;
                }
                Err(e) => {
                    let _ = self.state.send(JobState::Failed(e.to_string()));
                    return;
                }
            };
            read_handle = resp.next_read_handle;
            let mut stream = resp.stream;
            if let Err(e) = file.seek(std::io::SeekFrom::Start(offset)).await {
                let _ = self.state.send(JobState::Failed(e.to_string()));
                return;
            }
            let mut written_this_range = 0u64;
            loop {
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        if let Err(e) = file.write_all(&chunk).await {
                            let _ = self.state.send(JobState::Failed(e.to_string()));
                            return;
                        }
                        written_this_range += chunk.len() as u64;
                    }
                    Some(Err(e)) => {
                        let _ = self.state.send(JobState::Failed(e.to_string()));
                        return;
                    }
                    None => break,
                }
            }
            if written_this_range == 0 {
                // Transport returned an empty range; avoid spinning.
                let _ = self
                    .state
                    .send(JobState::Failed("empty range read".to_string()));
                return;
            }
            offset += written_this_range;
            let _ = self.state.send(JobState::Downloading { bytes_present: offset });
        }
        let _ = file.flush().await;
        let _ = self.state.send(JobState::Completed { size: expected_size });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_client::{ObjectClientFacade, RetryPolicy};
    use crate::testing::InMemoryObjectClient;

    #[tokio::test]
    async fn downloads_full_object_to_local_path() {
        let client = InMemoryObjectClient::new();
        let generation = client.seed("bucket", "obj", b"hello world".to_vec());
        let facade = Arc::new(ObjectClientFacade::new(client, RetryPolicy::default()));

        let dir = tempfile::tempdir().unwrap();
        let local_path = dir.path().join("obj");
        let job = DownloadJob::spawn(
            "bucket".to_string(),
            "obj".to_string(),
            generation,
            11,
            local_path.clone(),
            facade,
            4,
        );

        let final_state = job.subscribe_at(11).await;
        assert!(matches!(final_state, JobState::Completed { size: 11 }));
        let contents = tokio::fs::read(&local_path).await.unwrap();
        assert_eq!(contents, b"hello world");
    }

    #[tokio::test]
    async fn generation_mismatch_marks_invalid() {
        let client = InMemoryObjectClient::new();
        let generation = client.seed("bucket", "obj", b"hello".to_vec());
        let facade = Arc::new(ObjectClientFacade::new(client, RetryPolicy::default()));

        let dir = tempfile::tempdir().unwrap();
        let local_path = dir.path().join("obj");
        let job = DownloadJob::spawn(
            "bucket".to_string(),
            "obj".to_string(),
            generation + 1,
            5,
            local_path,
            facade,
            4,
        );

        let final_state = job.subscribe_at(5).await;
        assert!(matches!(final_state, JobState::Invalid));
    }
}
