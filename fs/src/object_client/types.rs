//! Data model shared by every `ObjectClient` implementation.

use std::collections::HashMap;
use std::time::SystemTime;

/// `(bucket, name, generation, meta_generation, size, content_type,
/// updated_at, md5, crc32c, metadata map)` describing one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRecord {
    pub bucket: String,
    pub name: String,
    pub generation: u64,
    pub meta_generation: u64,
    pub size: u64,
    pub content_type: String,
    pub updated_at: SystemTimeKey,
    pub md5: Option<String>,
    pub crc32c: Option<u32>,
    pub metadata: HashMap<String, String>,
}

/// `SystemTime` doesn't implement `Eq`; this wraps the representation
/// gcsfuse actually compares on (seconds since epoch) so `ObjectRecord`
/// can still derive equality for tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemTimeKey(pub i64);

impl From<SystemTime> for SystemTimeKey {
    fn from(t: SystemTime) -> Self {
        let secs = t
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        SystemTimeKey(secs)
    }
}

impl From<SystemTimeKey> for SystemTime {
    fn from(k: SystemTimeKey) -> Self {
        std::time::UNIX_EPOCH + std::time::Duration::from_secs(k.0.max(0) as u64)
    }
}

/// A page of a directory listing: the objects directly in the
/// directory and the subdirectory prefixes, per GCS's `delimiter`
/// semantics.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub objects: Vec<ObjectRecord>,
    pub subdirs: Vec<String>,
    pub next_continuation: Option<String>,
}

/// Precondition attached to a write. `IfGenerationMatch(0)`
/// asserts "object must not exist".
#[derive(Debug, Clone, Copy)]
pub enum Precondition {
    None,
    IfGenerationMatch(u64),
    IfMetaGenerationMatch(u64),
}

/// A handle to an in-progress resumable upload. Concrete `ObjectClient` impls hand back an opaque value
/// behind this trait; `append_chunk`/`finalize` consume it through
/// `&mut self` on the trait object the upload handler owns.
#[async_trait::async_trait]
pub trait ChunkWriter: Send {
    async fn append_chunk(&mut self, bytes: bytes::Bytes) -> Result<(), super::ObjectError>;
    async fn finalize(self: Box<Self>) -> Result<ObjectRecord, super::ObjectError>;
}

/// One part reference for a `compose` call.
#[derive(Debug, Clone)]
pub struct ComposeSource {
    pub name: String,
    pub generation: u64,
}

/// Opaque hint threaded from one `read_range` response into the next
/// request for the same download job.
#[derive(Debug, Clone, Default)]
pub struct ReadHandleHint(pub Option<Vec<u8>>);

/// `read_range`'s result: the byte stream plus the opaque hint the
/// caller should pass into its *next* `read_range` call against the
/// same download job.
pub struct ReadRangeResponse {
    pub stream: super::ByteStream,
    pub next_read_handle: ReadHandleHint,
}
