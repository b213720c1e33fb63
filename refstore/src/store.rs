//! In-process object store: an in-memory index of object metadata
//! (generation-ordered, so preconditions behave the way the real
//! remote store's do) backed by plain files under `data_dir`, plus
//! in-flight resumable-upload sessions spooled to a scratch file.
//!
//! Grounded on the teacher's `server/src/handlers.rs` (fs::read /
//! fs::write against a flat `data/` directory), generalized from
//! whole-file GET/PUT to generation-tracked objects with preconditions
//! and chunked resumable uploads.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use crate::error::StoreError;
use crate::wire::WireObject;

#[derive(Debug, Clone, Copy)]
pub enum Precondition {
    None,
    IfGenerationMatch(u64),
    IfMetaGenerationMatch(u64),
}

#[derive(Debug, Clone)]
struct ObjectEntry {
    generation: u64,
    meta_generation: u64,
    size: u64,
    content_type: String,
    updated_at_unix: i64,
    metadata: HashMap<String, String>,
}

impl ObjectEntry {
    fn to_wire(&self, bucket: &str, name: &str) -> WireObject {
        WireObject {
            bucket: bucket.to_string(),
            name: name.to_string(),
            generation: self.generation,
            meta_generation: self.meta_generation,
            size: self.size,
            content_type: self.content_type.clone(),
            updated_at_unix: self.updated_at_unix,
            md5: None,
            crc32c: None,
            metadata: self.metadata.clone(),
        }
    }
}

struct UploadSession {
    bucket: String,
    name: String,
    precondition_generation: Option<u64>,
    precondition_meta_generation: Option<u64>,
    scratch_path: PathBuf,
    bytes_received: u64,
}

pub struct Store {
    data_dir: PathBuf,
    tmp_dir: PathBuf,
    objects: Mutex<HashMap<(String, String), ObjectEntry>>,
    uploads: Mutex<HashMap<String, UploadSession>>,
    next_generation: AtomicU64,
    next_upload_id: AtomicU64,
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Rejects names that would escape `data_dir` once joined.
fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() || name.split('/').any(|seg| seg == ".." || seg == ".") {
        return Err(StoreError::InvalidRequest(format!("invalid object name: {name}")));
    }
    if name.contains('\u{000A}') {
        return Err(StoreError::InvalidRequest(
            "object names may not contain the conflict suffix byte".to_string(),
        ));
    }
    Ok(())
}

impl Store {
    pub async fn new(data_dir: PathBuf) -> std::io::Result<Self> {
        let tmp_dir = data_dir.join(".tmp");
        fs::create_dir_all(&data_dir).await?;
        fs::create_dir_all(&tmp_dir).await?;
        Ok(Self {
            data_dir,
            tmp_dir,
            objects: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            next_upload_id: AtomicU64::new(1),
        })
    }

    fn local_path(&self, bucket: &str, name: &str) -> PathBuf {
        self.data_dir.join(bucket).join(name)
    }

    fn key(bucket: &str, name: &str) -> (String, String) {
        (bucket.to_string(), name.to_string())
    }

    fn check_precondition(
        existing: Option<&ObjectEntry>,
        precondition: Precondition,
    ) -> Result<(), StoreError> {
        match precondition {
            Precondition::None => Ok(()),
            Precondition::IfGenerationMatch(expected) => {
                let actual = existing.map(|e| e.generation).unwrap_or(0);
                if actual == expected {
                    Ok(())
                } else {
                    Err(StoreError::PreconditionFailed)
                }
            }
            Precondition::IfMetaGenerationMatch(expected) => {
                let actual = existing.map(|e| e.meta_generation).unwrap_or(0);
                if actual == expected {
                    Ok(())
                } else {
                    Err(StoreError::PreconditionFailed)
                }
            }
        }
    }

    pub fn stat(&self, bucket: &str, name: &str) -> Result<WireObject, StoreError> {
        validate_name(name)?;
        self.objects
            .lock()
            .get(&Self::key(bucket, name))
            .map(|e| e.to_wire(bucket, name))
            .ok_or(StoreError::NotFound)
    }

    /// Lists objects directly under `prefix` (split on the first
    /// `delimiter` past the prefix) and the distinct subdirectory
    /// prefixes one level down. `page_size` bounds how many objects a
    /// single page returns; `continuation` is the 0-based index of the
    /// first not-yet-returned entry, as a decimal string.
    pub fn list_page(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
        continuation: Option<&str>,
        page_size: usize,
    ) -> Result<crate::wire::WireListPage, StoreError> {
        let start: usize = match continuation {
            Some(token) => token
                .parse()
                .map_err(|_| StoreError::InvalidRequest("bad continuation token".to_string()))?,
            None => 0,
        };

        let objects_guard = self.objects.lock();
        let mut direct_names: Vec<&str> = Vec::new();
        let mut subdirs = std::collections::BTreeSet::new();
        for (b, name) in objects_guard.keys() {
            if b != bucket {
                continue;
            }
            let Some(rest) = name.strip_prefix(prefix) else { continue };
            if rest.is_empty() {
                continue;
            }
            if delimiter.is_empty() {
                direct_names.push(name.as_str());
                continue;
            }
            match rest.find(delimiter) {
                Some(idx) => {
                    subdirs.insert(format!("{prefix}{}", &rest[..idx + delimiter.len()]));
                }
                None => direct_names.push(name.as_str()),
            }
        }
        direct_names.sort_unstable();

        let page_end = std::cmp::min(start.saturating_add(page_size), direct_names.len());
        let objects = direct_names[start.min(direct_names.len())..page_end]
            .iter()
            .map(|name| objects_guard.get(&Self::key(bucket, name)).unwrap().to_wire(bucket, name))
            .collect();
        let next_continuation = if page_end < direct_names.len() {
            Some(page_end.to_string())
        } else {
            None
        };

        Ok(crate::wire::WireListPage {
            objects,
            subdirs: subdirs.into_iter().collect(),
            next_continuation,
        })
    }

    pub async fn read_range(
        &self,
        bucket: &str,
        name: &str,
        generation: u64,
        start: u64,
        limit: u64,
    ) -> Result<Vec<u8>, StoreError> {
        validate_name(name)?;
        {
            let guard = self.objects.lock();
            let entry = guard.get(&Self::key(bucket, name)).ok_or(StoreError::NotFound)?;
            if entry.generation != generation {
                return Err(StoreError::NotFound);
            }
        }
        let path = self.local_path(bucket, name);
        let mut file = fs::File::open(&path).await?;
        file.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = vec![0u8; limit as usize];
        let mut total = 0usize;
        loop {
            use tokio::io::AsyncReadExt;
            let n = file.read(&mut buf[total..]).await?;
            if n == 0 {
                break;
            }
            total += n;
            if total == buf.len() {
                break;
            }
        }
        buf.truncate(total);
        Ok(buf)
    }

    /// Creates a resumable-upload session. The precondition is
    /// recorded now but only enforced at `finalize`, matching the real
    /// store's atomic-at-commit semantics: initiating a resumable
    /// upload never itself fails on a stale precondition.
    pub async fn create_upload(
        &self,
        bucket: &str,
        name: &str,
        precondition: Precondition,
    ) -> Result<String, StoreError> {
        validate_name(name)?;
        let id = self.next_upload_id.fetch_add(1, Ordering::SeqCst);
        let upload_id = format!("{id}");
        let scratch_path = self.tmp_dir.join(&upload_id);
        fs::File::create(&scratch_path).await?;
        let (gen_match, meta_match) = match precondition {
            Precondition::None => (None, None),
            Precondition::IfGenerationMatch(g) => (Some(g), None),
            Precondition::IfMetaGenerationMatch(g) => (None, Some(g)),
        };
        self.uploads.lock().insert(
            upload_id.clone(),
            UploadSession {
                bucket: bucket.to_string(),
                name: name.to_string(),
                precondition_generation: gen_match,
                precondition_meta_generation: meta_match,
                scratch_path,
                bytes_received: 0,
            },
        );
        Ok(upload_id)
    }

    pub async fn append_chunk(&self, upload_id: &str, offset: u64, bytes: &[u8]) -> Result<(), StoreError> {
        let scratch_path = {
            let guard = self.uploads.lock();
            let session = guard.get(upload_id).ok_or(StoreError::UnknownUpload)?;
            if offset != session.bytes_received {
                return Err(StoreError::InvalidRequest(format!(
                    "out-of-order chunk: expected offset {}, got {offset}",
                    session.bytes_received
                )));
            }
            session.scratch_path.clone()
        };
        let mut file = fs::OpenOptions::new().write(true).open(&scratch_path).await?;
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(bytes).await?;
        file.flush().await?;
        let mut guard = self.uploads.lock();
        if let Some(session) = guard.get_mut(upload_id) {
            session.bytes_received += bytes.len() as u64;
        }
        Ok(())
    }

    pub async fn finalize_upload(&self, upload_id: &str) -> Result<WireObject, StoreError> {
        let session = self
            .uploads
            .lock()
            .remove(upload_id)
            .ok_or(StoreError::UnknownUpload)?;

        let precondition = match (session.precondition_generation, session.precondition_meta_generation) {
            (Some(g), _) => Precondition::IfGenerationMatch(g),
            (None, Some(g)) => Precondition::IfMetaGenerationMatch(g),
            (None, None) => Precondition::None,
        };
        let key = Self::key(&session.bucket, &session.name);
        {
            let guard = self.objects.lock();
            Self::check_precondition(guard.get(&key), precondition)?;
        }

        let dest_path = self.local_path(&session.bucket, &session.name);
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::copy(&session.scratch_path, &dest_path).await?;
        let _ = fs::remove_file(&session.scratch_path).await;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let entry = ObjectEntry {
            generation,
            meta_generation: 1,
            size: session.bytes_received,
            content_type: "application/octet-stream".to_string(),
            updated_at_unix: now_unix(),
            metadata: HashMap::new(),
        };
        let wire = entry.to_wire(&session.bucket, &session.name);
        self.objects.lock().insert(key, entry);
        Ok(wire)
    }

    pub async fn compose(
        &self,
        bucket: &str,
        dest: &str,
        parts: &[(String, u64)],
        precondition: Precondition,
    ) -> Result<WireObject, StoreError> {
        validate_name(dest)?;
        {
            let guard = self.objects.lock();
            Self::check_precondition(guard.get(&Self::key(bucket, dest)), precondition)?;
        }

        let mut data = Vec::new();
        {
            let guard = self.objects.lock();
            for (name, generation) in parts {
                let entry = guard.get(&Self::key(bucket, name)).ok_or(StoreError::NotFound)?;
                if entry.generation != *generation {
                    return Err(StoreError::PreconditionFailed);
                }
            }
        }
        for (name, _) in parts {
            let bytes = fs::read(self.local_path(bucket, name)).await?;
            data.extend_from_slice(&bytes);
        }

        let dest_path = self.local_path(bucket, dest);
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&dest_path, &data).await?;

        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let entry = ObjectEntry {
            generation,
            meta_generation: 1,
            size: data.len() as u64,
            content_type: "application/octet-stream".to_string(),
            updated_at_unix: now_unix(),
            metadata: HashMap::new(),
        };
        let wire = entry.to_wire(bucket, dest);
        self.objects.lock().insert(Self::key(bucket, dest), entry);
        Ok(wire)
    }

    pub async fn delete(&self, bucket: &str, name: &str, precondition: Precondition) -> Result<(), StoreError> {
        validate_name(name)?;
        let key = Self::key(bucket, name);
        {
            let guard = self.objects.lock();
            match guard.get(&key) {
                Some(entry) => Self::check_precondition(Some(entry), precondition)?,
                None => return Ok(()),
            }
        }
        self.objects.lock().remove(&key);
        let _ = fs::remove_file(self.local_path(bucket, name)).await;
        Ok(())
    }

    /// Seeds an object directly from bytes, bypassing the resumable
    /// upload path; used by integration tests to set up fixtures.
    pub async fn seed(&self, bucket: &str, name: &str, data: &[u8]) -> std::io::Result<u64> {
        let dest_path = self.local_path(bucket, name);
        if let Some(parent) = dest_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&dest_path, data).await?;
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        self.objects.lock().insert(
            Self::key(bucket, name),
            ObjectEntry {
                generation,
                meta_generation: 1,
                size: data.len() as u64,
                content_type: "application/octet-stream".to_string(),
                updated_at_unix: now_unix(),
                metadata: HashMap::new(),
            },
        );
        Ok(generation)
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_name_rejects_dot_segments_and_empty() {
        assert!(validate_name("").is_err());
        assert!(validate_name("a/./b").is_err());
        assert!(validate_name("a/../b").is_err());
        assert!(validate_name("a/b").is_ok());
    }

    #[test]
    fn validate_name_rejects_conflict_suffix_byte() {
        assert!(validate_name("foo\u{000A}").is_err());
    }

    #[tokio::test]
    async fn seed_then_stat_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf()).await.unwrap();
        let generation = store.seed("b", "obj", b"hello").await.unwrap();
        let wire = store.stat("b", "obj").unwrap();
        assert_eq!(wire.generation, generation);
        assert_eq!(wire.size, 5);
    }

    #[tokio::test]
    async fn stat_missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf()).await.unwrap();
        assert!(matches!(store.stat("b", "nope"), Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().to_path_buf()).await.unwrap();
        store.delete("b", "nope", Precondition::None).await.unwrap();
    }
}
