//! `ObjectClient` implementation that speaks to the `refstore`
//! reference object store over HTTP, grounded on the teacher's
//! `api_client.rs` (reqwest usage) generalized from whole-file
//! GET/PUT to the byte-range/resumable-upload surface
//! requires.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use super::{
    ChunkWriter, ComposeSource, ListPage, ObjectClient, ObjectError, ObjectRecord, Precondition,
    ReadHandleHint, ReadRangeResponse, SystemTimeKey,
};

#[derive(Debug, Clone)]
pub struct HttpObjectClient {
    client: reqwest::Client,
    base_url: url::Url,
}

impl HttpObjectClient {
    pub fn new(base_url: url::Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn object_url(&self, bucket: &str, name: &str) -> url::Url {
        self.base_url
            .join(&format!("objects/{bucket}/{}", urlencoding_path(name)))
            .expect("base_url is always a valid base")
    }

    fn map_status(status: reqwest::StatusCode) -> ObjectError {
        match status.as_u16() {
            404 => ObjectError::NotFound,
            412 => ObjectError::PreconditionFailed,
            401 => ObjectError::Unauthenticated,
            s @ (429 | 500..=599) => ObjectError::Transient { status: s },
            s => ObjectError::Other(format!("unexpected status {s}")),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn urlencoding_path(name: &str) -> String {
    name.split('/')
        .map(|seg| url::form_urlencoded::byte_serialize(seg.as_bytes()).collect::<String>())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Serialize, Deserialize)]
struct WireObject {
    bucket: String,
    name: String,
    generation: u64,
    meta_generation: u64,
    size: u64,
    content_type: String,
    updated_at_unix: i64,
    md5: Option<String>,
    crc32c: Option<u32>,
    metadata: std::collections::HashMap<String, String>,
}

impl From<WireObject> for ObjectRecord {
    fn from(w: WireObject) -> Self {
        ObjectRecord {
            bucket: w.bucket,
            name: w.name,
            generation: w.generation,
            meta_generation: w.meta_generation,
            size: w.size,
            content_type: w.content_type,
            updated_at: SystemTimeKey(w.updated_at_unix),
            md5: w.md5,
            crc32c: w.crc32c,
            metadata: w.metadata,
        }
    }
}

#[derive(Deserialize)]
struct WireListPage {
    objects: Vec<WireObject>,
    subdirs: Vec<String>,
    next_continuation: Option<String>,
}

fn precondition_query(p: Precondition) -> Vec<(&'static str, String)> {
    match p {
        Precondition::None => vec![],
        Precondition::IfGenerationMatch(g) => vec![("if_generation_match", g.to_string())],
        Precondition::IfMetaGenerationMatch(g) => {
            vec![("if_metageneration_match", g.to_string())]
        }
    }
}

#[async_trait]
impl ObjectClient for HttpObjectClient {
    async fn raw_stat(&self, bucket: &str, name: &str) -> Result<ObjectRecord, ObjectError> {
        let resp = self
            .client
            .get(self.object_url(bucket, name))
            .query(&[("stat", "1")])
            .send()
            .await
            .map_err(|e| ObjectError::Other(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        let wire: WireObject = resp
            .json()
            .await
            .map_err(|e| ObjectError::Other(e.to_string()))?;
        Ok(wire.into())
    }

    async fn raw_list_page(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: &str,
        continuation: Option<&str>,
    ) -> Result<ListPage, ObjectError> {
        let url = self
            .base_url
            .join(&format!("list/{bucket}"))
            .expect("base_url is always a valid base");
        let mut query = vec![("prefix", prefix.to_string()), ("delimiter", delimiter.to_string())];
        if let Some(cont) = continuation {
            query.push(("continuation", cont.to_string()));
        }
        let resp = self
            .client
            .get(url)
            .query(&query)
            .send()
            .await
            .map_err(|e| ObjectError::Other(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        let wire: WireListPage = resp
            .json()
            .await
            .map_err(|e| ObjectError::Other(e.to_string()))?;
        Ok(ListPage {
            objects: wire.objects.into_iter().map(Into::into).collect(),
            subdirs: wire.subdirs,
            next_continuation: wire.next_continuation,
        })
    }

    async fn raw_read_range(
        &self,
        bucket: &str,
        name: &str,
        generation: u64,
        start: u64,
        limit: u64,
        read_handle: ReadHandleHint,
    ) -> Result<ReadRangeResponse, ObjectError> {
        let end = start + limit.saturating_sub(1);
        let mut req = self
            .client
            .get(self.object_url(bucket, name))
            .query(&[("generation", generation.to_string())])
            .header("Range", format!("bytes={start}-{end}"));
        if let Some(hint) = &read_handle.0 {
            req = req.header("X-Read-Handle", hex_encode(hint));
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ObjectError::Other(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        let next_read_handle = resp
            .headers()
            .get("X-Read-Handle")
            .and_then(|v| v.to_str().ok())
            .map(|s| ReadHandleHint(Some(s.as_bytes().to_vec())))
            .unwrap_or_default();
        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| ObjectError::Other(e.to_string())));
        Ok(ReadRangeResponse {
            stream: Box::pin(stream),
            next_read_handle,
        })
    }

    async fn raw_create_chunk_writer(
        &self,
        bucket: &str,
        name: &str,
        precondition: Precondition,
    ) -> Result<Box<dyn ChunkWriter>, ObjectError> {
        let url = self
            .base_url
            .join(&format!("resumable/{bucket}/{}", urlencoding_path(name)))
            .expect("base_url is always a valid base");
        let resp = self
            .client
            .post(url)
            .query(&precondition_query(precondition))
            .send()
            .await
            .map_err(|e| ObjectError::Other(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        let upload_id: String = resp
            .json()
            .await
            .map_err(|e| ObjectError::Other(e.to_string()))?;
        Ok(Box::new(HttpChunkWriter {
            client: self.client.clone(),
            upload_url: self
                .base_url
                .join(&format!("resumable/{upload_id}"))
                .expect("base_url is always a valid base"),
            bytes_sent: 0,
        }))
    }

    async fn raw_compose(
        &self,
        bucket: &str,
        dest: &str,
        parts: &[ComposeSource],
        precondition: Precondition,
    ) -> Result<ObjectRecord, ObjectError> {
        #[derive(Serialize)]
        struct ComposeReq<'a> {
            dest: &'a str,
            parts: &'a [ComposeSourceWire],
        }
        #[derive(Serialize)]
        struct ComposeSourceWire {
            name: String,
            generation: u64,
        }
        let parts_wire: Vec<ComposeSourceWire> = parts
            .iter()
            .map(|p| ComposeSourceWire {
                name: p.name.clone(),
                generation: p.generation,
            })
            .collect();
        let url = self
            .base_url
            .join(&format!("compose/{bucket}"))
            .expect("base_url is always a valid base");
        let resp = self
            .client
            .post(url)
            .query(&precondition_query(precondition))
            .json(&ComposeReq {
                dest,
                parts: &parts_wire,
            })
            .send()
            .await
            .map_err(|e| ObjectError::Other(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Self::map_status(resp.status()));
        }
        let wire: WireObject = resp
            .json()
            .await
            .map_err(|e| ObjectError::Other(e.to_string()))?;
        Ok(wire.into())
    }

    async fn raw_delete(
        &self,
        bucket: &str,
        name: &str,
        precondition: Precondition,
    ) -> Result<(), ObjectError> {
        let resp = self
            .client
            .delete(self.object_url(bucket, name))
            .query(&precondition_query(precondition))
            .send()
            .await
            .map_err(|e| ObjectError::Other(e.to_string()))?;
        if resp.status().is_success() || resp.status().as_u16() == 404 {
            return Ok(());
        }
        Err(Self::map_status(resp.status()))
    }
}

struct HttpChunkWriter {
    client: reqwest::Client,
    upload_url: url::Url,
    bytes_sent: u64,
}

#[async_trait]
impl ChunkWriter for HttpChunkWriter {
    async fn append_chunk(&mut self, bytes: Bytes) -> Result<(), ObjectError> {
        let len = bytes.len() as u64;
        let resp = self
            .client
            .put(self.upload_url.clone())
            .header(
                "Content-Range",
                format!(
                    "bytes {}-{}/*",
                    self.bytes_sent,
                    self.bytes_sent + len.saturating_sub(1)
                ),
            )
            .body(bytes)
            .send()
            .await
            .map_err(|e| ObjectError::Other(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(HttpObjectClient::map_status(resp.status()));
        }
        self.bytes_sent += len;
        Ok(())
    }

    async fn finalize(self: Box<Self>) -> Result<ObjectRecord, ObjectError> {
        let mut url = self.upload_url.clone();
        url.query_pairs_mut().append_pair("finalize", "1");
        let resp = self
            .client
            .post(url)
            .send()
            .await
            .map_err(|e| ObjectError::Other(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(HttpObjectClient::map_status(resp.status()));
        }
        let wire: WireObject = resp
            .json()
            .await
            .map_err(|e| ObjectError::Other(e.to_string()))?;
        Ok(wire.into())
    }
}
