//! Axum route handlers implementing the object-API surface that
//! `gcsfuse::object_client::http::HttpObjectClient` talks to.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::error::StoreError;
use crate::store::{Precondition, Store};
use crate::wire::{ComposeRequest, ListQuery, PreconditionQuery, StatQuery, WireListPage, WireObject};

pub type AppState = Arc<Store>;

/// Page size for a single `list_page` response; small enough that
/// realistic test directories exercise the continuation-token path.
const LIST_PAGE_SIZE: usize = 100;

fn precondition_of(q: &PreconditionQuery) -> Precondition {
    match (q.if_generation_match, q.if_metageneration_match) {
        (Some(g), _) => Precondition::IfGenerationMatch(g),
        (None, Some(g)) => Precondition::IfMetaGenerationMatch(g),
        (None, None) => Precondition::None,
    }
}

fn parse_range(headers: &HeaderMap) -> Result<(u64, u64), StoreError> {
    let raw = headers
        .get("range")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| StoreError::InvalidRequest("missing Range header".to_string()))?;
    let spec = raw
        .strip_prefix("bytes=")
        .ok_or_else(|| StoreError::InvalidRequest(format!("unsupported Range unit: {raw}")))?;
    let (start, end) = spec
        .split_once('-')
        .ok_or_else(|| StoreError::InvalidRequest(format!("malformed Range: {raw}")))?;
    let start: u64 = start
        .parse()
        .map_err(|_| StoreError::InvalidRequest(format!("malformed Range start: {raw}")))?;
    let end: u64 = end
        .parse()
        .map_err(|_| StoreError::InvalidRequest(format!("malformed Range end: {raw}")))?;
    if end < start {
        return Err(StoreError::InvalidRequest(format!("empty Range: {raw}")));
    }
    Ok((start, end - start + 1))
}

fn parse_content_range(headers: &HeaderMap) -> Result<u64, StoreError> {
    let raw = headers
        .get("content-range")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| StoreError::InvalidRequest("missing Content-Range header".to_string()))?;
    let spec = raw
        .strip_prefix("bytes ")
        .ok_or_else(|| StoreError::InvalidRequest(format!("unsupported Content-Range unit: {raw}")))?;
    let (range, _total) = spec
        .split_once('/')
        .ok_or_else(|| StoreError::InvalidRequest(format!("malformed Content-Range: {raw}")))?;
    let (start, _end) = range
        .split_once('-')
        .ok_or_else(|| StoreError::InvalidRequest(format!("malformed Content-Range: {raw}")))?;
    start
        .parse()
        .map_err(|_| StoreError::InvalidRequest(format!("malformed Content-Range start: {raw}")))
}

pub async fn health() -> &'static str {
    "OK"
}

/// Serves both `stat` (query `stat=1`) and ranged reads (a `Range`
/// header plus `generation`) against `/objects/:bucket/*name`.
pub async fn get_object(
    State(store): State<AppState>,
    Path((bucket, name)): Path<(String, String)>,
    Query(query): Query<StatQuery>,
    headers: HeaderMap,
) -> Result<Response, StoreError> {
    if query.stat.is_some() {
        let wire = store.stat(&bucket, &name)?;
        return Ok(Json(wire).into_response());
    }

    let generation = query
        .generation
        .ok_or_else(|| StoreError::InvalidRequest("missing generation query param".to_string()))?;
    let (start, limit) = parse_range(&headers)?;
    let data = store.read_range(&bucket, &name, generation, start, limit).await?;

    let mut response = (StatusCode::PARTIAL_CONTENT, data).into_response();
    if let Some(hint) = headers.get("x-read-handle") {
        response.headers_mut().insert("x-read-handle", hint.clone());
    }
    Ok(response)
}

pub async fn list(
    State(store): State<AppState>,
    Path(bucket): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<WireListPage>, StoreError> {
    let prefix = query.prefix.unwrap_or_default();
    let delimiter = query.delimiter.unwrap_or_else(|| "/".to_string());
    let page = store.list_page(
        &bucket,
        &prefix,
        &delimiter,
        query.continuation.as_deref(),
        LIST_PAGE_SIZE,
    )?;
    Ok(Json(page))
}

pub async fn create_resumable_upload(
    State(store): State<AppState>,
    Path((bucket, name)): Path<(String, String)>,
    Query(precondition): Query<PreconditionQuery>,
) -> Result<Json<String>, StoreError> {
    let upload_id = store
        .create_upload(&bucket, &name, precondition_of(&precondition))
        .await?;
    Ok(Json(upload_id))
}

#[derive(serde::Deserialize, Default)]
pub struct FinalizeQuery {
    pub finalize: Option<String>,
}

pub async fn resumable_chunk(
    State(store): State<AppState>,
    Path(upload_id): Path<String>,
    Query(query): Query<FinalizeQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, StoreError> {
    if query.finalize.is_some() {
        let wire = store.finalize_upload(&upload_id).await?;
        return Ok(Json(wire).into_response());
    }
    let offset = parse_content_range(&headers)?;
    store.append_chunk(&upload_id, offset, &body).await?;
    Ok(StatusCode::OK.into_response())
}

pub async fn compose(
    State(store): State<AppState>,
    Path(bucket): Path<String>,
    Query(precondition): Query<PreconditionQuery>,
    Json(req): Json<ComposeRequest>,
) -> Result<Json<WireObject>, StoreError> {
    let parts: Vec<(String, u64)> = req.parts.into_iter().map(|p| (p.name, p.generation)).collect();
    let wire = store
        .compose(&bucket, &req.dest, &parts, precondition_of(&precondition))
        .await?;
    Ok(Json(wire))
}

pub async fn delete_object(
    State(store): State<AppState>,
    Path((bucket, name)): Path<(String, String)>,
    Query(precondition): Query<PreconditionQuery>,
) -> Result<StatusCode, StoreError> {
    store.delete(&bucket, &name, precondition_of(&precondition)).await?;
    Ok(StatusCode::OK)
}
