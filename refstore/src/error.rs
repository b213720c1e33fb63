//! Error taxonomy for the reference store, mapped onto the HTTP status
//! codes `gcsfuse`'s retry classifier already knows how to read
//! (404/412/401/429/5xx — see `object_client::http::map_status`).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found")]
    NotFound,
    #[error("precondition failed")]
    PreconditionFailed,
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unknown upload id")]
    UnknownUpload,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = match &self {
            StoreError::NotFound | StoreError::UnknownUpload => StatusCode::NOT_FOUND,
            StoreError::PreconditionFailed => StatusCode::PRECONDITION_FAILED,
            StoreError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            StoreError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::warn!(error = %self, %status, "request failed");
        (status, self.to_string()).into_response()
    }
}
