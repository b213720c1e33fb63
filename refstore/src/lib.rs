//! Reference implementation of the object-API surface `gcsfuse` talks
//! to: stat, list, ranged read, resumable upload, compose, delete. Not
//! the production object-storage service (out of scope per the core
//! spec) — a local stand-in for exercising the filesystem core against
//! a real network round trip in tests and local development.

pub mod error;
pub mod handlers;
pub mod store;
pub mod wire;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

pub use store::Store;

pub fn router(store: Arc<Store>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/list/:bucket", get(handlers::list))
        .route(
            "/objects/:bucket/*name",
            get(handlers::get_object).delete(handlers::delete_object),
        )
        .route("/resumable/:bucket/*name", post(handlers::create_resumable_upload))
        .route(
            "/resumable/:upload_id",
            post(handlers::resumable_chunk).put(handlers::resumable_chunk),
        )
        .route("/compose/:bucket", post(handlers::compose))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(store)
}
