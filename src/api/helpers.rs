// API Helper Functions
//
// Shared utilities used across API modules.

use std::sync::Arc;

use axum::{http::StatusCode, Json};

use super::types::ApiError;
use crate::error::IndexerError;
use crate::store::IndexStore;

/// Standard error result type for API handlers
pub type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

pub fn internal_error(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ApiError::new(message)))
}

pub fn bad_request(message: impl Into<String>) -> (StatusCode, Json<ApiError>) {
    (StatusCode::BAD_REQUEST, Json(ApiError::new(message)))
}

pub fn forbidden() -> (StatusCode, Json<ApiError>) {
    (StatusCode::FORBIDDEN, Json(ApiError::new("Unauthorized. Access denied.")))
}

/// Map an indexer error to a response; misuse is the caller's fault
pub fn indexer_error(err: IndexerError) -> (StatusCode, Json<ApiError>) {
    match err {
        IndexerError::InvalidRescan(_) | IndexerError::MissingHeight => bad_request(err.to_string()),
        other => internal_error(other.to_string()),
    }
}

/// Run a store read on the blocking pool
pub async fn db_read_blocking<T, F>(store: &Arc<IndexStore>, read: F) -> ApiResult<T>
where
    T: Send + 'static,
    F: FnOnce(&IndexStore) -> crate::error::Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || read(&store))
        .await
        .map_err(|e| internal_error(format!("Task error: {}", e)))?
        .map(Json)
        .map_err(indexer_error)
}
