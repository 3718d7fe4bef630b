// Admin API
//
// Privileged control of the block processor. Every route requires the
// `x-admin-token` header to pass the configured verifier.

use std::sync::Arc;

use axum::{
    extract::{Path as AxumPath, Query},
    http::{HeaderMap, StatusCode},
    Extension, Json,
};
use tracing::warn;

use super::helpers::{forbidden, indexer_error, ApiResult};
use super::types::{ApiError, AppsQuery};
use super::ApiState;
use crate::admin::AdminOutcome;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";

fn authorize(state: &ApiState, headers: &HeaderMap) -> Result<(), (StatusCode, Json<ApiError>)> {
    let token = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok());
    if state.verifier.verify(token) {
        Ok(())
    } else {
        warn!("Rejected admin request");
        Err(forbidden())
    }
}

pub async fn stop_v1(
    Extension(state): Extension<Arc<ApiState>>,
    headers: HeaderMap,
) -> ApiResult<AdminOutcome> {
    authorize(&state, &headers)?;
    Ok(Json(state.admin.stop().await))
}

pub async fn restart_v1(
    Extension(state): Extension<Arc<ApiState>>,
    headers: HeaderMap,
) -> ApiResult<AdminOutcome> {
    authorize(&state, &headers)?;
    Ok(Json(state.admin.restart().await))
}

pub async fn reindex_v1(
    Extension(state): Extension<Arc<ApiState>>,
    headers: HeaderMap,
    Query(query): Query<AppsQuery>,
) -> ApiResult<AdminOutcome> {
    authorize(&state, &headers)?;
    state
        .admin
        .reindex(query.apps)
        .await
        .map(Json)
        .map_err(indexer_error)
}

pub async fn rescan_v1(
    Extension(state): Extension<Arc<ApiState>>,
    headers: HeaderMap,
    AxumPath(height): AxumPath<i64>,
    Query(query): Query<AppsQuery>,
) -> ApiResult<AdminOutcome> {
    authorize(&state, &headers)?;
    state
        .admin
        .rescan(height, query.apps)
        .await
        .map(Json)
        .map_err(indexer_error)
}
