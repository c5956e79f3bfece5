//! Node Endpoints
//!
//! - POST /internal/cache - apply a write forwarded by a replica
//! - GET /internal/cache/keys - list or search durable keys
//! - GET /internal/cache/stats - cache statistics
//! - GET /internal/cache/instance - this node's view of the designated writer
//! - GET /health/ping - liveness
//!
//! Every `/internal/*` route requires the internal bearer token.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Extension, Json,
};
use cachified_core::Timings;
use cachified_storage::{BackendKind, CacheStats, ForwardedWrite, InstanceInfo};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListKeysQuery {
    pub limit: Option<usize>,
    /// Substring filter; absent or empty lists every key.
    pub query: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListKeysResponse {
    pub keys: Vec<String>,
    pub count: usize,
    pub limit: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub backend: BackendKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceInfo>,
    pub hit_rate: f64,
    pub uptime_seconds: u64,
    pub stats: CacheStats,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// POST /internal/cache - apply a forwarded durable write.
///
/// 204 on success, 409 when this node is not the designated writer.
pub async fn receive_forwarded_write(
    State(state): State<AppState>,
    payload: Result<Json<ForwardedWrite>, JsonRejection>,
) -> ApiResult<StatusCode> {
    let Json(write) =
        payload.map_err(|e| ApiError::invalid_input(format!("Invalid forwarded write: {}", e)))?;

    let op = match &write {
        ForwardedWrite::Set { .. } => "set",
        ForwardedWrite::Delete { .. } => "delete",
    };
    let key = write.key().to_string();
    state.cache.apply_forwarded(write).await?;
    debug!(key = %key, op, "Forwarded write accepted");
    Ok(StatusCode::NO_CONTENT)
}

/// GET /internal/cache/keys?limit=&query=
pub async fn list_keys(
    State(state): State<AppState>,
    Extension(timings): Extension<Timings>,
    Query(params): Query<ListKeysQuery>,
) -> ApiResult<Json<ListKeysResponse>> {
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);
    if limit == 0 || limit > MAX_LIST_LIMIT {
        return Err(ApiError::invalid_range("limit", 1, MAX_LIST_LIMIT));
    }

    let keys = match params.query.as_deref().map(str::trim) {
        Some(query) if !query.is_empty() => {
            timings
                .time("cache:durable", Some("search keys"), state.cache.search_keys(query, limit))
                .await?
        }
        _ => {
            timings
                .time("cache:durable", Some("list keys"), state.cache.list_keys(limit))
                .await?
        }
    };

    Ok(Json(ListKeysResponse {
        count: keys.len(),
        keys,
        limit,
    }))
}

/// GET /internal/cache/stats
pub async fn cache_stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let stats = state.cache.stats();
    // membership errors only hide the instance block
    let instance = state.cache.instance_info().await.ok();
    Json(StatsResponse {
        backend: state.cache.durable().kind(),
        instance,
        hit_rate: stats.hit_rate(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        stats,
    })
}

/// GET /internal/cache/instance
pub async fn instance_info(State(state): State<AppState>) -> ApiResult<Json<InstanceInfo>> {
    Ok(Json(state.cache.instance_info().await?))
}

/// GET /health/ping
pub async fn ping() -> impl IntoResponse {
    (StatusCode::OK, "pong")
}
