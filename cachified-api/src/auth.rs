//! Bearer-token check for `/internal/*` endpoints.
//!
//! Replicas authenticate forwarded writes with the shared internal token;
//! operators use the same token for listing and stats.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::warn;

use crate::error::ApiError;
use crate::state::AppState;

/// Reject requests without `Authorization: Bearer <internal token>`.
pub async fn internal_auth_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.internal_token() else {
        warn!(path = %request.uri().path(), "Internal request rejected, no internal token configured");
        return Err(ApiError::unauthorized("Internal endpoints are disabled on this node"));
    };

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("Missing Authorization header"))?;

    let token = presented
        .strip_prefix("Bearer ")
        .ok_or_else(ApiError::invalid_token)?;

    if !tokens_match(token.trim(), expected) {
        warn!(path = %request.uri().path(), "Internal request rejected, invalid token");
        return Err(ApiError::invalid_token());
    }

    Ok(next.run(request).await)
}

/// Constant-time token comparison.
fn tokens_match(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}
