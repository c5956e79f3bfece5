//! cachified API - HTTP Surface of a Cache Node
//!
//! Each process embedding a [`Cachified`](cachified_storage::Cachified)
//! instance can expose this router. The designated writer uses it to receive
//! writes forwarded by replicas; operators use it for key listing and stats.
//! [`server_timing_middleware`] is also usable on an application's own
//! router to surface cache timings per request.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod server_timing;
pub mod state;
pub mod telemetry;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use cachified_storage::FORWARD_PATH;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub use auth::internal_auth_middleware;
pub use config::ApiConfig;
pub use error::{ApiError, ApiResult, ErrorCode};
pub use routes::{cache_stats, instance_info, list_keys, ping, receive_forwarded_write};
pub use server_timing::{server_timing_middleware, SERVER_TIMING};
pub use state::AppState;
pub use telemetry::{init_tracing, LogFormat, TelemetryConfig};

/// Build the node router.
pub fn create_router(state: AppState) -> Router {
    let internal = Router::new()
        .route(FORWARD_PATH, post(receive_forwarded_write))
        .route("/internal/cache/keys", get(list_keys))
        .route("/internal/cache/stats", get(cache_stats))
        .route("/internal/cache/instance", get(instance_info))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            internal_auth_middleware,
        ));

    Router::new()
        .route("/health/ping", get(ping))
        .merge(internal)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::from_fn(server_timing_middleware)),
        )
        .with_state(state)
}
