//! cachified node entry point
//!
//! Builds the process-wide cache from `CACHIFIED_*` environment variables,
//! serves the node router, and flushes the cache on shutdown.

use cachified_api::{
    create_router, init_tracing, ApiConfig, ApiError, ApiResult, AppState, TelemetryConfig,
};
use cachified_core::EngineConfig;
use cachified_storage::Cachified;

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::from_env();
    init_tracing(&telemetry_config)?;

    let engine_config = EngineConfig::from_env();
    let cache = Cachified::from_config(&engine_config)?;

    let api_config = ApiConfig::from_env();
    if api_config.internal_token.is_none() {
        tracing::warn!("CACHIFIED_INTERNAL_TOKEN not set, internal endpoints will reject every request");
    }
    let app = create_router(AppState::from_config(cache.clone(), &api_config));

    let addr = api_config.bind_addr()?;
    tracing::info!(%addr, instance = %engine_config.instance_id, "Starting cachified node");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    let server = axum::serve(listener, app);
    tokio::select! {
        result = server => {
            result.map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutdown signal received");
        }
    }

    cache.shutdown().await?;
    tracing::info!("Cache flushed, exiting");
    Ok(())
}
