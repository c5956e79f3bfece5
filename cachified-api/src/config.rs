//! Node configuration.

use std::net::SocketAddr;

use crate::error::{ApiError, ApiResult};

/// Default page size for key listings.
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Upper bound on a single key listing.
pub const MAX_LIST_LIMIT: usize = 1000;

/// HTTP configuration for a cachified node.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Interface to bind (default: 0.0.0.0).
    pub bind_host: String,

    /// Port as configured, parsed in [`ApiConfig::bind_addr`].
    pub port: String,

    /// Shared secret expected on `/internal/*` requests. With none set, every
    /// internal request is rejected.
    pub internal_token: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: "3000".to_string(),
            internal_token: None,
        }
    }
}

impl ApiConfig {
    /// Create ApiConfig from environment variables.
    ///
    /// Environment variables:
    /// - `CACHIFIED_BIND`: interface to bind (default: 0.0.0.0)
    /// - `PORT`, then `CACHIFIED_PORT`: port (default: 3000)
    /// - `CACHIFIED_INTERNAL_TOKEN`: bearer token for internal endpoints
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let bind_host = std::env::var("CACHIFIED_BIND").unwrap_or(defaults.bind_host);

        let port = std::env::var("PORT")
            .ok()
            .or_else(|| std::env::var("CACHIFIED_PORT").ok())
            .unwrap_or(defaults.port);

        let internal_token = std::env::var("CACHIFIED_INTERNAL_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty());

        Self {
            bind_host,
            port,
            internal_token,
        }
    }

    pub fn with_internal_token(mut self, token: impl Into<String>) -> Self {
        self.internal_token = Some(token.into());
        self
    }

    /// Resolve the socket address to listen on.
    pub fn bind_addr(&self) -> ApiResult<SocketAddr> {
        let port = self.port.parse::<u16>().map_err(|_| {
            ApiError::invalid_input(format!("Invalid port value: {}", self.port))
        })?;

        let addr = format!("{}:{}", self.bind_host, port);
        addr.parse::<SocketAddr>().map_err(|e| {
            ApiError::invalid_input(format!("Invalid bind address {}: {}", addr, e))
        })
    }
}
