//! Shared application state for the node's router.

use std::sync::Arc;

use cachified_storage::Cachified;

use crate::config::ApiConfig;

/// State shared by every route.
#[derive(Clone)]
pub struct AppState {
    /// The process-wide cache instance.
    pub cache: Cachified,
    internal_token: Option<Arc<str>>,
    pub start_time: std::time::Instant,
}

impl AppState {
    pub fn new(cache: Cachified, internal_token: Option<String>) -> Self {
        Self {
            cache,
            internal_token: internal_token.map(Arc::from),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn from_config(cache: Cachified, config: &ApiConfig) -> Self {
        Self::new(cache, config.internal_token.clone())
    }

    /// Token expected on internal endpoints, if any.
    pub fn internal_token(&self) -> Option<&str> {
        self.internal_token.as_deref()
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("cache", &self.cache)
            .field("internal_token", &self.internal_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}
