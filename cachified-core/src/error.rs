//! Error types for cachified operations

use std::sync::Arc;
use thiserror::Error;

/// Boxed error returned by value producers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Durable backend errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Failed to open {backend} backend: {reason}")]
    OpenFailed { backend: String, reason: String },

    #[error("Transaction failed: {reason}")]
    TransactionFailed { reason: String },

    #[error("Request to {backend} failed with status {status}: {message}")]
    RequestFailed {
        backend: String,
        status: u16,
        message: String,
    },

    #[error("Backend {backend} is not writable from this instance")]
    ReadOnly { backend: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

/// Serialization errors for cached values and records.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("Failed to encode value: {reason}")]
    Encode { reason: String },

    #[error("Failed to decode value: {reason}")]
    Decode { reason: String },

    #[error("Invalid base64 payload: {reason}")]
    InvalidBase64 { reason: String },
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        match e.classify() {
            serde_json::error::Category::Io => CodecError::Encode {
                reason: e.to_string(),
            },
            _ => CodecError::Decode {
                reason: e.to_string(),
            },
        }
    }
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required configuration field: {field}")]
    MissingRequired { field: String },

    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Incompatible options: {option_a} and {option_b}")]
    IncompatibleOptions { option_a: String, option_b: String },
}

/// Master error type for all cachified errors.
///
/// The first four variants are the failure modes a cache caller can reason
/// about; only `Producer` and `Validation` ever escape `get_or_produce`.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("Producer for key {key} failed: {source}")]
    Producer {
        key: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync + 'static>,
    },

    #[error("Value for key {key} failed validation: {reason}")]
    Validation { key: String, reason: String },

    #[error("Durable backend {backend} unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("Forwarding write for key {key} to {target} failed: {reason}")]
    ForwardFailure {
        key: String,
        target: String,
        reason: String,
    },

    #[error("Cluster membership lookup failed: {reason}")]
    Membership { reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Wrap a producer failure for `key`.
    pub fn producer(key: impl Into<String>, source: BoxError) -> Self {
        Self::Producer {
            key: key.into(),
            source: Arc::from(source),
        }
    }

    /// Returns true if this error originated in the caller's producer.
    pub fn is_producer(&self) -> bool {
        matches!(self, Self::Producer { .. })
    }
}

/// Result type alias for cachified operations.
pub type CacheResult<T> = Result<T, CacheError>;

// =============================================================================
// TESTS
// =============================================================================
