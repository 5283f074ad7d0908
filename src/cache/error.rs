//! Output cache error taxonomy.
//!
//! Every per-request variant is recoverable: the orchestrator logs it and falls
//! back to uncached behaviour. Only [`CacheError::UnknownPolicy`] and
//! [`CacheError::InvalidSettings`] reach callers, and only at startup.

use thiserror::Error;

/// Errors produced by the output cache.
///
/// `Clone` so one leader failure can be handed to every single-flight waiter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    #[error("vary-by value provider `{provider}` failed: {reason}")]
    KeyDerivation { provider: String, reason: String },

    #[error("cache store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("malformed conditional header `{header}`")]
    MalformedConditionalHeader { header: &'static str },

    #[error("downstream computation failed: {0}")]
    Downstream(String),

    #[error("no output cache policy named `{0}` is registered")]
    UnknownPolicy(String),

    #[error("invalid output cache settings: {0}")]
    InvalidSettings(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::InvalidSettings(err.to_string())
    }
}
