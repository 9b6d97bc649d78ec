// src/error.rs
//! Error taxonomy for the pipeline.
//!
//! Nothing here is fatal to the process: transport and rate-limit errors feed
//! endpoint rotation, cache errors degrade to misses, configuration errors
//! skip the offending bucket and surface in the published snapshot.

use std::time::Duration;

/// Failure of a single fetch attempt against one endpoint.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("endpoint unreachable: {0}")]
    Unreachable(String),

    #[error("no known payload shape matched: {0}")]
    Parse(String),

    #[error("request blocked with status {0}")]
    Blocked(u16),
}

impl FetchError {
    /// Short label used for metrics and logs.
    pub fn label(&self) -> &'static str {
        match self {
            FetchError::Timeout => "timeout",
            FetchError::RateLimited { .. } => "rate_limited",
            FetchError::Unreachable(_) => "unreachable",
            FetchError::Parse(_) => "parse",
            FetchError::Blocked(_) => "blocked",
        }
    }

    /// Timeouts, unreachable and blocked endpoints are recovered by rotation.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FetchError::Timeout | FetchError::Unreachable(_) | FetchError::Blocked(_)
        )
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            FetchError::Timeout
        } else if e.is_decode() || e.is_body() {
            FetchError::Parse(e.to_string())
        } else {
            FetchError::Unreachable(e.to_string())
        }
    }
}

/// Disk persistence failure inside the cache store.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Malformed keyword bucket or pipeline setting.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("keyword bucket has an empty key")]
    EmptyKey,

    #[error("keyword bucket '{0}' has no keywords")]
    NoKeywords(String),

    #[error("keyword bucket '{bucket}' has a blank keyword at position {index}")]
    BlankKeyword { bucket: String, index: usize },

    #[error("duplicate keyword bucket key '{0}'")]
    DuplicateKey(String),

    #[error("unknown keyword bucket '{0}'")]
    UnknownBucket(String),

    #[error("invalid setting: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_classification() {
        assert!(FetchError::Timeout.is_transport());
        assert!(FetchError::Blocked(403).is_transport());
        assert!(FetchError::Unreachable("dns".into()).is_transport());
        assert!(!FetchError::RateLimited { retry_after: None }.is_transport());
        assert!(!FetchError::Parse("html".into()).is_transport());
    }

    #[test]
    fn labels_are_stable() {
        assert_eq!(
            FetchError::RateLimited {
                retry_after: Some(Duration::from_secs(5))
            }
            .label(),
            "rate_limited"
        );
        assert_eq!(FetchError::Parse(String::new()).label(), "parse");
    }
}
