//! Error types for strata.
//!
//! Library crates use [`StrataError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all strata operations.
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error outside of a source fetch (vector index, embeddings, LLM).
    #[error("network error: {0}")]
    Network(String),

    /// A source failed to fetch. Isolated to that source.
    #[error("source {source_name} failed: {message}")]
    SourceFetch {
        source_name: String,
        message: String,
    },

    /// A source-local rate limit would be exceeded by this fetch.
    #[error("rate limit exceeded for {source_name}, retry in {retry_after_ms}ms")]
    RateLimitExceeded {
        source_name: String,
        retry_after_ms: u64,
    },

    /// A store was used before `init()`.
    #[error("{store} store is not initialized")]
    NotInitialized { store: String },

    /// An enrichment step fell back to the local heuristic.
    #[error("analysis degraded: {0}")]
    AnalysisDegraded(String),

    /// A record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Database or vector index error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad argument, unknown name, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, StrataError>;

impl StrataError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a fetch error attributed to one source.
    pub fn source_fetch(source: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SourceFetch {
            source_name: source.into(),
            message: msg.into(),
        }
    }

    /// Create a not-initialized error for the named store.
    pub fn not_initialized(store: impl Into<String>) -> Self {
        Self::NotInitialized {
            store: store.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error only means an enrichment fell back to local rules.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::AnalysisDegraded(_))
    }
}

impl From<serde_json::Error> for StrataError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = StrataError::config("missing API key");
        assert_eq!(err.to_string(), "config error: missing API key");

        let err = StrataError::not_initialized("local");
        assert_eq!(err.to_string(), "local store is not initialized");

        let err = StrataError::RateLimitExceeded {
            source_name: "github".into(),
            retry_after_ms: 1500,
        };
        assert!(err.to_string().contains("retry in 1500ms"));
    }

    #[test]
    fn degraded_is_recognized() {
        assert!(StrataError::AnalysisDegraded("no model".into()).is_degraded());
        assert!(!StrataError::Storage("boom".into()).is_degraded());
    }
}
