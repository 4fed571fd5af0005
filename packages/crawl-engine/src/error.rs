//! Typed errors for the crawl engine.
//!
//! Uses `thiserror` for library errors (not `anyhow`) so callers can
//! distinguish transport failures (which feed the circuit breaker)
//! from storage and configuration failures (which are fatal).

use thiserror::Error;

/// Errors that can occur while driving a crawl.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Transport-level fetch failure. Counted toward the
    /// consecutive-error circuit breaker, never retried in place.
    #[error("fetch failed for {url}: {message}")]
    Fetch { url: String, message: String },

    /// Page-level parse failure. Logged and skipped; the job continues.
    #[error("parse failed: {0}")]
    Parse(String),

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// No site configured under this domain
    #[error("unknown site: {domain}")]
    UnknownSite { domain: String },

    /// Invalid configuration value
    #[error("config error: {reason}")]
    Config { reason: String },
}

impl EngineError {
    /// Wrap an arbitrary storage backend error.
    pub fn storage<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Storage(Box::new(err))
    }

    /// True for errors that count toward the circuit breaker.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Fetch { .. })
    }
}

impl From<sqlx::Error> for EngineError {
    fn from(err: sqlx::Error) -> Self {
        Self::storage(err)
    }
}

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
