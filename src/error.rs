use crate::models::ProviderKind;
use std::time::Duration;
use thiserror::Error;

/// Classification of a single failed remote attempt. Adapters map their
/// provider's status codes and payloads onto these.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProviderError {
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("transient failure: {0}")]
    Transient(String),

    /// Daily quota, distinct from short-term rate limiting.
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl ProviderError {
    /// Map a transport-level reqwest failure.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            ProviderError::Transient(err.to_string())
        } else {
            ProviderError::Fatal(err.to_string())
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("{provider}: gave up after {attempts} attempts: {last_error}")]
    RetryExhausted {
        provider: ProviderKind,
        attempts: u32,
        last_error: String,
    },

    #[error("{provider}: daily quota exhausted, native search disabled for this run")]
    QuotaExhausted { provider: ProviderKind },

    #[error("{provider}: {message}")]
    Fatal { provider: ProviderKind, message: String },

    /// Failure of the scraped web search, not of the provider's API.
    #[error("web search for {provider} links failed: {message}")]
    WebSearch { provider: ProviderKind, message: String },

    #[error("no adapter configured for {0}")]
    MissingAdapter(ProviderKind),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("interrupted")]
    Interrupted,
}

impl SyncError {
    pub fn fatal(provider: ProviderKind, message: impl Into<String>) -> Self {
        SyncError::Fatal { provider, message: message.into() }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
