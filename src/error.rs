use std::sync::Arc;

use thiserror::Error;

/// Crate-wide result alias. The error variant is the PostHog-specific
/// [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the PostHog client.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// A public-API input failed validation (empty `distinct_id`, empty
    /// event name, etc.). Surfaced through the `on_error` callback; public
    /// methods return `false` instead of raising.
    #[error("{0}")]
    InvalidMessage(String),

    /// The client was constructed with an invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Invalid `host` configuration.
    #[error("invalid host configuration")]
    InvalidHost(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid API key.
    #[error("unauthorized, api key is likely invalid")]
    Unauthorized,

    /// The feature-flags quota for this project has been exceeded.
    #[error("feature flags quota limited")]
    QuotaLimited,

    /// Indicates that a background thread panicked. This should normally
    /// never happen.
    #[error("background thread panicked")]
    ThreadPanicked,

    /// An I/O error.
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    #[error(transparent)]
    Io(Arc<std::io::Error>),

    /// Network error.
    #[error(transparent)]
    Network(Arc<reqwest::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<reqwest::Error> for Error {
    fn from(value: reqwest::Error) -> Self {
        Error::Network(Arc::new(value.without_url()))
    }
}
