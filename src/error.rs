use std::sync::Arc;

/// Result type used throughout the crate.
///
/// This `Result` type is a standard Rust `Result` where the error variant is
/// the flipkit-specific [`Error`] enum.
pub type Result<T> = std::result::Result<T, Error>;

/// Enum representing possible errors that can occur in the engine.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The engine configuration was rejected before any network traffic was
    /// attempted (empty identifiers, identifiers containing whitespace,
    /// missing API key).
    #[error("invalid engine configuration: {0}")]
    InvalidConfiguration(String),

    /// Invalid base URL configuration.
    #[error("invalid base_url configuration")]
    InvalidBaseUrl(#[source] url::ParseError),

    /// The request was unauthorized, possibly due to an invalid API key.
    #[error("unauthorized, api_key is likely invalid")]
    Unauthorized,

    /// A rule document failed to parse. The previously installed rule set
    /// stays active.
    #[error("malformed rule document")]
    Parse(#[source] Arc<serde_json::Error>),

    /// Indicates that the refresh thread panicked. This should normally never
    /// happen.
    #[error("refresh thread panicked")]
    RefreshThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
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

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Error::Parse(Arc::new(value))
    }
}

impl Error {
    /// Whether a retry at the next scheduled fetch can reasonably succeed.
    ///
    /// Unauthorized and configuration errors latch: polling again with the
    /// same credentials cannot recover them.
    pub(crate) fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Error::Unauthorized | Error::InvalidBaseUrl(_) | Error::InvalidConfiguration(_)
        )
    }
}
