//! Error types for endpoint resolution

use thiserror::Error;

/// Result type alias for resolution operations
pub type Result<T> = std::result::Result<T, ResolveError>;

/// What the host selector should do after an attempt failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptVerdict {
    /// The host itself looks bad: freeze it and move to the next host
    FreezeHost,
    /// Transient failure: try the same host again
    RetrySameHost,
    /// Give up and surface the error to the caller
    Terminal,
}

/// Error types that can occur while resolving or using endpoints
///
/// The type is `Clone` so a single failed discovery query can be handed to
/// every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No endpoints configured")]
    NoEndpoints,

    #[error("No region available: {0}")]
    NoRegion(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Server returned {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for ResolveError {
    fn from(err: std::io::Error) -> Self {
        ResolveError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for ResolveError {
    fn from(err: serde_json::Error) -> Self {
        ResolveError::Decode(err.to_string())
    }
}

impl From<reqwest::Error> for ResolveError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ResolveError::Timeout(err.to_string())
        } else if err.is_decode() {
            ResolveError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ResolveError::from_http_status(status.as_u16(), err.to_string())
        } else {
            ResolveError::Transport(err.to_string())
        }
    }
}

impl ResolveError {
    /// Classify a failed attempt against a host
    ///
    /// - Transport errors and 5xx responses (except 501) mean the host is
    ///   unreachable or misbehaving, so it gets frozen
    /// - Timeouts and throttling (429, 573) are worth another try on the
    ///   same host
    /// - Everything else came from a reachable host or from local state and
    ///   will not improve by switching hosts
    pub fn verdict(&self) -> AttemptVerdict {
        match self {
            ResolveError::Transport(_) => AttemptVerdict::FreezeHost,
            ResolveError::Timeout(_) => AttemptVerdict::RetrySameHost,

            ResolveError::HttpStatus { status, .. } => match *status {
                429 | 573 => AttemptVerdict::RetrySameHost,
                501 => AttemptVerdict::Terminal,
                500..=599 => AttemptVerdict::FreezeHost,
                _ => AttemptVerdict::Terminal,
            },

            ResolveError::ConfigError(_) => AttemptVerdict::Terminal,
            ResolveError::NoEndpoints => AttemptVerdict::Terminal,
            ResolveError::NoRegion(_) => AttemptVerdict::Terminal,
            ResolveError::Decode(_) => AttemptVerdict::Terminal,
            ResolveError::Persistence(_) => AttemptVerdict::Terminal,
            ResolveError::Cancelled(_) => AttemptVerdict::Terminal,
            ResolveError::Io(_) => AttemptVerdict::Terminal,
        }
    }

    /// Create an error from an HTTP status code
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        ResolveError::HttpStatus {
            status,
            message: message.into(),
        }
    }

    /// Whether the error came from talking to a remote host
    pub fn is_remote(&self) -> bool {
        matches!(
            self,
            ResolveError::Transport(_)
                | ResolveError::Timeout(_)
                | ResolveError::HttpStatus { .. }
        )
    }
}
