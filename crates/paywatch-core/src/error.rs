//! Error types for paywatch-core
//!
//! Every error here is contained at a component boundary: sources, the
//! invoker and the poller log and swallow them so nothing reaches the host
//! page. The enum exists so internal plumbing can use `?` and so tests can
//! match on what went wrong.

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for paywatch-core
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration errors
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    /// Outbound HTTP failures (transport errors and non-2xx statuses)
    #[error("HTTP error: {0}")]
    Http(#[from] HttpError),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The downstream notifier has not been installed by the host yet
    #[error("notifier `{0}` is not available yet")]
    NotifierUnavailable(&'static str),

    /// The downstream notifier was present but failed while being invoked
    #[error("notifier `{name}` failed: {message}")]
    Notifier {
        /// Notifier name (initiate / purchase)
        name: &'static str,
        /// Message reported by the notifier
        message: String,
    },

    /// Payment verification capability failed
    #[error("verification failed: {0}")]
    Verification(String),

    /// Page-scoped storage failed
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O errors (config loading)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine was started outside a tokio runtime
    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

impl Error {
    /// Whether retrying the same operation later can plausibly succeed.
    ///
    /// Used by the invoker to label attempts in logs; the retry schedule
    /// itself does not branch on it.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotifierUnavailable(_) | Self::Notifier { .. } => true,
            Self::Http(err) => err.is_transient(),
            Self::Verification(_) | Self::Storage(_) | Self::Io(_) => true,
            Self::Config(_) | Self::Json(_) | Self::NoRuntime(_) => false,
        }
    }
}

/// Outbound HTTP errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    /// Endpoint could not be turned into an absolute URL
    #[error("invalid endpoint {endpoint}: {reason}")]
    InvalidUrl {
        /// Endpoint as configured
        endpoint: String,
        /// Parser message
        reason: String,
    },

    /// The request never produced a response
    #[error("transport failure: {0}")]
    Transport(String),

    /// The server answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Status {
        /// Status code
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },
}

impl HttpError {
    /// Whether the failure is worth another attempt.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::InvalidUrl { .. } => false,
            Self::Transport(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 429,
        }
    }
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// TOML could not be parsed into [`crate::config::Config`]
    #[error("failed to parse config: {0}")]
    ParseError(String),

    /// A value parsed but is not usable
    #[error("invalid config value `{field}`: {reason}")]
    InvalidValue {
        /// Dotted field path
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_status_transience() {
        let server = HttpError::Status {
            status: 503,
            body: String::new(),
        };
        let client = HttpError::Status {
            status: 404,
            body: String::new(),
        };
        assert!(server.is_transient());
        assert!(!client.is_transient());
        assert!(Error::Http(server).is_transient());
    }

    #[test]
    fn notifier_errors_render_name() {
        let err = Error::Notifier {
            name: "initiate",
            message: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "notifier `initiate` failed: boom");
        assert!(err.is_transient());
    }

    #[test]
    fn config_errors_are_not_transient() {
        let err = Error::from(ConfigError::ParseError("bad".into()));
        assert!(!err.is_transient());
        assert!(err.to_string().starts_with("Config error"));
    }
}
