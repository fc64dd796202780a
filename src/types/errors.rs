//! Application error types.
//!
//! All errors use `thiserror` for automatic Error trait derivation and provide
//! clear error messages with context.

use thiserror::Error;

/// Application result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error produced by message handlers and transports.
///
/// Failure rules match on the concrete type behind the box by downcasting.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error enum for the courier runtime.
#[derive(Error, Debug)]
pub enum Error {
    /// Envelope store unreachable or transaction conflict.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// `send` resolved zero destinations.
    #[error("no routes for message type '{message_type}'")]
    NoRoutes { message_type: String },

    /// Invalid endpoint, routing or policy configuration.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Validation errors (malformed envelope, bad address).
    #[error("validation error: {0}")]
    Validation(String),

    /// An incoming envelope with this id was already persisted.
    #[error("duplicate incoming envelope {0}")]
    DuplicateEnvelope(String),

    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Timeout (request/reply, handler execution).
    #[error("timeout: {0}")]
    Timeout(String),

    /// The remote handler acknowledged a request with a failure.
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// Cancellation via token or shutdown.
    #[error("operation cancelled: {0}")]
    Cancelled(String),

    /// Transport send/receive failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// Message handler failure surfaced to an inline caller.
    #[error("handler error: {0}")]
    Handler(String),

    /// Internal errors.
    #[error("internal error: {0}")]
    Internal(String),

    /// Serialization/deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O errors.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether the durability agent should retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Persistence(_) | Error::Transport(_) | Error::Io(_))
    }
}

// Convenience constructors
impl Error {
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    pub fn no_routes(message_type: impl Into<String>) -> Self {
        Self::NoRoutes {
            message_type: message_type.into(),
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn duplicate_envelope(id: impl std::fmt::Display) -> Self {
        Self::DuplicateEnvelope(id.to_string())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::Timeout(msg.into())
    }

    pub fn request_failed(msg: impl Into<String>) -> Self {
        Self::RequestFailed(msg.into())
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn handler(msg: impl Into<String>) -> Self {
        Self::Handler(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error::validation(format!("invalid endpoint address: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_routes_message_names_type() {
        let err = Error::no_routes("app.Message3");
        assert_eq!(err.to_string(), "no routes for message type 'app.Message3'");
    }

    #[test]
    fn test_request_failed_prefix() {
        let err = Error::request_failed("You shall not pass!");
        assert!(err.to_string().starts_with("Request failed"));
    }

    #[test]
    fn test_transient_classification() {
        assert!(Error::persistence("db down").is_transient());
        assert!(Error::transport("connection reset").is_transient());
        assert!(!Error::validation("bad").is_transient());
        assert!(!Error::no_routes("x").is_transient());
    }

    #[test]
    fn test_boxed_error_downcasts_back() {
        let boxed: BoxError = Box::new(Error::timeout("slow"));
        assert!(boxed.downcast_ref::<Error>().is_some());
    }
}
