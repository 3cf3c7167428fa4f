//! Centralized error types for fluxgate

use http::StatusCode;
use thiserror::Error;

/// Gateway error types for configuration loading and object building.
///
/// Errors on the request path are [`StatusError`]s instead: they carry the
/// HTTP status the responder writes to the client.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Configuration parsing or validation failed
    #[error("Configuration error: {0}")]
    Config(String),

    /// A matcher could not be compiled (bad CIDR, bad regex, ...)
    #[error("Matcher error: {0}")]
    Matcher(String),

    /// A middleware could not be built from its config
    #[error("Middleware '{name}': {reason}")]
    Middleware { name: String, reason: String },

    /// A processor directive could not be built
    #[error("Directive '{name}': {reason}")]
    Directive { name: String, reason: String },

    /// An upstream could not be built from its config
    #[error("Upstream '{id}': {reason}")]
    Upstream { id: String, reason: String },

    /// TLS configuration error
    #[error("TLS error: {0}")]
    Tls(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

/// Convenience Result type alias
pub type Result<T> = std::result::Result<T, GatewayError>;

/// An error carrying the HTTP status code written to the client.
///
/// When `message` is set, the responder sends it as a `text/plain` body;
/// otherwise only the status line goes out.
#[derive(Debug, Clone)]
pub struct StatusError {
    pub code: StatusCode,
    pub message: Option<String>,
}

impl std::error::Error for StatusError {}

impl StatusError {
    pub fn new(code: StatusCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    /// Attach a message shown to the client.
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn bad_request() -> Self {
        Self::new(StatusCode::BAD_REQUEST)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED)
    }

    pub fn forbidden() -> Self {
        Self::new(StatusCode::FORBIDDEN)
    }

    pub fn not_found() -> Self {
        Self::new(StatusCode::NOT_FOUND)
    }

    pub fn too_many_requests() -> Self {
        Self::new(StatusCode::TOO_MANY_REQUESTS)
    }

    pub fn internal_server_error() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn bad_gateway() -> Self {
        Self::new(StatusCode::BAD_GATEWAY)
    }

    pub fn service_unavailable() -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE)
    }

    pub fn gateway_timeout() -> Self {
        Self::new(StatusCode::GATEWAY_TIMEOUT)
    }
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.message {
            Some(msg) => write!(f, "{}", msg),
            None => write!(f, "{}", self.code),
        }
    }
}
