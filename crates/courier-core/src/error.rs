//! Error types for Courier.
//!
//! Every failure surfaced by the library is a `CourierError`. Errors raised
//! while serving a command are turned into error responses on the wire, so
//! each variant also knows how to render itself as a wire value.

use thiserror::Error;

/// Main error type for the Courier library.
#[derive(Debug, Error)]
pub enum CourierError {
    // Lifecycle errors
    #[error("Connection is not active")]
    NotConnected,

    #[error("Connection closed before a response arrived")]
    ConnectionClosed,

    #[error("Handshake failed: {message}")]
    HandshakeFailed { message: String },

    // Local usage errors
    #[error("Unable to call a nonexistent or non-callable target: {target}")]
    NotCallable { target: String },

    #[error("Unknown command: {name}")]
    UnknownCommand { name: String },

    #[error("Invalid arguments: {message}")]
    InvalidArguments { message: String },

    // Remote application errors
    #[error("{0}")]
    Remote(String),

    #[error("Remote call failed with value {0}")]
    RemoteValue(serde_json::Value),

    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for Courier operations.
pub type Result<T> = std::result::Result<T, CourierError>;

impl From<std::io::Error> for CourierError {
    fn from(err: std::io::Error) -> Self {
        CourierError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(err: serde_json::Error) -> Self {
        CourierError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl CourierError {
    /// Shorthand for an implementation-defined failure.
    pub fn other(message: impl Into<String>) -> Self {
        CourierError::Other(message.into())
    }

    /// Render this error as the `value` of an error response.
    ///
    /// Raw remote values are forwarded untouched; everything else travels
    /// as its display string.
    pub fn to_wire_value(&self) -> serde_json::Value {
        match self {
            CourierError::RemoteValue(value) => value.clone(),
            other => serde_json::Value::String(other.to_string()),
        }
    }

    /// Rebuild the error carried by an error response.
    pub fn from_wire_value(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(message) => CourierError::Remote(message),
            other => CourierError::RemoteValue(other),
        }
    }

    /// Check if this error originated on the other side of the channel.
    pub fn is_remote(&self) -> bool {
        matches!(self, CourierError::Remote(_) | CourierError::RemoteValue(_))
    }
}
