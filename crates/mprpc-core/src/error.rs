//! Error types for the RPC engine.
//!
//! Three layers of failure are kept apart:
//!
//! - [`RpcError`]: the `{code, message}` pair that crosses the wire inside a
//!   Response's error slot.
//! - [`CallError`]: what a caller observes when it collects the outcome of an
//!   outbound call through a [`CallHandle`](crate::CallHandle).
//! - [`Error`]: local engine failures (transport, codec, connection state).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

// Wire error codes (JSON-RPC 2.0 numbering)
pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Invalid number/type of parameters.
pub const INVALID_METHOD_PARAMS: i32 = -32602;
/// All other errors.
pub const INTERNAL_ERROR: i32 = -32603;
pub const USER_ERROR: i32 = -32000;
pub const USER_ERROR_START: i32 = -32000;
pub const USER_ERROR_END: i32 = -32099;

/// Classification of a wire error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    Internal,
    /// Application-defined code in `-32099..=-32000`.
    User,
    /// Any code outside the reserved ranges.
    Other,
}

/// Error carried in the error slot of a Response.
///
/// Handlers may return this (wrapped in `anyhow::Error`) to choose the code
/// and message sent back to the caller; any other handler error is reported
/// as [`INTERNAL_ERROR`].
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("RPCError ({code}): {message}")]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(INVALID_REQUEST, message)
    }

    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::new(METHOD_NOT_FOUND, message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(INVALID_METHOD_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR, message)
    }

    /// Create an application error.
    ///
    /// Codes outside the user range are replaced by [`USER_ERROR`].
    pub fn user(code: i32, message: impl Into<String>) -> Self {
        let code = if (USER_ERROR_END..=USER_ERROR_START).contains(&code) {
            code
        } else {
            USER_ERROR
        };
        Self::new(code, message)
    }

    /// Classify the numeric code.
    pub fn kind(&self) -> ErrorKind {
        match self.code {
            PARSE_ERROR => ErrorKind::ParseError,
            INVALID_REQUEST => ErrorKind::InvalidRequest,
            METHOD_NOT_FOUND => ErrorKind::MethodNotFound,
            INVALID_METHOD_PARAMS => ErrorKind::InvalidParams,
            INTERNAL_ERROR => ErrorKind::Internal,
            c if (USER_ERROR_END..=USER_ERROR_START).contains(&c) => ErrorKind::User,
            _ => ErrorKind::Other,
        }
    }

    /// Wire representation: `[code, message]`.
    pub fn to_value(&self) -> Value {
        Value::Array(vec![
            Value::from(self.code),
            Value::String(self.message.clone()),
        ])
    }

    /// Decode a Response error slot.
    ///
    /// Accepted shapes, tried in order: a `[code, message]` pair, a map with
    /// `code` and `message` keys, and anything else as an opaque user error.
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Array(items) if items.len() == 2 => {
                if let Some(code) = as_code(&items[0]) {
                    return Self::new(code, message_text(&items[1]));
                }
            }
            Value::Object(map) => {
                if let (Some(code), Some(message)) = (map.get("code"), map.get("message")) {
                    if let Some(code) = as_code(code) {
                        return Self::new(code, message_text(message));
                    }
                }
            }
            _ => {}
        }
        Self::new(USER_ERROR, message_text(value))
    }
}

fn as_code(value: &Value) -> Option<i32> {
    value.as_i64().and_then(|c| i32::try_from(c).ok())
}

fn message_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Failure observed while collecting the outcome of an outbound call.
#[derive(Debug, Error)]
pub enum CallError {
    /// The call did not finish within the wait timeout. Local only.
    #[error("RPC request timeout after {0:?}")]
    Timeout(Duration),

    /// The connection went away before a Response arrived. Local only.
    #[error("Request terminated")]
    Terminated,

    /// The remote side answered with an error.
    #[error(transparent)]
    Remote(#[from] RpcError),

    /// The result could not be converted to the requested type.
    #[error("Failed to decode result: {0}")]
    Decode(#[source] serde_json::Error),
}

impl CallError {
    /// Wire code of a remote error, if this is one.
    pub fn code(&self) -> Option<i32> {
        match self {
            CallError::Remote(e) => Some(e.code),
            _ => None,
        }
    }
}

/// Local engine error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Not connected")]
    NotConnected,

    #[error("Too many pending calls ({limit})")]
    TooManyPendingCalls { limit: usize },

    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("Frame of {size} bytes exceeds maximum {max}")]
    BufferOverflow { size: usize, max: usize },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl Error {
    pub(crate) fn codec(message: impl Into<String>) -> Self {
        Error::Codec {
            message: message.into(),
        }
    }

    /// Whether the error means the connection is gone.
    pub fn is_disconnect(&self) -> bool {
        match self {
            Error::NotConnected => true,
            Error::WebSocket(e) => matches!(
                e,
                tokio_tungstenite::tungstenite::Error::ConnectionClosed
                    | tokio_tungstenite::tungstenite::Error::AlreadyClosed
            ),
            _ => false,
        }
    }
}
