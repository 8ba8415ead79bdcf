//! Error taxonomy for registration, encoding and the call runtime.

use std::time::Duration;

/// Every failure the runtime reports.
///
/// Causes are carried as strings so a single connection failure can be fanned
/// out to every pending call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// A value of this type cannot cross the boundary.
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    #[error("invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("unknown function: {0}")]
    UnknownFunction(String),

    /// A received value names a type missing from the type registry.
    #[error("unknown type: {0}")]
    UnknownType(String),

    #[error("invalid arguments for {func_id}: {reason}")]
    InvalidArguments { func_id: String, reason: String },

    #[error("failed to encode value of type {type_name}: {reason}")]
    EncodeFailure { type_name: String, reason: String },

    #[error("failed to decode value of type {type_name}: {reason}")]
    DecodeFailure { type_name: String, reason: String },

    /// A fallible registered function returned an error.
    #[error("function {func_id} failed: {message}")]
    FunctionFailed { func_id: String, message: String },

    /// The peer answered the call with an error response.
    #[error("remote call {func_id} failed: {message}")]
    Remote { func_id: String, message: String },

    /// Malformed or out-of-sequence frame; fatal for the connection.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("call cancelled")]
    Cancelled,

    #[error("connection already started")]
    AlreadyStarted,

    #[error("failed to spawn plugin: {0}")]
    Spawn(String),

    #[error("i/o error: {0}")]
    Io(String),
}

impl Error {
    pub fn invalid_arguments(func_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArguments {
            func_id: func_id.into(),
            reason: reason.into(),
        }
    }

    pub fn function_failed(func_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FunctionFailed {
            func_id: func_id.into(),
            message: message.into(),
        }
    }

    /// True for errors that take the whole connection down rather than a single call.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_) | Self::ConnectionClosed | Self::Io(_)
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
