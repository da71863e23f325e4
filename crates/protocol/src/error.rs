//! Error types for the protocol crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::SessionId;

/// Protocol error type covering encoding and framing failures.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// A single frame line exceeds the maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual line size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

/// Error codes reported to front ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The child process could not be launched (missing executable, bad
    /// working directory, resource exhaustion).
    SpawnError,
    /// No live process of the requested kind exists for the session id.
    NotFound,
    /// The process input stream is already closed.
    IoError,
    /// A process of the requested kind is already live for the session id.
    AlreadyRunning,
    /// The preferred port could not be bound by the build process.
    PortBindFailure,
    /// The process did not confirm termination within the grace period.
    TerminationTimeout,
    /// Malformed or unsupported request.
    InvalidRequest,
    /// Bridge-side failure unrelated to the child process.
    Internal,
}

impl ErrorCode {
    /// Returns the wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::SpawnError => "spawn_error",
            ErrorCode::NotFound => "not_found",
            ErrorCode::IoError => "io_error",
            ErrorCode::AlreadyRunning => "already_running",
            ErrorCode::PortBindFailure => "port_bind_failure",
            ErrorCode::TerminationTimeout => "termination_timeout",
            ErrorCode::InvalidRequest => "invalid_request",
            ErrorCode::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error payload returned in place of a successful response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
    /// Session the failed command referred to, if any.
    pub session_id: Option<SessionId>,
    /// Whether the caller can retry after re-checking state.
    pub recoverable: bool,
}

impl std::fmt::Display for ErrorMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorMessage {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialization_error_display() {
        let err = ProtocolError::Serialization("invalid utf-8".to_string());
        assert_eq!(err.to_string(), "serialization failed: invalid utf-8");
    }

    #[test]
    fn test_deserialization_error_display() {
        let err = ProtocolError::Deserialization("unexpected end of input".to_string());
        assert_eq!(
            err.to_string(),
            "deserialization failed: unexpected end of input"
        );
    }

    #[test]
    fn test_frame_too_large_display() {
        let err = ProtocolError::FrameTooLarge {
            size: 5_000_000,
            max: 4_194_304,
        };
        assert_eq!(
            err.to_string(),
            "frame too large: 5000000 bytes exceeds maximum of 4194304 bytes"
        );
    }

    #[test]
    fn test_from_json_syntax_error() {
        let err = serde_json::from_str::<serde_json::Value>("{not json").unwrap_err();
        assert!(matches!(
            ProtocolError::from(err),
            ProtocolError::Deserialization(_)
        ));
    }

    #[test]
    fn test_error_code_wire_names() {
        for code in [
            ErrorCode::SpawnError,
            ErrorCode::NotFound,
            ErrorCode::IoError,
            ErrorCode::AlreadyRunning,
            ErrorCode::PortBindFailure,
            ErrorCode::TerminationTimeout,
            ErrorCode::InvalidRequest,
            ErrorCode::Internal,
        ] {
            let json = serde_json::to_string(&code).unwrap();
            assert_eq!(json, format!("\"{}\"", code.as_str()));
        }
    }

    #[test]
    fn test_error_message_display() {
        let msg = ErrorMessage {
            code: ErrorCode::NotFound,
            message: "no terminal for session a".to_string(),
            session_id: Some(SessionId::from("a")),
            recoverable: true,
        };
        assert_eq!(msg.to_string(), "not_found: no terminal for session a");
    }
}
