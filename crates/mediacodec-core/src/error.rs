//! Error types for the media codec service.
//!
//! `CodecError` carries context for logs and callers; `ErrorKind` is the
//! small, stable taxonomy that crosses the process boundary as a status code.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Main error type for the codec service.
#[derive(Debug, Error)]
pub enum CodecError {
    // Argument errors
    #[error("Invalid value: {message}")]
    InvalidValue { message: String },

    #[error("Operation {operation} not permitted in state {state}")]
    OperateNotPermit { operation: String, state: String },

    // Resource errors
    #[error("Out of memory: {message}")]
    NoMemory { message: String },

    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unsupported: {message}")]
    Unsupported { message: String },

    // Remote errors
    #[error("Codec service died")]
    ServiceDied,

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Buffer cache hit for index {index} with no cached handle")]
    CacheMiss { index: u32 },

    // Generic errors
    #[error("{0}")]
    Unknown(String),
}

/// Result type alias for codec operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// The error taxonomy visible to callers and carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidValue,
    OperateNotPermit,
    NoMemory,
    Io,
    Timeout,
    Unsupported,
    ServiceDied,
    Unknown,
}

impl ErrorKind {
    /// Wire status code. `0` is reserved for success.
    pub fn status_code(self) -> i32 {
        match self {
            ErrorKind::InvalidValue => 1,
            ErrorKind::OperateNotPermit => 2,
            ErrorKind::NoMemory => 3,
            ErrorKind::Io => 4,
            ErrorKind::Timeout => 5,
            ErrorKind::Unsupported => 6,
            ErrorKind::ServiceDied => 7,
            ErrorKind::Unknown => 8,
        }
    }

    /// Decode a non-zero wire status. Unrecognized codes are `Unknown`.
    pub fn from_status_code(code: i32) -> Self {
        match code {
            1 => ErrorKind::InvalidValue,
            2 => ErrorKind::OperateNotPermit,
            3 => ErrorKind::NoMemory,
            4 => ErrorKind::Io,
            5 => ErrorKind::Timeout,
            6 => ErrorKind::Unsupported,
            7 => ErrorKind::ServiceDied,
            _ => ErrorKind::Unknown,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::InvalidValue => "invalid_value",
            ErrorKind::OperateNotPermit => "operate_not_permit",
            ErrorKind::NoMemory => "no_memory",
            ErrorKind::Io => "io",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unsupported => "unsupported",
            ErrorKind::ServiceDied => "service_died",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

impl From<std::io::Error> for CodecError {
    fn from(err: std::io::Error) -> Self {
        CodecError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(err: serde_json::Error) -> Self {
        CodecError::InvalidValue {
            message: format!("JSON: {}", err),
        }
    }
}

impl CodecError {
    pub fn invalid_value(message: impl Into<String>) -> Self {
        CodecError::InvalidValue {
            message: message.into(),
        }
    }

    pub fn not_permitted(operation: &str, state: impl fmt::Display) -> Self {
        CodecError::OperateNotPermit {
            operation: operation.to_string(),
            state: state.to_string(),
        }
    }

    pub fn no_memory(message: impl Into<String>) -> Self {
        CodecError::NoMemory {
            message: message.into(),
        }
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        CodecError::Unsupported {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        CodecError::Protocol {
            message: message.into(),
        }
    }

    /// Map onto the caller-visible taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            CodecError::InvalidValue { .. } | CodecError::CacheMiss { .. } => {
                ErrorKind::InvalidValue
            }
            CodecError::OperateNotPermit { .. } => ErrorKind::OperateNotPermit,
            CodecError::NoMemory { .. } => ErrorKind::NoMemory,
            CodecError::Io { .. } => ErrorKind::Io,
            CodecError::Timeout(_) => ErrorKind::Timeout,
            CodecError::Unsupported { .. } => ErrorKind::Unsupported,
            CodecError::ServiceDied => ErrorKind::ServiceDied,
            // An unexpected reply shape is reported as Unknown
            CodecError::Protocol { .. } | CodecError::Unknown(_) => ErrorKind::Unknown,
        }
    }

    /// Rebuild an error received as a wire status plus message.
    pub fn from_remote(kind: ErrorKind, message: String) -> Self {
        match kind {
            ErrorKind::InvalidValue => CodecError::InvalidValue { message },
            ErrorKind::OperateNotPermit => CodecError::OperateNotPermit {
                operation: "remote".to_string(),
                state: message,
            },
            ErrorKind::NoMemory => CodecError::NoMemory { message },
            ErrorKind::Io => CodecError::Io {
                message,
                source: None,
            },
            ErrorKind::Timeout => CodecError::Timeout(Duration::ZERO),
            ErrorKind::Unsupported => CodecError::Unsupported { message },
            ErrorKind::ServiceDied => CodecError::ServiceDied,
            ErrorKind::Unknown => CodecError::Unknown(message),
        }
    }

    /// Whether the session behind this error is gone for good.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::ServiceDied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CodecError::not_permitted("start", "Configured");
        assert_eq!(
            err.to_string(),
            "Operation start not permitted in state Configured"
        );
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            CodecError::CacheMiss { index: 3 }.kind(),
            ErrorKind::InvalidValue
        );
        assert_eq!(
            CodecError::protocol("short read").kind(),
            ErrorKind::Unknown
        );
        assert_eq!(CodecError::ServiceDied.kind(), ErrorKind::ServiceDied);
        assert_eq!(
            CodecError::Timeout(Duration::from_secs(3)).kind(),
            ErrorKind::Timeout
        );
    }

    #[test]
    fn test_status_codes() {
        for kind in [
            ErrorKind::InvalidValue,
            ErrorKind::OperateNotPermit,
            ErrorKind::NoMemory,
            ErrorKind::Io,
            ErrorKind::Timeout,
            ErrorKind::Unsupported,
            ErrorKind::ServiceDied,
            ErrorKind::Unknown,
        ] {
            assert_ne!(kind.status_code(), 0);
            assert_eq!(ErrorKind::from_status_code(kind.status_code()), kind);
        }
        assert_eq!(ErrorKind::from_status_code(-42), ErrorKind::Unknown);
    }

    #[test]
    fn test_remote_error_keeps_kind() {
        let err = CodecError::from_remote(ErrorKind::OperateNotPermit, "Running".into());
        assert_eq!(err.kind(), ErrorKind::OperateNotPermit);
        assert!(!err.is_fatal());
        assert!(CodecError::from_remote(ErrorKind::ServiceDied, String::new()).is_fatal());
    }
}
