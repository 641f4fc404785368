//! Protocol error types and error codes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Protocol-level errors that can occur while framing or interpreting messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed XML: {0}")]
    MalformedXml(String),

    #[error("unexpected root element: expected <{expected}>, got <{actual}>")]
    UnexpectedRoot {
        expected: &'static str,
        actual: String,
    },

    #[error("missing attribute '{attr}' on <{element}>")]
    MissingAttribute { element: String, attr: &'static str },

    #[error("missing element <{0}>")]
    MissingElement(&'static str),

    #[error("invalid value for {field}: '{value}'")]
    InvalidValue { field: &'static str, value: String },

    #[error("unknown command type: {0}")]
    UnknownCommand(String),

    #[error("unknown event type: {0}")]
    UnknownEvent(String),

    #[error("line too long: {len} bytes (max {max})")]
    LineTooLong { len: usize, max: usize },

    #[error("invalid UTF-8 in line")]
    InvalidUtf8,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns true when the input was not a well-formed XML document at all.
    ///
    /// Such lines are discarded by the server without a reply.
    pub fn is_malformed(&self) -> bool {
        matches!(self, ProtocolError::MalformedXml(_))
    }

    /// Returns the error code reported to the peer for this error.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ProtocolError::UnknownCommand(_) => ErrorCode::UnknownCommand,
            ProtocolError::LineTooLong { .. } => ErrorCode::LineTooLong,
            ProtocolError::Io(_) => ErrorCode::InternalError,
            _ => ErrorCode::BadRequest,
        }
    }
}

/// Stable error codes carried in `error` events.
///
/// These codes are part of the protocol contract and must remain stable
/// across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Request errors
    BadRequest,
    UnknownCommand,
    LineTooLong,

    // Session errors
    UnknownName,
    NotAnInput,

    // System errors
    InternalError,
}

impl ErrorCode {
    /// Returns the wire representation of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadRequest => "BAD_REQUEST",
            ErrorCode::UnknownCommand => "UNKNOWN_COMMAND",
            ErrorCode::LineTooLong => "LINE_TOO_LONG",
            ErrorCode::UnknownName => "UNKNOWN_NAME",
            ErrorCode::NotAnInput => "NOT_AN_INPUT",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorCode {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BAD_REQUEST" => Ok(ErrorCode::BadRequest),
            "UNKNOWN_COMMAND" => Ok(ErrorCode::UnknownCommand),
            "LINE_TOO_LONG" => Ok(ErrorCode::LineTooLong),
            "UNKNOWN_NAME" => Ok(ErrorCode::UnknownName),
            "NOT_AN_INPUT" => Ok(ErrorCode::NotAnInput),
            "INTERNAL_ERROR" => Ok(ErrorCode::InternalError),
            other => Err(ProtocolError::InvalidValue {
                field: "code",
                value: other.to_string(),
            }),
        }
    }
}
