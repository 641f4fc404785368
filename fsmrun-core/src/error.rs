//! Core error types.

use fsmrun_protocol::{ErrorCode, ProtocolError};
use thiserror::Error;

/// Errors from the automaton engine.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid model: {reason}")]
    InvalidDefinition { reason: String },

    #[error("invalid expression: {reason}")]
    InvalidExpression { reason: String },

    #[error("no input or variable named '{name}'")]
    UnknownName { name: String },

    #[error("'{name}' is not an input")]
    NotAnInput { name: String },

    #[error("machine has not been started")]
    NotStarted,

    #[error("model document error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CoreError {
    pub(crate) fn definition(reason: impl Into<String>) -> Self {
        CoreError::InvalidDefinition {
            reason: reason.into(),
        }
    }

    pub(crate) fn expression(reason: impl Into<String>) -> Self {
        CoreError::InvalidExpression {
            reason: reason.into(),
        }
    }

    /// Returns an error code suitable for protocol `error` events.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            CoreError::InvalidDefinition { .. } => ErrorCode::BadRequest,
            CoreError::InvalidExpression { .. } => ErrorCode::BadRequest,
            CoreError::UnknownName { .. } => ErrorCode::UnknownName,
            CoreError::NotAnInput { .. } => ErrorCode::NotAnInput,
            CoreError::NotStarted => ErrorCode::InternalError,
            CoreError::Protocol(_) => ErrorCode::BadRequest,
            CoreError::Io(_) => ErrorCode::InternalError,
        }
    }
}
