//! Server error types.

use crate::config::ConfigError;
use fsmrun_protocol::ErrorCode;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] fsmrun_protocol::ProtocolError),

    #[error("core error: {0}")]
    Core(#[from] fsmrun_core::CoreError),

    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("server is already running")]
    AlreadyRunning,
}

impl ServerError {
    /// Converts to protocol error code.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ServerError::Io(_) => ErrorCode::InternalError,
            ServerError::Protocol(e) => e.error_code(),
            ServerError::Core(e) => e.error_code(),
            ServerError::Config(_) => ErrorCode::InternalError,
            ServerError::AlreadyRunning => ErrorCode::InternalError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsmrun_core::CoreError;
    use fsmrun_protocol::ProtocolError;

    #[test]
    fn test_error_codes() {
        let err: ServerError = CoreError::UnknownName {
            name: "x".to_string(),
        }
        .into();
        assert_eq!(err.error_code(), ErrorCode::UnknownName);

        let err: ServerError = ProtocolError::UnknownCommand("bogus".to_string()).into();
        assert_eq!(err.error_code(), ErrorCode::UnknownCommand);

        assert_eq!(ServerError::AlreadyRunning.error_code(), ErrorCode::InternalError);
    }
}
