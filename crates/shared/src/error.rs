use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Validation,
    Forbidden,
    NotFound,
    NotReceiver,
    NotSender,
    AlreadyRetracted,
    TransportUnavailable,
    PersistenceFailure,
    Internal,
}

impl ErrorCode {
    /// Authorization and validation faults are surfaced, never retried.
    pub fn is_caller_fault(&self) -> bool {
        matches!(
            self,
            ErrorCode::Validation
                | ErrorCode::Forbidden
                | ErrorCode::NotFound
                | ErrorCode::NotReceiver
                | ErrorCode::NotSender
                | ErrorCode::AlreadyRetracted
        )
    }
}

/// Error body returned by every endpoint and carried in `error` events.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code:?}: {message}")]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}
