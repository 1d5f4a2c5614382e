use shared::{
    error::{ApiError, ErrorCode},
    protocol::OutgoingMessage,
};
use thiserror::Error;

use crate::conversation::LocalId;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("rejected by server ({:?}): {}", .0.code, .0.message)]
    Rejected(ApiError),
    #[error("request timed out")]
    Timeout,
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),
}

impl ClientError {
    pub fn validation(message: impl Into<String>) -> Self {
        ClientError::Rejected(ApiError::new(ErrorCode::Validation, message))
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            ClientError::Rejected(err) => err.code,
            ClientError::Timeout | ClientError::TransportUnavailable(_) => {
                ErrorCode::TransportUnavailable
            }
        }
    }

    /// Caller faults are surfaced as-is; everything else may succeed later.
    pub fn is_retryable(&self) -> bool {
        !self.code().is_caller_fault()
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ClientError::Timeout
        } else {
            ClientError::TransportUnavailable(err.to_string())
        }
    }
}

/// A send that did not reach the ledger. `draft` is what the compose field
/// should be restored to.
#[derive(Debug, Clone, Error)]
#[error("message not sent: {source}")]
pub struct SendError {
    pub draft: OutgoingMessage,
    pub local_id: Option<LocalId>,
    #[source]
    pub source: ClientError,
}
