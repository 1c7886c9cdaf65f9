use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Conflict,
    RateLimited,
    Internal,
}

impl ErrorCode {
    /// Whether a client may reasonably retry the same request later.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::RateLimited | Self::Internal)
    }
}

/// Error body sent by the chat backend. It doubles as the error value client
/// code carries through `anyhow`, so callers can downcast to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
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

    pub fn is_transient(&self) -> bool {
        self.code.is_transient()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_wire_body_and_classifies_code() {
        let raw = r#"{"code": "rate_limited", "message": "slow down"}"#;
        let err: ApiError = serde_json::from_str(raw).expect("decode");
        assert_eq!(err, ApiError::new(ErrorCode::RateLimited, "slow down"));
        assert!(err.is_transient());
        assert!(!ApiError::new(ErrorCode::Forbidden, "no").is_transient());
        assert_eq!(err.to_string(), "RateLimited: slow down");
    }
}
