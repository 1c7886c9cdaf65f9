use shared::{domain::MessageId, error::ApiError};
use thiserror::Error;

/// Errors produced by the synchronization core.
///
/// [`SyncError::Transient`] and [`SyncError::Timeout`] surface to the UI as
/// retryable notices and [`SyncError::Rejected`] as a final one. The rest are
/// rejected locally before any network call is made.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("{operation} failed: {message}")]
    Transient {
        operation: MutationOperation,
        message: String,
    },
    #[error("{operation} rejected by the backend: {message}")]
    Rejected {
        operation: MutationOperation,
        message: String,
    },
    #[error("{operation} timed out waiting for the backend")]
    Timeout { operation: MutationOperation },
    #[error("message {0} is not confirmed yet and cannot be edited")]
    EditOfProvisional(MessageId),
    #[error("message {0} is not confirmed yet")]
    NotConfirmed(MessageId),
    #[error("message {0} is not loaded in this conversation")]
    UnknownMessage(MessageId),
    #[error("message {0} belongs to another user")]
    NotMessageOwner(MessageId),
    #[error("selection mode is not active")]
    SelectionInactive,
    #[error("no messages are selected")]
    EmptySelection,
    #[error("mutation {local_id} cannot move from {from} to {to}")]
    InvalidTransition {
        local_id: String,
        from: &'static str,
        to: &'static str,
    },
    #[error("message body must not be empty")]
    EmptyBody,
    #[error("conversation session is closed")]
    SessionClosed,
}

impl SyncError {
    pub fn transient(operation: MutationOperation, err: impl std::fmt::Display) -> Self {
        Self::Transient {
            operation,
            message: err.to_string(),
        }
    }

    /// Classify a failed backend call. A server error with a permanent code
    /// is a rejection; anything else may succeed on retry.
    pub fn from_backend(operation: MutationOperation, err: &anyhow::Error) -> Self {
        match err.downcast_ref::<ApiError>() {
            Some(api) if !api.is_transient() => Self::Rejected {
                operation,
                message: api.message.clone(),
            },
            _ => Self::transient(operation, err),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationOperation {
    Send,
    Edit,
    Delete,
    React,
    Paginate,
}

impl std::fmt::Display for MutationOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Send => "send",
            Self::Edit => "edit",
            Self::Delete => "delete",
            Self::React => "reaction",
            Self::Paginate => "history load",
        };
        f.write_str(name)
    }
}

/// Display-level message handed to the surrounding UI after a transient
/// failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserNotice {
    pub operation: MutationOperation,
    pub message: String,
    pub retryable: bool,
}

impl UserNotice {
    pub fn from_error(err: &SyncError) -> Option<Self> {
        let (operation, retryable) = match err {
            SyncError::Transient { operation, .. } | SyncError::Timeout { operation } => {
                (*operation, true)
            }
            SyncError::Rejected { operation, .. } => (*operation, false),
            _ => return None,
        };
        let message = match operation {
            MutationOperation::Send => "Message could not be sent. Tap to retry.",
            MutationOperation::Edit => "Edit could not be saved. Please try again.",
            MutationOperation::Delete => "Messages could not be deleted. Please try again.",
            MutationOperation::React => "Reaction could not be updated.",
            MutationOperation::Paginate => "Older messages could not be loaded.",
        };
        Some(Self {
            operation,
            message: message.to_string(),
            retryable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_network_failures_become_notices() {
        let timeout = SyncError::Timeout {
            operation: MutationOperation::Send,
        };
        let notice = UserNotice::from_error(&timeout).expect("notice");
        assert!(notice.retryable);
        assert_eq!(notice.operation, MutationOperation::Send);

        let local = SyncError::EditOfProvisional(MessageId::provisional(1));
        assert!(UserNotice::from_error(&local).is_none());
        assert!(!local.is_retryable());
    }

    #[test]
    fn transient_error_keeps_backend_message() {
        let err = SyncError::transient(MutationOperation::Delete, "503 service unavailable");
        assert_eq!(
            err.to_string(),
            "delete failed: 503 service unavailable"
        );
        assert!(err.is_retryable());
    }

    #[test]
    fn permanent_api_errors_become_final_rejections() {
        let forbidden = anyhow::Error::from(ApiError::new(
            shared::error::ErrorCode::Forbidden,
            "not your message",
        ));
        let err = SyncError::from_backend(MutationOperation::Edit, &forbidden);
        assert_eq!(
            err,
            SyncError::Rejected {
                operation: MutationOperation::Edit,
                message: "not your message".into(),
            }
        );
        assert!(!err.is_retryable());
        let notice = UserNotice::from_error(&err).expect("notice");
        assert!(!notice.retryable);

        let throttled = anyhow::Error::from(ApiError::new(
            shared::error::ErrorCode::RateLimited,
            "slow down",
        ));
        assert!(SyncError::from_backend(MutationOperation::Send, &throttled).is_retryable());
        let plain = anyhow::anyhow!("connection reset");
        assert!(SyncError::from_backend(MutationOperation::Send, &plain).is_retryable());
    }
}
