//! Error taxonomy for authenticated requests

use reqwest::StatusCode;
use transport::TransportError;

/// Errors returned by `AuthClient::send`.
///
/// Only `AuthExpired` is ever intercepted and retried, and only inside the
/// client; every other variant reaches the caller unchanged.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// First attempt rejected for authorization. Triggers refresh-and-replay.
    #[error("authorization expired ({status})")]
    AuthExpired { status: StatusCode },

    /// The refresh exchange itself failed. The session has been torn down.
    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// Rejected again after one replay with a fresh token.
    #[error("authorization rejected after retry ({status})")]
    RetryExhausted { status: StatusCode },

    /// The session was logged out while this request waited on a refresh.
    #[error("request cancelled: session logged out")]
    Cancelled,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ClientError {
    /// Short label for metrics and error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::AuthExpired { .. } => "auth_expired",
            ClientError::RefreshFailed(_) => "refresh_failed",
            ClientError::RetryExhausted { .. } => "retry_exhausted",
            ClientError::Cancelled => "cancelled",
            ClientError::Transport(e) => e.kind(),
        }
    }

    /// Whether the caller can no longer be authenticated and should send
    /// the user back through login.
    pub fn is_session_lost(&self) -> bool {
        matches!(
            self,
            ClientError::RefreshFailed(_)
                | ClientError::RetryExhausted { .. }
                | ClientError::Cancelled
        )
    }
}

/// Result alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;
