//! Error types for session operations

/// Errors from the refresh/logout endpoints.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token refresh failed: {0}")]
    TokenExchange(String),

    #[error("session rejected: {0}")]
    InvalidSession(String),

    #[error("logout failed: {0}")]
    Logout(String),

    #[error("invalid session configuration: {0}")]
    Config(String),
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;
