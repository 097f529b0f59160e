//! Session endpoint defaults
//!
//! Paths are relative to the API base URL and can be overridden in config.

/// Exchanges the session cookie for a fresh access token
pub const DEFAULT_REFRESH_PATH: &str = "/auth/refresh";

/// Invalidates the session server-side
pub const DEFAULT_LOGOUT_PATH: &str = "/auth/logout";
