//! Session credentials for the rules API
//!
//! Holds the short-lived access token in memory and wraps the two session
//! endpoints the authenticated client depends on:
//! 1. `refresh` exchanges the long-lived session cookie for a new access token
//! 2. `logout` invalidates the session server-side
//!
//! The cookie itself never passes through this crate's public API; it lives
//! in the reqwest cookie jar owned by `HttpSessionApi`.

pub mod constants;
pub mod credentials;
pub mod error;
pub mod session;

pub use constants::*;
pub use credentials::{AccessToken, CredentialStore};
pub use error::{Error, Result};
pub use session::{HttpSessionApi, SessionApi};
