//! Authenticated HTTP client with single-flight token refresh
//!
//! Request lifecycle:
//! 1. `AuthClient::send` attaches the current access token and dispatches
//! 2. An authorization failure (per `AuthPolicy`) parks the request on the
//!    `RefreshCoordinator`; the first caller runs the refresh, later callers
//!    queue behind it
//! 3. On success every parked request is replayed once with the new token
//! 4. On failure every parked request fails with `RefreshFailed`, the token
//!    is cleared and the server-side session is logged out once
//! 5. A replay that is rejected again fails with `RetryExhausted`

pub mod client;
pub mod coordinator;
pub mod error;
pub mod policy;
mod telemetry;

#[cfg(test)]
mod testing;

pub use client::{AuthClient, ClientConfig};
pub use coordinator::{RefreshCoordinator, RefreshOutcome, RefreshState};
pub use error::{ClientError, Result};
pub use policy::{AuthPolicy, DEFAULT_AUTH_FAILURE_STATUSES};
