//! Authorization-failure detection
//!
//! Decides which response statuses mean "the access token was rejected".
//! Only those route through the refresh coordinator; every other status is
//! returned to the caller as an ordinary response.

use reqwest::StatusCode;

/// Statuses treated as an authorization failure when none are configured.
pub const DEFAULT_AUTH_FAILURE_STATUSES: &[u16] = &[401];

/// Set of statuses that trigger refresh-and-replay.
#[derive(Debug, Clone)]
pub struct AuthPolicy {
    statuses: Vec<u16>,
}

impl AuthPolicy {
    pub fn new(statuses: impl IntoIterator<Item = u16>) -> Self {
        let mut statuses: Vec<u16> = statuses.into_iter().collect();
        statuses.sort_unstable();
        statuses.dedup();
        Self { statuses }
    }

    pub fn is_auth_failure(&self, status: StatusCode) -> bool {
        self.statuses.contains(&status.as_u16())
    }
}

impl Default for AuthPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_AUTH_FAILURE_STATUSES.iter().copied())
    }
}
