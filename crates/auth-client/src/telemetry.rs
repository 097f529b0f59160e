//! Refresh and replay counters
//!
//! - `auth_refresh_total` (counter): label `outcome` = success | failure | cancelled
//! - `auth_retries_total` (counter): label `result` = success | rejected | error

pub(crate) fn record_refresh(outcome: &'static str) {
    metrics::counter!("auth_refresh_total", "outcome" => outcome).increment(1);
}

pub(crate) fn record_retry(result: &'static str) {
    metrics::counter!("auth_retries_total", "result" => result).increment(1);
}
