//! Per-node retry backoff.
//!
//! After a failed update the node's next attempt is pushed out by an
//! exponential delay derived from its configured update interval. The base
//! step is chosen so that roughly six doublings land back at the full
//! interval, and the delay is capped there so a flaky node is never polled
//! less often than a healthy one would be.

/// Exponential backoff delay in seconds for a node with `failures`
/// consecutive failures.
///
/// `base = max(1, interval / 62)`, `delay = min(base * 2^failures, interval)`.
pub fn delay_for(update_interval_secs: u64, failures: u32) -> u64 {
    let base = (update_interval_secs / 62).max(1);
    let factor = 1u64.checked_shl(failures).unwrap_or(u64::MAX);
    base.saturating_mul(factor).min(update_interval_secs)
}
