//! Lease arithmetic for tunnel lifetimes.
//!
//! A start directive carries the lifetime its author intended (`tunnel_lifetime`
//! minutes) plus the epoch timestamp at which it was authored. Delivery over the
//! state store can lag, so the agent shortens the lease by the delivery delay:
//! a tunnel requested for 60 minutes two minutes ago gets a 58-minute lease.
//!
//! All functions here are pure; the caller supplies `now` so tests can use
//! synthetic clocks.

use std::time::{SystemTime, UNIX_EPOCH};

/// Floor applied to adjusted lifetimes.
///
/// A directive that is already past its lifetime at receipt is actioned as a
/// one-minute lease rather than a stale multi-hour one. The supervision loop
/// treats anything under one remaining minute as expired, so this floor gives
/// such a tunnel exactly one supervision window to be useful before it is
/// killed.
pub const MIN_LEASE_MINUTES: f64 = 1.0;

/// Current wall-clock time as epoch seconds.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_now() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(_) => 0,
    }
}

/// Shorten an authored lifetime by the delivery delay.
///
/// `adjusted = lifetime − (now − desired_timestamp)/60`. The result can be
/// negative; callers that act on it must pass it through [`clamp`] first.
#[allow(clippy::cast_precision_loss)]
pub fn adjust(lifetime_minutes: f64, desired_timestamp: i64, now: i64) -> f64 {
    let delay_secs = now - desired_timestamp;
    lifetime_minutes - delay_secs as f64 / 60.0
}

/// Clamp an adjusted lifetime to [`MIN_LEASE_MINUTES`].
pub fn clamp(adjusted_minutes: f64) -> f64 {
    if adjusted_minutes < MIN_LEASE_MINUTES {
        MIN_LEASE_MINUTES
    } else {
        adjusted_minutes
    }
}

/// Absolute lease boundary for a tunnel started at `now` with the given
/// lifetime, as epoch seconds.
#[allow(clippy::cast_possible_truncation)]
pub fn expire_at(now: i64, lifetime_minutes: f64) -> i64 {
    now + (lifetime_minutes * 60.0).round() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adjust_subtracts_delivery_delay() {
        let t0 = 1_700_000_000;
        assert!((adjust(60.0, t0, t0 + 120) - 58.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_adjust_zero_delay() {
        let t0 = 1_700_000_000;
        assert!((adjust(30.0, t0, t0) - 30.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_adjust_is_idempotent() {
        let t0 = 1_700_000_000;
        let a = adjust(45.0, t0, t0 + 90);
        let b = adjust(45.0, t0, t0 + 90);
        assert!((a - b).abs() < f64::EPSILON);
    }

    #[test]
    fn test_adjust_can_go_negative() {
        let t0 = 1_700_000_000;
        // Authored two hours ago with a one-hour lifetime.
        let adjusted = adjust(60.0, t0, t0 + 7200);
        assert!(adjusted < 0.0);
    }

    #[test]
    fn test_clamp_floors_expired_directives() {
        assert!((clamp(-60.0) - MIN_LEASE_MINUTES).abs() < f64::EPSILON);
        assert!((clamp(0.0) - MIN_LEASE_MINUTES).abs() < f64::EPSILON);
        assert!((clamp(0.5) - MIN_LEASE_MINUTES).abs() < f64::EPSILON);
    }

    #[test]
    fn test_clamp_passes_valid_lifetimes() {
        assert!((clamp(58.0) - 58.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_expire_at() {
        let now = 1_700_000_000;
        assert_eq!(expire_at(now, 58.0), now + 3480);
        assert_eq!(expire_at(now, 1.0), now + 60);
    }
}
