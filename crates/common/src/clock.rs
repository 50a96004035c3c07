//! # Clock
//!
//! Every timestamp in the runtime — entity edit times, ownership expiries,
//! deletion records, challenge deadlines — is a `u64` count of microseconds
//! since the Unix epoch. Call sites that need determinism (tests, replays)
//! thread an explicit `now` value instead of reading the clock themselves.

use std::time::{SystemTime, UNIX_EPOCH};

pub const USECS_PER_MSEC: u64 = 1_000;
pub const USECS_PER_SECOND: u64 = 1_000_000;

/// Current wall-clock time in microseconds since the Unix epoch.
pub fn now_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Convert fractional seconds to microseconds, saturating at zero.
pub fn secs_to_usec(secs: f32) -> u64 {
    if secs <= 0.0 {
        0
    } else {
        (secs as f64 * USECS_PER_SECOND as f64) as u64
    }
}

/// Convert microseconds to fractional seconds.
pub fn usec_to_secs(usec: u64) -> f32 {
    (usec as f64 / USECS_PER_SECOND as f64) as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conversions() {
        assert_eq!(secs_to_usec(1.0), USECS_PER_SECOND);
        assert_eq!(secs_to_usec(0.5), 500_000);
        assert_eq!(secs_to_usec(-2.0), 0);
        assert!((usec_to_secs(1_500_000) - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_now_is_monotonic_enough() {
        let a = now_usec();
        let b = now_usec();
        assert!(b >= a);
    }
}
