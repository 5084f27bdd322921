//! Monotonic clock helpers
//!
//! The timer manager works in raw monotonic milliseconds rather than
//! `Instant` so that a backward jump (host clock rollover) is observable
//! and can be handled by bulk expiry.

/// Current monotonic time in milliseconds
#[inline]
pub fn now_ms() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // CLOCK_MONOTONIC_RAW is immune to NTP slew
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC_RAW, &mut ts) };
    debug_assert_eq!(rc, 0);
    ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000
}
