//! Time sources for tracing.
//!
//! Events carry a raw "cycle counter" value. In a hosted process the counter
//! is the number of nanoseconds elapsed since the tracer's epoch, read from
//! the monotonic clock, so its frequency is exactly 1 GHz and it never goes
//! backwards on any thread.
//!
//! Sub-buffer headers record `(cycle count, frequency)` pairs, and the trace
//! header records the start wall-clock time next to the start cycle count, so
//! a reader can turn any event timestamp into wall-clock time offline:
//!
//! ```text
//! wall_ns = start_wall_ns + (tsc - start_tsc) * 1_000_000_000 / start_freq
//! ```

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use conquer_once::spin::OnceCell;

/// Frequency of [`trace_timestamp`] in Hz.
pub const CYCLE_FREQUENCY_HZ: u64 = 1_000_000_000;

/// Reference point for the cycle counter.
static EPOCH: OnceCell<Instant> = OnceCell::uninit();

/// Pin the cycle counter epoch.
///
/// Called while building a registry so the fast path never has to
/// initialize it. Safe to call more than once.
pub fn init() {
    let _ = EPOCH.try_init_once(Instant::now);
}

/// Read the current cycle counter.
///
/// Lock-free and allocation-free once [`init`] has run.
#[inline(always)]
pub fn trace_timestamp() -> u64 {
    let epoch = match EPOCH.try_get() {
        Ok(epoch) => epoch,
        Err(_) => EPOCH.get_or_init(Instant::now),
    };
    epoch.elapsed().as_nanos() as u64
}

/// Frequency of the cycle counter in Hz.
#[inline]
pub fn timestamp_frequency_hz() -> u64 {
    CYCLE_FREQUENCY_HZ
}

/// Convert a cycle counter delta to nanoseconds.
///
/// Uses 128-bit arithmetic to avoid overflow.
#[inline]
pub fn timestamp_to_nanos(delta: u64) -> u64 {
    let freq = timestamp_frequency_hz();
    if freq == 0 {
        return 0;
    }
    ((delta as u128 * 1_000_000_000) / freq as u128) as u64
}

/// Monotonic nanoseconds since the tracer epoch.
#[inline]
pub fn monotonic_nanos() -> u64 {
    timestamp_to_nanos(trace_timestamp())
}

/// Current wall-clock time as `(seconds, microseconds)` since the Unix epoch.
pub fn wall_clock() -> (u64, u64) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(now) => (now.as_secs(), u64::from(now.subsec_micros())),
        Err(_) => (0, 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_monotonic() {
        init();
        let a = trace_timestamp();
        let b = trace_timestamp();
        assert!(b >= a);
    }

    #[test]
    fn test_nanos_conversion() {
        assert_eq!(timestamp_to_nanos(1_500), 1_500);
        assert_eq!(timestamp_frequency_hz(), 1_000_000_000);
    }

    #[test]
    fn test_wall_clock_is_after_2020() {
        let (secs, usecs) = wall_clock();
        assert!(secs > 1_577_836_800);
        assert!(usecs < 1_000_000);
    }
}
