//! Synchronized time
//!
//! Cross-peer scheduling is expressed in nanoseconds on the host's
//! timeline. Each device derives that timeline from its own monotonic
//! clock plus the calibrated offset; the host's offset is zero by
//! definition. Monotonic only — wall-clock adjustments and timezone
//! changes must not move the timeline.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

/// A point on the synchronized (host) timeline, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SyncInstant(i64);

impl SyncInstant {
    pub const fn from_nanos(ns: i64) -> Self {
        Self(ns)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    pub const fn as_millis(self) -> i64 {
        self.0 / 1_000_000
    }

    /// Instant shifted forward by `d`.
    pub fn plus(self, d: Duration) -> Self {
        Self(self.0.saturating_add(d.as_nanos() as i64))
    }

    /// Signed distance from `earlier` to `self` in nanoseconds.
    pub fn nanos_since(self, earlier: SyncInstant) -> i64 {
        self.0 - earlier.0
    }
}

impl std::fmt::Display for SyncInstant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}ms", self.as_millis())
    }
}

/// Monotonic clock plus the calibrated host offset.
///
/// `now()` is meaningful on a peer only after calibration has completed;
/// callers gate cross-peer scheduling on the fan-out coordinator.
#[derive(Debug)]
pub struct SyncClock {
    epoch: Instant,
    offset_ns: AtomicI64,
}

impl SyncClock {
    pub fn new() -> Self {
        Self::with_epoch(Instant::now())
    }

    /// Build a clock whose local timeline starts at `epoch`. Used by tests
    /// to inject a known skew between two in-process clocks.
    pub fn with_epoch(epoch: Instant) -> Self {
        Self {
            epoch,
            offset_ns: AtomicI64::new(0),
        }
    }

    /// Local monotonic time in nanoseconds since the epoch.
    pub fn local_now_ns(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }

    /// Current synchronized time: local time plus the calibrated offset.
    pub fn now(&self) -> SyncInstant {
        SyncInstant(self.local_now_ns() + self.offset_ns())
    }

    pub fn offset_ns(&self) -> i64 {
        self.offset_ns.load(Ordering::Acquire)
    }

    /// Install a new calibrated offset. Host leaves this at zero.
    pub fn set_offset_ns(&self, ns: i64) {
        self.offset_ns.store(ns, Ordering::Release);
    }

    /// Convert a synchronized instant to local nanoseconds.
    pub fn sync_to_local(&self, at: SyncInstant) -> i64 {
        at.as_nanos() - self.offset_ns()
    }

    /// Convert a local nanosecond reading to the synchronized timeline.
    pub fn local_to_sync(&self, local_ns: i64) -> SyncInstant {
        SyncInstant(local_ns + self.offset_ns())
    }

    /// Time remaining until `at`, zero if it is already in the past.
    pub fn until(&self, at: SyncInstant) -> Duration {
        let remaining = at.as_nanos() - self.now().as_nanos();
        if remaining <= 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(remaining as u64)
        }
    }
}

impl Default for SyncClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;

    #[test]
    fn test_host_clock_has_zero_offset() {
        let clock = SyncClock::new();
        assert_eq!(clock.offset_ns(), 0);
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_offset_shifts_timeline() {
        let clock = SyncClock::new();
        let before = clock.now();
        clock.set_offset_ns(500 * MS);
        let after = clock.now();
        // At least the full offset must separate the two readings.
        assert!(after.nanos_since(before) >= 500 * MS);
    }

    #[test]
    fn test_sync_local_conversion() {
        // A peer whose clock reads 50ms behind the host: offset = +50ms.
        let clock = SyncClock::new();
        clock.set_offset_ns(50 * MS);

        // Synchronized instant 1200ms lands at local 1150ms.
        let at = SyncInstant::from_nanos(1200 * MS);
        assert_eq!(clock.sync_to_local(at), 1150 * MS);
        assert_eq!(clock.local_to_sync(1150 * MS), at);
    }

    #[test]
    fn test_until_clamps_past_instants() {
        let clock = SyncClock::new();
        let past = SyncInstant::from_nanos(clock.now().as_nanos() - 1_000 * MS);
        assert_eq!(clock.until(past), Duration::ZERO);

        let future = clock.now().plus(Duration::from_secs(1));
        let remaining = clock.until(future);
        assert!(remaining > Duration::from_millis(900));
        assert!(remaining <= Duration::from_secs(1));
    }

    #[test]
    fn test_plus_and_since() {
        let a = SyncInstant::from_nanos(1_000 * MS);
        let b = a.plus(Duration::from_millis(200));
        assert_eq!(b.as_millis(), 1200);
        assert_eq!(b.nanos_since(a), 200 * MS);
        assert_eq!(a.nanos_since(b), -200 * MS);
    }
}
