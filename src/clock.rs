//! Time sources used for ready-time and idle-expiration decisions.
//!
//! The scheduler only ever asks a [`Clock`] for the current time in
//! milliseconds and whether that time has moved past a previous sample.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Monotonic millisecond time source.
pub trait Clock: Send + Sync + Debug {
    /// Milliseconds on this clock's timeline.
    fn now_ms(&self) -> u64;

    /// Whether the clock has moved strictly past `since_ms`.
    fn has_advanced_since(&self, since_ms: u64) -> bool {
        self.now_ms() > since_ms
    }
}

/// Wall clock backed by [`Instant`], anchored at construction.
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(ms: u64) -> Self {
        Self {
            now: AtomicU64::new(ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(duration_to_ms(by), Ordering::AcqRel);
    }

    /// Moves the clock to `ms`. Earlier values are ignored, the clock never runs backwards.
    pub fn set(&self, ms: u64) {
        self.now.fetch_max(ms, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Acquire)
    }
}

pub(crate) fn duration_to_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock::new();
        let start = clock.now_ms();
        std::thread::sleep(Duration::from_millis(5));
        assert!(clock.has_advanced_since(start));
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        assert_eq!(clock.now_ms(), 0);
        assert!(!clock.has_advanced_since(0));

        clock.advance(Duration::from_millis(10));
        assert_eq!(clock.now_ms(), 10);
        assert!(clock.has_advanced_since(0));

        clock.set(5);
        assert_eq!(clock.now_ms(), 10);

        clock.set(50);
        assert_eq!(clock.now_ms(), 50);
    }

    #[test]
    fn test_duration_to_ms_saturates() {
        assert_eq!(duration_to_ms(Duration::MAX), u64::MAX);
        assert_eq!(duration_to_ms(Duration::from_millis(42)), 42);
    }
}
