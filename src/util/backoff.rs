//! Escalating backoff for polling loops.

use std::hint::spin_loop;
use std::thread;
use std::time::Duration;

/// Spin, then yield, then sleep for increasingly long (capped) periods.
#[derive(Debug, Default)]
pub struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;
    const MAX_SLEEP: Duration = Duration::from_millis(50);

    pub fn new() -> Self {
        Self { step: 0 }
    }

    /// Whether the backoff has reached the sleeping phase.
    pub fn is_completed(&self) -> bool {
        self.step > Self::YIELD_LIMIT
    }

    pub fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            thread::sleep(self.sleep_duration());
        }
        self.step = self.step.saturating_add(1);
    }

    fn sleep_duration(&self) -> Duration {
        let exp = (self.step - Self::YIELD_LIMIT).min(16);
        Duration::from_micros(100u64 << exp).min(Self::MAX_SLEEP)
    }
}
