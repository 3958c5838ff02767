//! Helpers shared by the integration tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use priosched::Clock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(10);

/// Polls `condition` until it holds or `timeout` passes.
pub fn block_until<F>(timeout: Duration, condition: F) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
    true
}

/// Returns once `clock` reads later than it did on entry.
pub fn block_till_clock_advances(clock: &dyn Clock) -> u64 {
    let start = clock.now_ms();
    while !clock.has_advanced_since(start) {
        thread::sleep(Duration::from_millis(1));
    }
    clock.now_ms()
}

/// Records every run of a task: when it started and when it finished.
#[derive(Debug, Default)]
pub struct TestRunnable {
    runs: AtomicUsize,
    starts: Mutex<Vec<Instant>>,
    ends: Mutex<Vec<Instant>>,
    run_duration: Duration,
}

impl TestRunnable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_run_duration(run_duration: Duration) -> Arc<Self> {
        Arc::new(Self {
            run_duration,
            ..Self::default()
        })
    }

    pub fn run(&self) {
        self.starts.lock().push(Instant::now());
        if !self.run_duration.is_zero() {
            thread::sleep(self.run_duration);
        }
        self.ends.lock().push(Instant::now());
        self.runs.fetch_add(1, Ordering::SeqCst);
    }

    /// A closure suitable for one-time or recurring submission.
    pub fn task(self: &Arc<Self>) -> impl FnMut() + Send + 'static {
        let this = Arc::clone(self);
        move || this.run()
    }

    pub fn run_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn block_till_run(&self) -> bool {
        self.block_till_runs(1)
    }

    pub fn block_till_runs(&self, n: usize) -> bool {
        block_until(WAIT, || self.run_count() >= n)
    }

    pub fn starts(&self) -> Vec<Instant> {
        self.starts.lock().clone()
    }

    pub fn ends(&self) -> Vec<Instant> {
        self.ends.lock().clone()
    }
}
