//! Containment of panics raised by scheduled work.
//!
//! A task that panics must never take its worker or a consumer down with it.
//! The handler catches the unwind, counts it, and then applies the configured
//! [`PanicStrategy`].

use super::task::Priority;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

/// What the scheduler does after a task panics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PanicStrategy {
    /// Abort the process.
    Abort,
    /// Count the panic without logging it.
    Isolate,
    /// Count the panic and log a warning.
    #[default]
    LogAndContinue,
}

/// A panic caught while running one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPanic {
    pub priority: Priority,
    pub message: String,
}

#[derive(Debug)]
pub struct PanicHandler {
    strategy: PanicStrategy,
    panics: AtomicU64,
}

impl PanicHandler {
    pub fn new(strategy: PanicStrategy) -> Self {
        Self {
            strategy,
            panics: AtomicU64::new(0),
        }
    }

    pub fn strategy(&self) -> PanicStrategy {
        self.strategy
    }

    /// Number of task runs that ended in a panic.
    pub fn panic_count(&self) -> u64 {
        self.panics.load(Ordering::Relaxed)
    }

    /// Runs the work of one `priority` task, catching any panic.
    pub fn run<F>(&self, priority: Priority, work: F) -> Result<(), TaskPanic>
    where
        F: FnOnce(),
    {
        let payload = match catch_unwind(AssertUnwindSafe(work)) {
            Ok(()) => return Ok(()),
            Err(payload) => payload,
        };

        self.panics.fetch_add(1, Ordering::Relaxed);
        let panic = TaskPanic {
            priority,
            message: panic_message(payload.as_ref()),
        };

        match self.strategy {
            PanicStrategy::Abort => {
                tracing::error!(%priority, message = %panic.message, "task panicked, aborting process");
                std::process::abort();
            }
            PanicStrategy::Isolate => {}
            PanicStrategy::LogAndContinue => {
                tracing::warn!(%priority, message = %panic.message, "task panicked");
            }
        }

        Err(panic)
    }
}

impl Default for PanicHandler {
    fn default() -> Self {
        Self::new(PanicStrategy::default())
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
