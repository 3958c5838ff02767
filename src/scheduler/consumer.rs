//! Per-priority dispatch state.
//!
//! A consumer owns one [`TaskQueue`] behind its own lock. Its thread is
//! started by the first enqueue into an empty, idle consumer and exits again
//! once the queue has drained, so `is_running` tracks whether there is
//! anything left for it to hand out.
//!
//! At most one task per consumer is between its queue and a worker at any
//! time. Whoever removes a task (the consumer thread, or the other class
//! through [`Consumer::take_overdue`]) holds the dispatch slot until it calls
//! [`Consumer::finish_dispatch`], which keeps dispatches in ready-time order.

use super::priority::TaskQueue;
use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::executor::{Priority, TaskWrapper};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

// cap on one sleep while the head task is not due yet
const READY_WAIT_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct ConsumerState {
    queue: TaskQueue,
    running: bool,
    stopped: bool,
    dispatching: bool,
}

#[derive(Debug)]
pub(crate) struct Consumer {
    priority: Priority,
    state: Mutex<ConsumerState>,
    task_added: Condvar,
}

impl Consumer {
    pub fn new(priority: Priority) -> Self {
        Self {
            priority,
            state: Mutex::new(ConsumerState::default()),
            task_added: Condvar::new(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    pub fn len(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Queues `task` unless `shutdown` is set. When the consumer is idle,
    /// `start` is called under the queue lock to bring its thread up; if that
    /// fails nothing is queued.
    pub fn push<F>(&self, task: TaskWrapper, shutdown: &AtomicBool, start: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let mut state = self.state.lock();
        if shutdown.load(Ordering::Acquire) || state.stopped {
            return Err(Error::illegal_state("scheduler has been shut down"));
        }

        if !state.running {
            start()?;
            state.running = true;
            tracing::debug!(priority = %self.priority, "consumer started");
        }

        state.queue.push(task);
        drop(state);
        self.task_added.notify_one();
        Ok(())
    }

    /// Blocks until the earliest task is due and no other dispatch from this
    /// queue is pending, then removes it and takes the dispatch slot. Returns
    /// `None` once the queue is empty or the consumer was stopped; the
    /// caller's thread is then expected to exit, and the consumer reports not
    /// running.
    pub fn next_ready(&self, clock: &dyn Clock) -> Option<TaskWrapper> {
        let mut state = self.state.lock();
        loop {
            if state.stopped {
                state.running = false;
                return None;
            }

            let run_time = match state.queue.peek_run_time() {
                Some(t) => t,
                None => {
                    state.running = false;
                    tracing::debug!(priority = %self.priority, "consumer idle, parking");
                    return None;
                }
            };

            if state.dispatching {
                self.task_added.wait_for(&mut state, READY_WAIT_SLICE);
                continue;
            }

            let now = clock.now_ms();
            if run_time <= now {
                state.dispatching = true;
                return state.queue.pop();
            }

            let wait = Duration::from_millis(run_time - now).min(READY_WAIT_SLICE);
            self.task_added.wait_for(&mut state, wait);
        }
    }

    /// Removes the head task if it has been ready for longer than `max_wait_ms`
    /// and takes the dispatch slot. Nothing is taken while an earlier task
    /// from this queue is still waiting for a worker.
    pub fn take_overdue(&self, now: u64, max_wait_ms: u64) -> Option<TaskWrapper> {
        let mut state = self.state.lock();
        if state.dispatching {
            return None;
        }
        match state.queue.peek_run_time() {
            Some(run_time) if run_time <= now && now - run_time > max_wait_ms => {
                state.dispatching = true;
                state.queue.pop()
            }
            _ => None,
        }
    }

    /// Releases the dispatch slot taken by `next_ready` or `take_overdue`.
    pub fn finish_dispatch(&self) {
        self.state.lock().dispatching = false;
        self.task_added.notify_all();
    }

    /// Discards all queued tasks and makes the consumer thread exit.
    pub fn stop(&self) -> usize {
        let mut state = self.state.lock();
        state.stopped = true;
        let discarded = state.queue.clear();
        drop(state);
        self.task_added.notify_all();
        discarded
    }
}
