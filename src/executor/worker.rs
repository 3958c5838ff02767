// worker thread stuff
use super::task::Job;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

pub type WorkerId = usize;

// upper bound on one idle wait, so a stop request is seen even if a wakeup is lost
const IDLE_WAIT_SLICE: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Terminated,
}

struct Slot {
    state: WorkerState,
    job: Option<Job>,
}

struct WorkerInner {
    id: WorkerId,
    slot: Mutex<Slot>,
    assigned: Condvar,
    idle_since_ms: AtomicU64,
}

/// Handle to one pool thread. Clones refer to the same thread.
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl Worker {
    /// Starts the thread. `on_done` is invoked from the worker thread after each job.
    pub(crate) fn spawn<F>(id: WorkerId, builder: thread::Builder, on_done: F) -> Result<Worker>
    where
        F: Fn(Worker) + Send + 'static,
    {
        let worker = Worker {
            inner: Arc::new(WorkerInner {
                id,
                slot: Mutex::new(Slot {
                    state: WorkerState::Idle,
                    job: None,
                }),
                assigned: Condvar::new(),
                idle_since_ms: AtomicU64::new(0),
            }),
        };

        let thread_worker = worker.clone();
        builder
            .spawn(move || thread_worker.run(on_done))
            .map_err(|e| Error::spawn(format!("worker {}: {}", id, e)))?;

        Ok(worker)
    }

    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    pub fn state(&self) -> WorkerState {
        self.inner.slot.lock().state
    }

    pub(crate) fn idle_since_ms(&self) -> u64 {
        self.inner.idle_since_ms.load(Ordering::Acquire)
    }

    pub(crate) fn mark_idle(&self, now_ms: u64) {
        self.inner.idle_since_ms.store(now_ms, Ordering::Release);
    }

    /// Hands a job to an idle worker. The job is given back if the worker
    /// cannot take it.
    pub(crate) fn next_task(&self, job: Job) -> std::result::Result<(), Job> {
        let mut slot = self.inner.slot.lock();
        if slot.state != WorkerState::Idle || slot.job.is_some() {
            return Err(job);
        }
        slot.job = Some(job);
        slot.state = WorkerState::Running;
        drop(slot);
        self.inner.assigned.notify_one();
        Ok(())
    }

    /// Asks the thread to exit once it is not running anything.
    pub(crate) fn stop(&self) {
        let mut slot = self.inner.slot.lock();
        slot.state = WorkerState::Terminated;
        drop(slot);
        self.inner.assigned.notify_one();
    }

    // main loop
    fn run<F>(self, on_done: F)
    where
        F: Fn(Worker),
    {
        tracing::debug!(worker = self.id(), "worker started");

        while let Some(job) = self.wait_for_job() {
            if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job)) {
                let message = super::panic_handler::panic_message(payload.as_ref());
                tracing::warn!(worker = self.id(), %message, "job escaped its handler");
            }

            {
                let mut slot = self.inner.slot.lock();
                if slot.state == WorkerState::Running {
                    slot.state = WorkerState::Idle;
                }
            }
            on_done(self.clone());
        }

        tracing::debug!(worker = self.id(), "worker exited");
    }

    fn wait_for_job(&self) -> Option<Job> {
        let mut slot = self.inner.slot.lock();
        loop {
            if let Some(job) = slot.job.take() {
                return Some(job);
            }
            if slot.state == WorkerState::Terminated {
                return None;
            }
            self.inner.assigned.wait_for(&mut slot, IDLE_WAIT_SLICE);
        }
    }
}

impl PartialEq for Worker {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Worker {}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id())
            .field("state", &self.state())
            .field("idle_since_ms", &self.idle_since_ms())
            .finish()
    }
}
