use super::worker::{Worker, WorkerId, WorkerState};
use crate::clock::{duration_to_ms, Clock};
use crate::config::{validate_pool_sizes, SchedulerConfig};
use crate::error::{Error, Result};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

// longest single wait for a worker before re-checking pool state
const DISPATCH_WAIT_SLICE: Duration = Duration::from_millis(50);

/// How a dispatcher wants to obtain a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquire {
    /// Reuse an idle worker, otherwise grow the pool right away. Yields idle
    /// workers to overdue low-priority dispatches.
    High,
    /// Once the pool is at core size, wait up to `existing_wait` for an idle
    /// worker before growing. Past that the dispatch counts as overdue.
    Low { existing_wait: Duration },
}

pub(crate) struct PoolState {
    core_pool_size: usize,
    max_pool_size: usize,
    keep_alive: Duration,
    allow_core_thread_timeout: bool,
    current_pool_size: usize,
    // most recently idled at the front, oldest at the back
    available: VecDeque<Worker>,
    shutdown: bool,
    halted: bool,
    overdue_low_waiters: usize,
}

struct PoolShared {
    state: Mutex<PoolState>,
    worker_available: Condvar,
    clock: Arc<dyn Clock>,
    next_id: AtomicUsize,
    thread_name_prefix: String,
    stack_size: Option<usize>,
    workers_created: AtomicU64,
    workers_expired: AtomicU64,
}

/// Tracks live and idle workers and decides when to create, reuse or retire them.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(config: &SchedulerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        validate_pool_sizes(config.core_pool_size, config.max_pool_size)?;

        Ok(Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    core_pool_size: config.core_pool_size,
                    max_pool_size: config.max_pool_size,
                    keep_alive: config.keep_alive,
                    allow_core_thread_timeout: config.allow_core_thread_timeout,
                    current_pool_size: 0,
                    available: VecDeque::new(),
                    shutdown: false,
                    halted: false,
                    overdue_low_waiters: 0,
                }),
                worker_available: Condvar::new(),
                clock,
                next_id: AtomicUsize::new(0),
                thread_name_prefix: config.thread_name_prefix.clone(),
                stack_size: config.stack_size,
                workers_created: AtomicU64::new(0),
                workers_expired: AtomicU64::new(0),
            }),
        })
    }

    /// Starts a new worker and counts it as live. The worker is handed to the
    /// caller, not placed in the idle set.
    pub(crate) fn make_new_worker(&self, state: &mut PoolState) -> Result<Worker> {
        let id: WorkerId = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-worker-{}", self.shared.thread_name_prefix, id);

        let mut builder = thread::Builder::new().name(name);
        if let Some(stack_size) = self.shared.stack_size {
            builder = builder.stack_size(stack_size);
        }

        let pool: Weak<PoolShared> = Arc::downgrade(&self.shared);
        let worker = Worker::spawn(id, builder, move |worker| match pool.upgrade() {
            Some(shared) => WorkerPool { shared }.worker_done(worker),
            None => worker.stop(),
        })?;

        state.current_pool_size += 1;
        self.shared.workers_created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            worker = id,
            pool_size = state.current_pool_size,
            "created worker"
        );

        Ok(worker)
    }

    /// Takes an idle worker, waiting up to `timeout` for one to be returned.
    /// `None` means nothing became available in time, the pool dropped below
    /// core size (so the caller may grow it instead), or the pool was halted.
    pub(crate) fn get_existing_worker(
        &self,
        state: &mut MutexGuard<'_, PoolState>,
        timeout: Duration,
    ) -> Option<Worker> {
        let deadline = deadline_after(timeout);
        loop {
            if state.halted {
                return None;
            }
            if let Some(worker) = state.available.pop_front() {
                return Some(worker);
            }
            if state.current_pool_size < state.core_pool_size {
                return None;
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            self.shared
                .worker_available
                .wait_for(state, (deadline - now).min(DISPATCH_WAIT_SLICE));
        }
    }

    /// Obtains a worker for one dispatch. Blocks in bounded slices while the
    /// pool is at capacity; returns `None` only once the pool is halted.
    pub(crate) fn acquire_worker(&self, request: Acquire) -> Result<Option<Worker>> {
        let mut state = self.shared.state.lock();

        if let Acquire::Low { existing_wait } = request {
            if !existing_wait.is_zero() && state.current_pool_size >= state.core_pool_size {
                if let Some(worker) = self.get_existing_worker(&mut state, existing_wait) {
                    return Ok(Some(worker));
                }
            }
        }

        let yields = request == Acquire::High;
        let mut overdue = false;
        let result = loop {
            if state.halted {
                break Ok(None);
            }
            if !yields || state.overdue_low_waiters == 0 {
                if let Some(worker) = state.available.pop_front() {
                    break Ok(Some(worker));
                }
                if state.current_pool_size < state.max_pool_size {
                    break self.make_new_worker(&mut state).map(Some);
                }
            }
            if !yields && !overdue {
                state.overdue_low_waiters += 1;
                overdue = true;
            }
            self.shared
                .worker_available
                .wait_for(&mut state, DISPATCH_WAIT_SLICE);
        };

        if overdue {
            state.overdue_low_waiters -= 1;
            drop(state);
            self.shared.worker_available.notify_all();
        }

        result
    }

    /// Returns a worker that finished its job to the idle set, or retires it
    /// when the pool is over capacity or shutting down.
    pub(crate) fn worker_done(&self, worker: Worker) {
        let mut state = self.shared.state.lock();
        // sampled under the lock so the idle set stays ordered by idle time
        let now = self.shared.clock.now_ms();

        if state.shutdown
            || state.current_pool_size > state.max_pool_size
            || worker.state() == WorkerState::Terminated
        {
            state.current_pool_size = state.current_pool_size.saturating_sub(1);
            let pool_size = state.current_pool_size;
            drop(state);

            worker.stop();
            tracing::debug!(worker = worker.id(), pool_size, "retired worker");
        } else {
            worker.mark_idle(now);
            state.available.push_front(worker);
            drop(state);
        }

        self.shared.worker_available.notify_all();
    }

    /// Retires workers that have been idle longer than the keep-alive time,
    /// oldest first, never going below core size unless core timeout is on.
    /// Idle workers above the max size are retired regardless of age.
    pub fn look_for_expired_workers(&self) -> usize {
        let now = self.shared.clock.now_ms();
        let mut expired = Vec::new();

        {
            let mut state = self.shared.state.lock();
            let keep_alive_ms = duration_to_ms(state.keep_alive);

            while state.current_pool_size > state.core_pool_size || state.allow_core_thread_timeout
            {
                let idle_for = match state.available.back() {
                    Some(oldest) => now.saturating_sub(oldest.idle_since_ms()),
                    None => break,
                };
                if idle_for <= keep_alive_ms && state.current_pool_size <= state.max_pool_size {
                    break;
                }
                match state.available.pop_back() {
                    Some(worker) => {
                        state.current_pool_size -= 1;
                        expired.push(worker);
                    }
                    None => break,
                }
            }
        }

        for worker in &expired {
            worker.stop();
            tracing::debug!(worker = worker.id(), "expired idle worker");
        }
        self.shared
            .workers_expired
            .fetch_add(expired.len() as u64, Ordering::Relaxed);

        expired.len()
    }

    pub fn set_core_pool_size(&self, n: usize) -> Result<()> {
        let mut state = self.shared.state.lock();
        if n > state.max_pool_size {
            return Err(Error::invalid_argument(format!(
                "core_pool_size ({}) must not exceed max_pool_size ({})",
                n, state.max_pool_size
            )));
        }
        state.core_pool_size = n;
        Ok(())
    }

    pub fn set_max_pool_size(&self, n: usize) -> Result<()> {
        {
            let mut state = self.shared.state.lock();
            validate_pool_sizes(state.core_pool_size, n)?;
            state.max_pool_size = n;
        }
        // room to grow for blocked dispatchers, or idle workers to reclaim
        self.shared.worker_available.notify_all();
        self.look_for_expired_workers();
        Ok(())
    }

    pub fn set_keep_alive(&self, keep_alive: Duration) {
        self.shared.state.lock().keep_alive = keep_alive;
    }

    pub fn allow_core_thread_timeout(&self, allow: bool) {
        self.shared.state.lock().allow_core_thread_timeout = allow;
    }

    pub fn core_pool_size(&self) -> usize {
        self.shared.state.lock().core_pool_size
    }

    pub fn max_pool_size(&self) -> usize {
        self.shared.state.lock().max_pool_size
    }

    pub fn keep_alive(&self) -> Duration {
        self.shared.state.lock().keep_alive
    }

    pub fn is_core_thread_timeout_allowed(&self) -> bool {
        self.shared.state.lock().allow_core_thread_timeout
    }

    pub fn current_pool_size(&self) -> usize {
        self.shared.state.lock().current_pool_size
    }

    pub fn idle_worker_count(&self) -> usize {
        self.shared.state.lock().available.len()
    }

    pub fn workers_created(&self) -> u64 {
        self.shared.workers_created.load(Ordering::Relaxed)
    }

    pub fn workers_expired(&self) -> u64 {
        self.shared.workers_expired.load(Ordering::Relaxed)
    }

    /// Retires every idle worker; busy ones are retired when they finish.
    pub(crate) fn shutdown(&self) {
        let idle: Vec<Worker> = {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            let idle: Vec<Worker> = state.available.drain(..).collect();
            state.current_pool_size -= idle.len();
            idle
        };

        for worker in &idle {
            worker.stop();
        }
        self.shared.worker_available.notify_all();
    }

    /// Shutdown that also makes every pending acquire give up.
    pub(crate) fn halt(&self) {
        self.shared.state.lock().halted = true;
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WorkerPool")
            .field("core_pool_size", &state.core_pool_size)
            .field("max_pool_size", &state.max_pool_size)
            .field("keep_alive", &state.keep_alive)
            .field("current_pool_size", &state.current_pool_size)
            .field("idle", &state.available.len())
            .finish()
    }
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    // far enough out to behave as "forever" without overflowing Instant
    now.checked_add(timeout)
        .unwrap_or_else(|| now + Duration::from_secs(60 * 60 * 24 * 365))
}

/// Background thread that periodically sweeps the pool for expired workers.
#[derive(Debug)]
pub(crate) struct ExpirationReaper {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl ExpirationReaper {
    pub fn start(pool: WorkerPool, interval: Duration, name: String) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        pool.look_for_expired_workers();
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| Error::spawn(format!("expiration reaper: {}", e)))?;

        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    pub fn stop(&mut self) {
        drop(self.stop_tx.take());
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ExpirationReaper {
    fn drop(&mut self) {
        self.stop();
    }
}
