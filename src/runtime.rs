//! The scheduler facade: two priority consumers feeding one worker pool.

use crate::clock::{duration_to_ms, Clock, SystemClock};
use crate::config::{SchedulerConfig, DEFAULT_LOW_PRIORITY_MAX_WAIT};
use crate::error::{Error, Result};
use crate::executor::pool::{Acquire, ExpirationReaper};
use crate::executor::{Job, PanicHandler, PanicStrategy, Priority, TaskWrapper, WorkerPool};
use crate::scheduler::Consumer;
use crate::util::Backoff;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Point-in-time counters for a scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub tasks_executed: u64,
    pub tasks_panicked: u64,
    pub workers_created: u64,
    pub workers_expired: u64,
    pub current_pool_size: usize,
    pub idle_workers: usize,
    pub queued_high: usize,
    pub queued_low: usize,
}

struct Shared {
    clock: Arc<dyn Clock>,
    default_priority: Priority,
    max_wait_for_low_priority: Duration,
    high: Consumer,
    low: Consumer,
    pool: WorkerPool,
    panic_handler: PanicHandler,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
    tasks_executed: AtomicU64,
    thread_name_prefix: String,
}

/// Thread pool that runs tasks at or after their ready time, in two priority
/// classes, on a pool of workers sized between a core and a max bound.
///
/// High priority tasks are handed to workers as soon as they are due; low
/// priority tasks prefer to wait for an idle worker rather than grow the pool,
/// but never longer than the configured max wait past their ready time.
pub struct PriorityScheduler {
    shared: Arc<Shared>,
    reaper: Mutex<Option<ExpirationReaper>>,
}

impl PriorityScheduler {
    /// Scheduler with high default priority and the default low priority wait.
    pub fn new(core_pool_size: usize, max_pool_size: usize, keep_alive: Duration) -> Result<Self> {
        Self::with_priority(
            core_pool_size,
            max_pool_size,
            keep_alive,
            Priority::High,
            DEFAULT_LOW_PRIORITY_MAX_WAIT,
        )
    }

    pub fn with_priority(
        core_pool_size: usize,
        max_pool_size: usize,
        keep_alive: Duration,
        default_priority: Priority,
        max_wait_for_low_priority: Duration,
    ) -> Result<Self> {
        let config = SchedulerConfig {
            core_pool_size,
            max_pool_size,
            keep_alive,
            default_priority,
            max_wait_for_low_priority,
            ..SchedulerConfig::default()
        };
        Self::from_config(config)
    }

    pub fn from_config(config: SchedulerConfig) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    pub fn with_clock(config: SchedulerConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;

        let pool = WorkerPool::new(&config, Arc::clone(&clock))?;
        let reaper = ExpirationReaper::start(
            pool.clone(),
            config.expiration_check_interval,
            format!("{}-reaper", config.thread_name_prefix),
        )?;

        let shared = Arc::new(Shared {
            clock,
            default_priority: config.default_priority,
            max_wait_for_low_priority: config.max_wait_for_low_priority,
            high: Consumer::new(Priority::High),
            low: Consumer::new(Priority::Low),
            pool,
            panic_handler: PanicHandler::new(config.panic_strategy),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
            tasks_executed: AtomicU64::new(0),
            thread_name_prefix: config.thread_name_prefix,
        });

        Ok(Self {
            shared,
            reaper: Mutex::new(Some(reaper)),
        })
    }

    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.execute_with_priority(task, self.shared.default_priority)
    }

    pub fn execute_with_priority<F>(&self, task: F, priority: Priority) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_with_priority(task, Duration::ZERO, priority)
    }

    /// Runs `task` once, no earlier than `delay` from now.
    pub fn schedule<F>(&self, task: F, delay: Duration) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_with_priority(task, delay, self.shared.default_priority)
    }

    pub fn schedule_with_priority<F>(&self, task: F, delay: Duration, priority: Priority) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.ensure_running()?;
        let run_time = self.shared.run_time_after(delay);
        let wrapper = TaskWrapper::one_time(task, priority, run_time, self.shared.next_seq());
        self.shared.add_to_queue(wrapper)
    }

    /// Runs `task` repeatedly: first after `initial_delay`, then `period` after
    /// each run completes.
    pub fn schedule_with_fixed_delay<F>(&self, task: F, initial_delay: Duration, period: Duration) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_with_fixed_delay_and_priority(
            task,
            initial_delay,
            period,
            self.shared.default_priority,
        )
    }

    pub fn schedule_with_fixed_delay_and_priority<F>(
        &self,
        task: F,
        initial_delay: Duration,
        period: Duration,
        priority: Priority,
    ) -> Result<()>
    where
        F: FnMut() + Send + 'static,
    {
        self.ensure_running()?;
        let run_time = self.shared.run_time_after(initial_delay);
        let wrapper = TaskWrapper::recurring(
            task,
            priority,
            run_time,
            duration_to_ms(period),
            self.shared.next_seq(),
        );
        self.shared.add_to_queue(wrapper)
    }

    pub fn set_core_pool_size(&self, n: usize) -> Result<()> {
        self.shared.pool.set_core_pool_size(n)
    }

    pub fn set_max_pool_size(&self, n: usize) -> Result<()> {
        self.shared.pool.set_max_pool_size(n)
    }

    pub fn set_keep_alive_time(&self, keep_alive: Duration) {
        self.shared.pool.set_keep_alive(keep_alive);
    }

    /// Lets idle core workers expire as well, down to an empty pool.
    pub fn allow_core_thread_timeout(&self, allow: bool) {
        self.shared.pool.allow_core_thread_timeout(allow);
    }

    pub fn is_core_thread_timeout_allowed(&self) -> bool {
        self.shared.pool.is_core_thread_timeout_allowed()
    }

    pub fn core_pool_size(&self) -> usize {
        self.shared.pool.core_pool_size()
    }

    pub fn max_pool_size(&self) -> usize {
        self.shared.pool.max_pool_size()
    }

    pub fn keep_alive_time(&self) -> Duration {
        self.shared.pool.keep_alive()
    }

    /// Number of live workers, idle or busy.
    pub fn current_pool_size(&self) -> usize {
        self.shared.pool.current_pool_size()
    }

    pub fn default_priority(&self) -> Priority {
        self.shared.default_priority
    }

    pub fn max_wait_for_low_priority(&self) -> Duration {
        self.shared.max_wait_for_low_priority
    }

    pub fn panic_strategy(&self) -> PanicStrategy {
        self.shared.panic_handler.strategy()
    }

    pub fn queued_task_count(&self, priority: Priority) -> usize {
        self.shared.consumer(priority).len()
    }

    pub fn is_consumer_running(&self, priority: Priority) -> bool {
        self.shared.consumer(priority).is_running()
    }

    pub fn stats(&self) -> SchedulerStats {
        let pool = &self.shared.pool;
        SchedulerStats {
            tasks_executed: self.shared.tasks_executed.load(Ordering::Relaxed),
            tasks_panicked: self.shared.panic_handler.panic_count(),
            workers_created: pool.workers_created(),
            workers_expired: pool.workers_expired(),
            current_pool_size: pool.current_pool_size(),
            idle_workers: pool.idle_worker_count(),
            queued_high: self.shared.high.len(),
            queued_low: self.shared.low.len(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Stops accepting tasks. Already queued tasks still run; idle workers are
    /// retired now and busy ones as they finish. Calling it again does nothing.
    pub fn shutdown(&self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("scheduler shutting down");

        if let Some(mut reaper) = self.reaper.lock().take() {
            reaper.stop();
        }
        self.shared.pool.shutdown();
    }

    /// Shuts down and throws away every task still waiting in a queue.
    /// Returns the number of discarded tasks.
    pub fn shutdown_now(&self) -> usize {
        self.shutdown();
        let discarded = self.shared.high.stop() + self.shared.low.stop();
        self.shared.pool.halt();
        if discarded > 0 {
            tracing::warn!(discarded, "discarded queued tasks on shutdown");
        }
        discarded
    }

    /// Whether shutdown has completed: no consumer active and no worker left.
    pub fn is_terminated(&self) -> bool {
        self.is_shutdown()
            && !self.shared.high.is_running()
            && !self.shared.low.is_running()
            && self.shared.pool.current_pool_size() == 0
    }

    /// Waits up to `timeout` for a shut down scheduler to terminate.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut backoff = Backoff::new();
        loop {
            if self.is_terminated() {
                return true;
            }
            if start.elapsed() >= timeout {
                return false;
            }
            backoff.snooze();
        }
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(Error::illegal_state("scheduler has been shut down"));
        }
        Ok(())
    }
}

impl Drop for PriorityScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PriorityScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityScheduler")
            .field("pool", &self.shared.pool)
            .field("default_priority", &self.shared.default_priority)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

impl Shared {
    fn consumer(&self, priority: Priority) -> &Consumer {
        match priority {
            Priority::High => &self.high,
            Priority::Low => &self.low,
        }
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn run_time_after(&self, delay: Duration) -> u64 {
        self.clock.now_ms().saturating_add(duration_to_ms(delay))
    }

    fn add_to_queue(self: &Arc<Self>, task: TaskWrapper) -> Result<()> {
        let priority = task.priority;
        self.consumer(priority)
            .push(task, &self.shutdown, || self.start_consumer(priority))
    }

    fn start_consumer(self: &Arc<Self>, priority: Priority) -> Result<()> {
        let shared = Arc::clone(self);
        thread::Builder::new()
            .name(format!("{}-{}-consumer", self.thread_name_prefix, priority))
            .spawn(move || shared.run_consumer(priority))
            .map(|_| ())
            .map_err(|e| {
                tracing::error!(%priority, error = %e, "failed to start consumer");
                Error::spawn(format!("{} priority consumer: {}", priority, e))
            })
    }

    fn run_consumer(self: Arc<Self>, priority: Priority) {
        let consumer = self.consumer(priority);
        let max_wait_ms = duration_to_ms(self.max_wait_for_low_priority);

        while let Some(task) = consumer.next_ready(&*self.clock) {
            match priority {
                Priority::High => {
                    // low task stuck past its max wait goes first, unless an
                    // earlier low task is still waiting for its worker
                    let now = self.clock.now_ms();
                    if let Some(overdue) = self.low.take_overdue(now, max_wait_ms) {
                        tracing::debug!(run_time = overdue.run_time, now, "dispatching overdue low priority task");
                        self.dispatch(
                            overdue,
                            Acquire::Low {
                                existing_wait: Duration::ZERO,
                            },
                        );
                        self.low.finish_dispatch();
                    }
                    self.dispatch(task, Acquire::High);
                }
                Priority::Low => {
                    let deadline = task.run_time.saturating_add(max_wait_ms);
                    let existing_wait =
                        Duration::from_millis(deadline.saturating_sub(self.clock.now_ms()));
                    self.dispatch(task, Acquire::Low { existing_wait });
                }
            }
            consumer.finish_dispatch();
        }
    }

    fn dispatch(self: &Arc<Self>, task: TaskWrapper, request: Acquire) {
        let mut job = self.make_job(task);
        let mut backoff = Backoff::new();
        let mut failures = 0u32;

        loop {
            match self.pool.acquire_worker(request) {
                Ok(Some(worker)) => match worker.next_task(job) {
                    Ok(()) => return,
                    Err(returned) => {
                        job = returned;
                        self.pool.worker_done(worker);
                    }
                },
                Ok(None) => {
                    tracing::warn!("worker pool halted, dropping task");
                    return;
                }
                Err(e) if self.shutdown.load(Ordering::Acquire) => {
                    tracing::warn!(error = %e, "no worker available after shutdown, dropping task");
                    return;
                }
                Err(e) => {
                    if failures == 0 {
                        tracing::error!(error = %e, "could not obtain a worker, retrying");
                    } else {
                        tracing::debug!(error = %e, failures, "worker still unavailable");
                    }
                    failures = failures.saturating_add(1);
                    backoff.snooze();
                }
            }
        }
    }

    fn make_job(self: &Arc<Self>, task: TaskWrapper) -> Job {
        let shared = Arc::clone(self);
        Box::new(move || shared.run_task(task))
    }

    fn run_task(self: &Arc<Self>, mut task: TaskWrapper) {
        let priority = task.priority;
        let _ = self.panic_handler.run(priority, || task.execute());
        self.tasks_executed.fetch_add(1, Ordering::Relaxed);

        if !task.is_recurring() {
            return;
        }
        let completed_at = self.clock.now_ms();
        if let Some(next) = task.on_completion(completed_at, self.next_seq()) {
            if let Err(e) = self.add_to_queue(next) {
                tracing::debug!(error = %e, "recurring task not rescheduled");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crossbeam_channel::unbounded;

    const LONG_DELAY: Duration = Duration::from_secs(10);

    fn test_config(core: usize, max: usize, keep_alive_ms: u64) -> SchedulerConfig {
        SchedulerConfig::builder()
            .core_pool_size(core)
            .max_pool_size(max)
            .keep_alive(Duration::from_millis(keep_alive_ms))
            .thread_name_prefix("runtime-test")
            .build()
            .unwrap()
    }

    #[test]
    fn test_add_to_queue_starts_matching_consumer() {
        let scheduler = PriorityScheduler::new(1, 1, Duration::from_secs(1)).unwrap();
        assert!(!scheduler.is_consumer_running(Priority::High));
        assert!(!scheduler.is_consumer_running(Priority::Low));

        scheduler
            .schedule_with_priority(|| {}, LONG_DELAY, Priority::High)
            .unwrap();
        assert_eq!(scheduler.queued_task_count(Priority::High), 1);
        assert_eq!(scheduler.queued_task_count(Priority::Low), 0);
        assert!(scheduler.is_consumer_running(Priority::High));
        assert!(!scheduler.is_consumer_running(Priority::Low));

        scheduler
            .schedule_with_priority(|| {}, LONG_DELAY, Priority::Low)
            .unwrap();
        assert_eq!(scheduler.queued_task_count(Priority::High), 1);
        assert_eq!(scheduler.queued_task_count(Priority::Low), 1);
        assert!(scheduler.is_consumer_running(Priority::High));
        assert!(scheduler.is_consumer_running(Priority::Low));

        assert_eq!(scheduler.shutdown_now(), 2);
    }

    #[test]
    fn test_consumer_stops_once_drained() {
        let scheduler = PriorityScheduler::new(1, 1, Duration::from_secs(1)).unwrap();
        let (tx, rx) = unbounded();
        scheduler
            .execute(move || {
                tx.send(()).unwrap();
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while scheduler.is_consumer_running(Priority::High) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!scheduler.is_consumer_running(Priority::High));
    }

    #[test]
    fn test_existing_worker_reused_through_facade_pool() {
        let scheduler = PriorityScheduler::from_config(test_config(1, 1, 1000)).unwrap();
        let pool = &scheduler.shared.pool;

        let worker = pool.acquire_worker(Acquire::High).unwrap().unwrap();
        pool.worker_done(worker.clone());
        assert_eq!(pool.idle_worker_count(), 1);

        let returned = pool
            .acquire_worker(Acquire::Low {
                existing_wait: Duration::from_millis(100),
            })
            .unwrap()
            .unwrap();
        assert_eq!(returned, worker);
        assert_eq!(pool.workers_created(), 1);
        pool.worker_done(returned);
    }

    #[test]
    fn test_expired_workers_with_manual_clock() {
        let clock = Arc::new(ManualClock::new());
        let scheduler = PriorityScheduler::with_clock(
            SchedulerConfig::builder()
                .core_pool_size(1)
                .max_pool_size(1)
                .keep_alive(Duration::ZERO)
                .expiration_check_interval(Duration::from_secs(3600))
                .build()
                .unwrap(),
            clock.clone(),
        )
        .unwrap();
        let pool = &scheduler.shared.pool;

        let worker = pool.acquire_worker(Acquire::High).unwrap().unwrap();
        pool.worker_done(worker);
        assert_eq!(pool.idle_worker_count(), 1);

        clock.advance(Duration::from_millis(1));
        pool.look_for_expired_workers();
        assert_eq!(pool.idle_worker_count(), 1);
        assert_eq!(scheduler.current_pool_size(), 1);

        scheduler.allow_core_thread_timeout(true);
        clock.advance(Duration::from_millis(1));
        pool.look_for_expired_workers();
        assert_eq!(pool.idle_worker_count(), 0);
        assert_eq!(scheduler.current_pool_size(), 0);
    }

    #[test]
    fn test_recurring_reschedules_from_completion() {
        let clock = Arc::new(ManualClock::starting_at(1_000));
        let scheduler = PriorityScheduler::with_clock(test_config(1, 1, 1000), clock.clone()).unwrap();
        let (tx, rx) = unbounded();

        let task_clock = clock.clone();
        scheduler
            .schedule_with_fixed_delay(
                move || {
                    // the run itself takes 300ms of clock time
                    task_clock.advance(Duration::from_millis(300));
                    let _ = tx.send(());
                },
                Duration::ZERO,
                Duration::from_millis(100),
            )
            .unwrap();

        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // the consumer may still hold its dispatch slot for the first run
        let deadline = Instant::now() + Duration::from_secs(5);
        let next = loop {
            if let Some(task) = scheduler.shared.high.take_overdue(u64::MAX, 0) {
                break task;
            }
            assert!(Instant::now() < deadline, "recurring task was not re-queued");
            thread::sleep(Duration::from_millis(5));
        };
        // completion at 1300, next run at 1400; fixed rate would have said 1100
        assert_eq!(next.run_time, 1_400);
    }

    #[test]
    fn test_overdue_low_task_dispatched_by_high_consumer() {
        let clock = Arc::new(ManualClock::starting_at(0));
        let scheduler = PriorityScheduler::with_clock(
            SchedulerConfig::builder()
                .core_pool_size(1)
                .max_pool_size(1)
                .max_wait_for_low_priority(Duration::from_millis(10))
                .build()
                .unwrap(),
            clock.clone(),
        )
        .unwrap();

        let (tx, rx) = unbounded();
        // queued directly so the low consumer thread never sees it
        let low_tx = tx.clone();
        scheduler
            .shared
            .low
            .push(
                TaskWrapper::one_time(
                    move || {
                        let _ = low_tx.send(Priority::Low);
                    },
                    Priority::Low,
                    0,
                    scheduler.shared.next_seq(),
                ),
                &scheduler.shared.shutdown,
                || Ok(()),
            )
            .unwrap();

        clock.advance(Duration::from_millis(50));
        scheduler
            .execute_with_priority(
                move || {
                    let _ = tx.send(Priority::High);
                },
                Priority::High,
            )
            .unwrap();

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Priority::Low);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), Priority::High);
        assert_eq!(scheduler.queued_task_count(Priority::Low), 0);
    }

    #[test]
    fn test_panicking_task_counted_and_pool_survives() {
        let scheduler = PriorityScheduler::new(1, 1, Duration::from_secs(1)).unwrap();
        scheduler.execute(|| panic!("intentional")).unwrap();

        let (tx, rx) = unbounded();
        scheduler
            .execute(move || {
                tx.send(()).unwrap();
            })
            .unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        let stats = scheduler.stats();
        assert_eq!(stats.tasks_panicked, 1);
        assert!(stats.tasks_executed >= 1);
        assert_eq!(stats.workers_created, 1);
    }
}
