//! Task representation and execution.

use std::fmt;

/// Priority class a task is queued and dispatched under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    High,
    Low,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::High
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => f.write_str("high"),
            Priority::Low => f.write_str("low"),
        }
    }
}

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum TaskKind {
    /// Taken out on first run.
    OneTime(Option<Job>),
    Recurring {
        work: Box<dyn FnMut() + Send + 'static>,
        period_ms: u64,
    },
}

/// One schedulable unit: the work, its priority class and when it becomes ready.
pub(crate) struct TaskWrapper {
    pub(crate) seq: u64,
    pub(crate) priority: Priority,
    pub(crate) run_time: u64,
    pub(crate) kind: TaskKind,
}

impl TaskWrapper {
    pub fn one_time<F>(f: F, priority: Priority, run_time: u64, seq: u64) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        TaskWrapper {
            seq,
            priority,
            run_time,
            kind: TaskKind::OneTime(Some(Box::new(f))),
        }
    }

    pub fn recurring<F>(f: F, priority: Priority, run_time: u64, period_ms: u64, seq: u64) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        TaskWrapper {
            seq,
            priority,
            run_time,
            kind: TaskKind::Recurring {
                work: Box::new(f),
                period_ms,
            },
        }
    }

    pub fn is_recurring(&self) -> bool {
        matches!(self.kind, TaskKind::Recurring { .. })
    }

    /// Run the wrapped work once.
    pub fn execute(&mut self) {
        match &mut self.kind {
            TaskKind::OneTime(job) => {
                if let Some(job) = job.take() {
                    job();
                }
            }
            TaskKind::Recurring { work, .. } => work(),
        }
    }

    /// Called once a run has finished. One-time tasks are consumed; recurring
    /// tasks come back with their next ready time anchored on `completed_at`.
    pub fn on_completion(mut self, completed_at: u64, seq: u64) -> Option<Self> {
        match self.kind {
            TaskKind::OneTime(_) => None,
            TaskKind::Recurring { period_ms, .. } => {
                self.run_time = completed_at.saturating_add(period_ms).max(self.run_time);
                self.seq = seq;
                Some(self)
            }
        }
    }
}

impl fmt::Debug for TaskWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("TaskWrapper");
        s.field("seq", &self.seq)
            .field("priority", &self.priority)
            .field("run_time", &self.run_time);
        if let TaskKind::Recurring { period_ms, .. } = &self.kind {
            s.field("period_ms", period_ms);
        }
        s.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_default_priority() {
        assert_eq!(Priority::default(), Priority::High);
    }

    #[test]
    fn test_one_time_runs_once_and_is_consumed() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let mut task = TaskWrapper::one_time(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            Priority::High,
            10,
            0,
        );

        task.execute();
        task.execute();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(task.on_completion(20, 1).is_none());
    }

    #[test]
    fn test_recurring_uses_fixed_delay_from_completion() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let mut task = TaskWrapper::recurring(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
            Priority::Low,
            100,
            50,
            0,
        );
        assert!(task.is_recurring());

        task.execute();
        // the run finished well after it was due; the next run is anchored on completion
        let mut next = task.on_completion(400, 7).expect("recurring task must come back");
        assert_eq!(next.run_time, 450);
        assert_eq!(next.seq, 7);
        assert_eq!(next.priority, Priority::Low);

        next.execute();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_recurring_run_time_never_decreases() {
        let task = TaskWrapper::recurring(|| {}, Priority::High, 1_000, 0, 0);
        let next = task.on_completion(10, 1).unwrap();
        assert_eq!(next.run_time, 1_000);
    }
}
