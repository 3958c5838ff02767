use crate::executor::TaskWrapper;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;

/// Heap entry ordered so the earliest ready time pops first, ties by submission order.
#[derive(Debug)]
struct QueuedTask(TaskWrapper);

impl QueuedTask {
    fn key(&self) -> (u64, u64) {
        (self.0.run_time, self.0.seq)
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap is a max-heap
        other.key().cmp(&self.key())
    }
}

/// Tasks of one priority class, earliest ready time first.
#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, task: TaskWrapper) {
        self.heap.push(QueuedTask(task));
    }

    pub fn peek_run_time(&self) -> Option<u64> {
        self.heap.peek().map(|t| t.0.run_time)
    }

    pub fn pop(&mut self) -> Option<TaskWrapper> {
        self.heap.pop().map(|t| t.0)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Drops every queued task and reports how many there were.
    pub fn clear(&mut self) -> usize {
        let n = self.heap.len();
        self.heap.clear();
        n
    }
}
