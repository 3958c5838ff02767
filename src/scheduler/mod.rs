//! Ready-time ordered queues and the per-priority consumers that drain them.

pub(crate) mod consumer;
pub(crate) mod priority;

pub(crate) use consumer::Consumer;
