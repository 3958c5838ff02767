//! Task execution infrastructure.
//!
//! Task wrappers, worker threads and the pool that creates, reuses and
//! retires them.

pub mod panic_handler;
pub mod pool;
pub mod task;
pub mod worker;

pub use panic_handler::{PanicHandler, PanicStrategy, TaskPanic};
pub use pool::WorkerPool;
pub use task::Priority;
pub use worker::{Worker, WorkerId, WorkerState};

pub(crate) use task::{Job, TaskWrapper};
