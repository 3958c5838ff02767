//! priosched - a dual-priority scheduled thread pool
//!
//! Tasks are submitted as closures with an optional delay and one of two
//! priority classes. Each class has its own ready-time ordered queue and a
//! consumer thread that hands due tasks to a pool of worker threads. The pool
//! grows on demand up to a max size, keeps a core of idle workers around, and
//! retires workers that sit idle longer than the keep-alive time.
//!
//! # Quick Start
//!
//! ```no_run
//! use priosched::prelude::*;
//! use std::time::Duration;
//!
//! let scheduler = PriorityScheduler::new(2, 8, Duration::from_secs(5)).unwrap();
//!
//! scheduler.execute(|| println!("right away")).unwrap();
//! scheduler
//!     .schedule_with_priority(|| println!("later"), Duration::from_millis(100), Priority::Low)
//!     .unwrap();
//! scheduler
//!     .schedule_with_fixed_delay(|| println!("tick"), Duration::ZERO, Duration::from_secs(1))
//!     .unwrap();
//!
//! scheduler.shutdown();
//! ```
//!
//! # Starvation
//!
//! High priority work is dispatched first, but a low priority task is never
//! held back more than `max_wait_for_low_priority` past its ready time while
//! the pool can still hand out workers: the high priority consumer yields its
//! next dispatch to an overdue low priority task, and overdue low priority
//! dispatches get first pick of workers returning to the pool.

#![warn(missing_debug_implementations)]

pub mod clock;
pub mod config;
pub mod error;
pub mod executor;
pub mod prelude;
pub mod runtime;
pub mod scheduler;
pub mod util;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{SchedulerConfig, SchedulerConfigBuilder};
pub use error::{Error, Result};
pub use executor::{PanicStrategy, Priority};
pub use runtime::{PriorityScheduler, SchedulerStats};
