pub use crate::clock::{Clock, ManualClock, SystemClock};
pub use crate::config::{SchedulerConfig, SchedulerConfigBuilder};
pub use crate::error::{Error, Result};
pub use crate::executor::{PanicStrategy, Priority};
pub use crate::runtime::{PriorityScheduler, SchedulerStats};
