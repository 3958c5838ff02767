use crate::error::{Error, Result};
use crate::executor::{PanicStrategy, Priority};
use std::time::Duration;

pub const DEFAULT_LOW_PRIORITY_MAX_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub keep_alive: Duration,
    pub allow_core_thread_timeout: bool,
    pub default_priority: Priority,
    pub max_wait_for_low_priority: Duration,
    pub panic_strategy: PanicStrategy,
    pub stack_size: Option<usize>,
    pub thread_name_prefix: String,

    /// How often idle workers are checked against the keep-alive time.
    pub expiration_check_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            core_pool_size: 1,
            max_pool_size: num_cpus::get().max(1),
            keep_alive: Duration::from_secs(1),
            allow_core_thread_timeout: false,
            default_priority: Priority::High,
            max_wait_for_low_priority: DEFAULT_LOW_PRIORITY_MAX_WAIT,
            panic_strategy: PanicStrategy::LogAndContinue,
            stack_size: Some(2 * 1024 * 1024),
            thread_name_prefix: "priosched".to_string(),
            expiration_check_interval: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    pub fn builder() -> SchedulerConfigBuilder {
        SchedulerConfigBuilder::new()
    }

    pub fn validate(&self) -> Result<()> {
        validate_pool_sizes(self.core_pool_size, self.max_pool_size)?;

        if self.expiration_check_interval.is_zero() {
            return Err(Error::invalid_argument(
                "expiration_check_interval must be > 0",
            ));
        }

        if let Some(0) = self.stack_size {
            return Err(Error::invalid_argument("stack_size must be > 0"));
        }

        Ok(())
    }
}

/// Shared by construction and the runtime setters so both reject the same inputs.
pub(crate) fn validate_pool_sizes(core: usize, max: usize) -> Result<()> {
    if max == 0 {
        return Err(Error::invalid_argument("max_pool_size must be >= 1"));
    }
    if core > max {
        return Err(Error::invalid_argument(format!(
            "core_pool_size ({}) must not exceed max_pool_size ({})",
            core, max
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct SchedulerConfigBuilder {
    config: SchedulerConfig,
}

impl SchedulerConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
        }
    }

    pub fn core_pool_size(mut self, n: usize) -> Self {
        self.config.core_pool_size = n;
        self
    }

    pub fn max_pool_size(mut self, n: usize) -> Self {
        self.config.max_pool_size = n;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn allow_core_thread_timeout(mut self, allow: bool) -> Self {
        self.config.allow_core_thread_timeout = allow;
        self
    }

    pub fn default_priority(mut self, priority: Priority) -> Self {
        self.config.default_priority = priority;
        self
    }

    pub fn max_wait_for_low_priority(mut self, wait: Duration) -> Self {
        self.config.max_wait_for_low_priority = wait;
        self
    }

    pub fn panic_strategy(mut self, strategy: PanicStrategy) -> Self {
        self.config.panic_strategy = strategy;
        self
    }

    pub fn stack_size(mut self, size: usize) -> Self {
        self.config.stack_size = Some(size);
        self
    }

    pub fn thread_name_prefix<S: Into<String>>(mut self, prefix: S) -> Self {
        self.config.thread_name_prefix = prefix.into();
        self
    }

    pub fn expiration_check_interval(mut self, interval: Duration) -> Self {
        self.config.expiration_check_interval = interval;
        self
    }

    pub fn build(self) -> Result<SchedulerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.default_priority, Priority::High);
        assert_eq!(config.max_wait_for_low_priority, DEFAULT_LOW_PRIORITY_MAX_WAIT);
    }

    #[test]
    fn test_builder_sets_fields() {
        let config = SchedulerConfig::builder()
            .core_pool_size(2)
            .max_pool_size(8)
            .keep_alive(Duration::from_millis(250))
            .default_priority(Priority::Low)
            .panic_strategy(PanicStrategy::Isolate)
            .thread_name_prefix("test-pool")
            .build()
            .unwrap();

        assert_eq!(config.core_pool_size, 2);
        assert_eq!(config.panic_strategy, PanicStrategy::Isolate);
        assert_eq!(config.max_pool_size, 8);
        assert_eq!(config.keep_alive, Duration::from_millis(250));
        assert_eq!(config.default_priority, Priority::Low);
        assert_eq!(config.thread_name_prefix, "test-pool");
    }

    #[test]
    fn test_core_above_max_rejected() {
        let err = SchedulerConfig::builder()
            .core_pool_size(4)
            .max_pool_size(2)
            .build()
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_zero_max_rejected() {
        let err = SchedulerConfig::builder()
            .core_pool_size(0)
            .max_pool_size(0)
            .build()
            .unwrap_err();
        assert!(err.is_invalid_argument());
    }

    #[test]
    fn test_zero_core_allowed() {
        assert!(validate_pool_sizes(0, 1).is_ok());
    }

    #[test]
    fn test_zero_expiration_interval_rejected() {
        let result = SchedulerConfig::builder()
            .expiration_check_interval(Duration::ZERO)
            .build();
        assert!(result.is_err());
    }
}
