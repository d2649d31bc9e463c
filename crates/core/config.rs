//! Configuration types for queues, worker pools and retry handling.

use std::time::Duration;

use crate::error::{DroverError, Result};

/// Default lease duration before a claimed job becomes reclaimable.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// What a worker does when a job's scope tokens are held by another job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScopeAcquisition {
    /// Wait until the tokens are released.
    #[default]
    Block,
    /// Put the job back in the queue and back off.
    FailFast,
}

/// Configuration for the WorkerPool.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// Behaviour when scope tokens are unavailable.
    pub scope_acquisition: ScopeAcquisition,
    /// Pause after a fail-fast scope conflict before fetching again.
    pub scope_backoff: Duration,
    /// How often a running job's lease is renewed. Defaults to a quarter of
    /// the queue's lock timeout.
    pub lease_ping_interval: Option<Duration>,
    /// Graceful shutdown timeout.
    pub shutdown_timeout: Duration,
    /// Explicit pool identity; generated from host and pid when unset.
    pub pool_id: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            num_workers: 4,
            scope_acquisition: ScopeAcquisition::Block,
            scope_backoff: Duration::from_millis(50),
            lease_ping_interval: None,
            shutdown_timeout: Duration::from_secs(30),
            pool_id: None,
        }
    }
}

impl WorkerConfig {
    /// Create a new builder.
    pub fn builder() -> WorkerConfigBuilder {
        WorkerConfigBuilder::new()
    }
}

/// Builder for WorkerConfig.
#[derive(Debug, Default)]
pub struct WorkerConfigBuilder {
    config: WorkerConfig,
}

impl WorkerConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers.
    pub fn num_workers(mut self, num: usize) -> Self {
        self.config.num_workers = num;
        self
    }

    /// Set the scope acquisition mode.
    pub fn scope_acquisition(mut self, mode: ScopeAcquisition) -> Self {
        self.config.scope_acquisition = mode;
        self
    }

    /// Set the back-off used after a fail-fast scope conflict.
    pub fn scope_backoff(mut self, backoff: Duration) -> Self {
        self.config.scope_backoff = backoff;
        self
    }

    /// Set the lease renewal interval.
    pub fn lease_ping_interval(mut self, interval: Duration) -> Self {
        self.config.lease_ping_interval = Some(interval);
        self
    }

    /// Set the graceful shutdown timeout.
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout = timeout;
        self
    }

    /// Set the pool identity.
    pub fn pool_id(mut self, id: impl Into<String>) -> Self {
        self.config.pool_id = Some(id.into());
        self
    }

    /// Build the WorkerConfig.
    pub fn build(self) -> WorkerConfig {
        self.config
    }
}

/// Configuration for the BasicRetryHandler.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of jobs waiting for a retry at once.
    pub max_capacity: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_capacity: 4096 }
    }
}

/// Configuration for a LocalQueue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Maximum number of queued, not yet dispatched jobs accepted from
    /// producers. `None` means unbounded.
    pub capacity: Option<usize>,
    /// Replace a stored job on `put` instead of rejecting the duplicate.
    pub allow_overwrite: bool,
    /// Lease duration for running jobs.
    pub lock_timeout: Duration,
    /// How often expired leases and blocked jobs are re-examined.
    pub reaper_interval: Duration,
    /// Worker pool created with the queue.
    pub worker: WorkerConfig,
    /// Retry handler created with the queue.
    pub retry: RetryConfig,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            allow_overwrite: false,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            reaper_interval: Duration::from_secs(1),
            worker: WorkerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl QueueConfig {
    /// Create a new builder.
    pub fn builder() -> QueueConfigBuilder {
        QueueConfigBuilder::new()
    }

    /// Reject settings the queue cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.worker.num_workers == 0 {
            return Err(DroverError::Config(
                "worker pool needs at least one worker".to_string(),
            ));
        }
        if self.capacity == Some(0) {
            return Err(DroverError::Config(
                "queue capacity must be greater than zero".to_string(),
            ));
        }
        if self.lock_timeout.is_zero() {
            return Err(DroverError::Config(
                "lock timeout must be greater than zero".to_string(),
            ));
        }
        if self.reaper_interval.is_zero() {
            return Err(DroverError::Config(
                "reaper interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Builder for QueueConfig.
#[derive(Debug, Default)]
pub struct QueueConfigBuilder {
    config: QueueConfig,
}

impl QueueConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of workers.
    pub fn workers(mut self, num: usize) -> Self {
        self.config.worker.num_workers = num;
        self
    }

    /// Bound the number of queued jobs.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.config.capacity = Some(capacity);
        self
    }

    /// Allow `put` to replace stored jobs.
    pub fn allow_overwrite(mut self, allow: bool) -> Self {
        self.config.allow_overwrite = allow;
        self
    }

    /// Set the lease duration.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    /// Set the reaper interval.
    pub fn reaper_interval(mut self, interval: Duration) -> Self {
        self.config.reaper_interval = interval;
        self
    }

    /// Replace the worker pool configuration.
    pub fn worker(mut self, worker: WorkerConfig) -> Self {
        self.config.worker = worker;
        self
    }

    /// Set the maximum number of waiting retries.
    pub fn retry_capacity(mut self, max: usize) -> Self {
        self.config.retry.max_capacity = max;
        self
    }

    /// Build the QueueConfig.
    pub fn build(self) -> QueueConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_default() {
        let config = QueueConfig::default();
        assert_eq!(config.capacity, None);
        assert!(!config.allow_overwrite);
        assert_eq!(config.lock_timeout, DEFAULT_LOCK_TIMEOUT);
        assert_eq!(config.worker.num_workers, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_queue_config_builder() {
        let config = QueueConfig::builder()
            .workers(12)
            .capacity(50)
            .allow_overwrite(true)
            .lock_timeout(Duration::from_secs(5))
            .reaper_interval(Duration::from_millis(200))
            .retry_capacity(8)
            .build();

        assert_eq!(config.worker.num_workers, 12);
        assert_eq!(config.capacity, Some(50));
        assert!(config.allow_overwrite);
        assert_eq!(config.lock_timeout, Duration::from_secs(5));
        assert_eq!(config.reaper_interval, Duration::from_millis(200));
        assert_eq!(config.retry.max_capacity, 8);
    }

    #[test]
    fn test_queue_config_validate() {
        assert!(QueueConfig::builder().workers(0).build().validate().is_err());
        assert!(QueueConfig::builder().capacity(0).build().validate().is_err());
        assert!(QueueConfig::builder()
            .lock_timeout(Duration::ZERO)
            .build()
            .validate()
            .is_err());
    }

    #[test]
    fn test_worker_config_builder() {
        let config = WorkerConfig::builder()
            .num_workers(2)
            .scope_acquisition(ScopeAcquisition::FailFast)
            .scope_backoff(Duration::from_millis(5))
            .lease_ping_interval(Duration::from_secs(1))
            .shutdown_timeout(Duration::from_secs(3))
            .pool_id("pool-a")
            .build();

        assert_eq!(config.num_workers, 2);
        assert_eq!(config.scope_acquisition, ScopeAcquisition::FailFast);
        assert_eq!(config.scope_backoff, Duration::from_millis(5));
        assert_eq!(config.lease_ping_interval, Some(Duration::from_secs(1)));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(3));
        assert_eq!(config.pool_id.as_deref(), Some("pool-a"));
    }
}
