//! # drover-core - In-process job execution
//!
//! This crate provides the queue, worker pool and supporting machinery of the
//! drover job framework:
//! - `Job` trait and `JobBase` shared state
//! - `Queue` trait and the in-memory `LocalQueue`
//! - `WorkerPool` runner with scope locking, lease renewal and panic isolation
//! - `BasicRetryHandler` for retryable failures
//! - Dependency managers, the type `Registry` and `JobInterchange`
//! - Error types

mod config;
mod dependency;
mod error;
mod heartbeat;
mod job;
mod local;
mod pool;
mod queue;
mod reaper;
mod registry;
mod retrier;
mod scope;
mod wait;
mod worker;

#[cfg(test)]
mod testing;

// Re-export main types
pub use async_trait::async_trait;
pub use tokio_util::sync::CancellationToken;

pub use config::{
    QueueConfig, QueueConfigBuilder, RetryConfig, ScopeAcquisition, WorkerConfig,
    WorkerConfigBuilder, DEFAULT_LOCK_TIMEOUT,
};
pub use dependency::{
    Always, CreatesFile, DependencyManager, DependencyState, DependencyType, JobEdges,
};
pub use error::{DroverError, Result};
pub use heartbeat::{generate_pool_id, LeasePinger};
pub use job::{
    Backoff, Job, JobBase, JobError, JobInfo, JobResult, JobStatus, JobType, RetryInfo,
    RetryState, TimeInfo,
};
pub use local::LocalQueue;
pub use pool::{Runner, RunningJobs, WorkerPool};
pub use queue::{JobStream, Queue, QueueInfo, QueueStats, STREAM_BUFFER};
pub use reaper::{LeaseReaper, LeaseStore};
pub use registry::{DependencyFactory, DependencyInterchange, JobFactory, JobInterchange, Registry};
pub use retrier::{BasicRetryHandler, RetryHandler};
pub use scope::{ScopeGuard, ScopeManager};
pub use wait::{wait_all, wait_all_interval, wait_job, DEFAULT_WAIT_INTERVAL};
