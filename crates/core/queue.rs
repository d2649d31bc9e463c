//! Queue abstraction.
//!
//! A queue stores jobs, hands ready jobs to workers and records their
//! completion. [`LocalQueue`](crate::LocalQueue) is the in-process
//! implementation; persistent backends implement the same trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::job::{Job, JobInfo};
use crate::pool::Runner;
use crate::scope::ScopeManager;

/// Buffer size of the channels returned by [`Queue::job_info`] and
/// [`Queue::results`].
pub const STREAM_BUFFER: usize = 16;

/// Lazily filled, finite stream of items produced for a single call.
pub type JobStream<T> = mpsc::Receiver<T>;

/// Static information about a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    /// Whether `start` has succeeded.
    pub started: bool,
    /// Lease duration after which a running, unreported job is reclaimable.
    #[serde(with = "millis")]
    pub lock_timeout: Duration,
}

/// Point-in-time job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Claimed by a worker.
    pub running: usize,
    /// Finished, successfully or not.
    pub completed: usize,
    /// Waiting for dispatch, including blocked jobs and jobs waiting to retry.
    pub pending: usize,
    /// Subset of `pending` whose dependencies are not yet met.
    pub blocked: usize,
    /// Every stored job.
    pub total: usize,
}

impl QueueStats {
    /// No job is waiting or running.
    pub fn is_idle(&self) -> bool {
        self.pending == 0 && self.running == 0
    }
}

/// Storage and dispatch of jobs.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Identity of this queue instance.
    fn id(&self) -> &str;

    /// Store a new job and make it visible for dispatch.
    async fn put(&self, ctx: &CancellationToken, job: Arc<dyn Job>) -> Result<()>;

    /// Update the stored record of a known job and renew its lease.
    ///
    /// Unknown jobs are ignored and `Ok(())` is returned.
    async fn save(&self, ctx: &CancellationToken, job: Arc<dyn Job>) -> Result<()>;

    /// Look up a job by id.
    async fn get(&self, ctx: &CancellationToken, id: &str) -> Option<Arc<dyn Job>>;

    /// Wait for a ready job.
    ///
    /// Returns `None` once `ctx` is cancelled or the queue is closed.
    async fn next(&self, ctx: &CancellationToken) -> Option<Arc<dyn Job>>;

    /// Record that a job finished and release anything waiting on it.
    async fn complete(&self, ctx: &CancellationToken, job: Arc<dyn Job>) -> Result<()>;

    /// Return a known, unfinished job to the dispatch set.
    async fn requeue(&self, ctx: &CancellationToken, job: Arc<dyn Job>) -> Result<()>;

    /// Current counts.
    async fn stats(&self, ctx: &CancellationToken) -> QueueStats;

    fn info(&self) -> QueueInfo;

    /// Snapshot of every stored job.
    async fn job_info(&self, ctx: &CancellationToken) -> JobStream<JobInfo>;

    /// Jobs completed at call time, each yielded once.
    async fn results(&self, ctx: &CancellationToken) -> JobStream<Arc<dyn Job>>;

    /// The runner executing this queue's jobs.
    fn runner(&self) -> Arc<dyn Runner>;

    /// Replace the runner. Fails once the queue has started.
    fn set_runner(&self, runner: Arc<dyn Runner>) -> Result<()>;

    /// Lock table used by workers for job scopes.
    fn scope_manager(&self) -> Arc<ScopeManager>;

    /// Start the runner and background maintenance. Idempotent.
    async fn start(&self, ctx: &CancellationToken) -> Result<()>;

    /// Stop dispatch and wait for workers to drain. Safe to call repeatedly.
    async fn close(&self, ctx: &CancellationToken);
}

mod millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        (d.as_millis() as u64).serialize(s)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
