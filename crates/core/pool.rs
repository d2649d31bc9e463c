//! Worker pool for processing jobs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{DroverError, Result};
use crate::heartbeat::generate_pool_id;
use crate::queue::Queue;
use crate::worker::Worker;

/// Executes jobs fetched from a queue.
#[async_trait]
pub trait Runner: Send + Sync {
    /// Identity recorded as the owner of the jobs this runner claims.
    fn id(&self) -> &str;

    fn started(&self) -> bool;

    /// Bind the runner to a queue. Fails once started.
    fn set_queue(&self, queue: Weak<dyn Queue>) -> Result<()>;

    /// Spawn the workers. Calling `start` on a running pool is a no-op.
    async fn start(&self, ctx: &CancellationToken) -> Result<()>;

    /// Stop fetching and wait for in-flight jobs to finish.
    async fn close(&self, ctx: &CancellationToken);
}

/// Cancellation handles for jobs currently executing in a pool.
#[derive(Debug, Default)]
pub struct RunningJobs {
    jobs: Mutex<HashMap<String, RunningEntry>>,
}

#[derive(Debug)]
struct RunningEntry {
    token: CancellationToken,
    aborted: bool,
}

impl RunningJobs {
    pub(crate) fn register(&self, job_id: &str, token: CancellationToken) {
        self.entries().insert(
            job_id.to_string(),
            RunningEntry {
                token,
                aborted: false,
            },
        );
    }

    /// Remove the job, returning whether it was aborted while running.
    pub(crate) fn finish(&self, job_id: &str) -> bool {
        self.entries()
            .remove(job_id)
            .is_some_and(|entry| entry.aborted)
    }

    pub fn abort(&self, job_id: &str) -> Result<()> {
        let mut jobs = self.entries();
        let entry = jobs
            .get_mut(job_id)
            .ok_or_else(|| DroverError::JobNotFound(job_id.to_string()))?;
        entry.aborted = true;
        entry.token.cancel();
        Ok(())
    }

    pub fn abort_all(&self) -> usize {
        let mut jobs = self.entries();
        for entry in jobs.values_mut() {
            entry.aborted = true;
            entry.token.cancel();
        }
        jobs.len()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries().keys().cloned().collect();
        ids.sort();
        ids
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, RunningEntry>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct PoolState {
    workers: JoinSet<()>,
    /// Stops workers from fetching more jobs.
    drain: CancellationToken,
    /// Cancels the jobs themselves.
    run: CancellationToken,
}

/// Fixed-size pool of workers draining one queue.
pub struct WorkerPool {
    config: WorkerConfig,
    pool_id: String,
    queue: Mutex<Option<Weak<dyn Queue>>>,
    running: Arc<RunningJobs>,
    started: AtomicBool,
    closed: AtomicBool,
    state: tokio::sync::Mutex<Option<PoolState>>,
}

impl WorkerPool {
    /// Create a new worker pool with the given configuration.
    pub fn new(config: WorkerConfig) -> Self {
        let pool_id = config.pool_id.clone().unwrap_or_else(generate_pool_id);

        Self {
            config,
            pool_id,
            queue: Mutex::new(None),
            running: Arc::new(RunningJobs::default()),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Get the pool ID.
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// Cancel one running job. Its outcome is recorded as an error.
    pub fn abort_job(&self, job_id: &str) -> Result<()> {
        self.running.abort(job_id)?;
        tracing::info!(pool_id = %self.pool_id, job_id = %job_id, "Aborting job");
        Ok(())
    }

    /// Cancel every running job. Returns how many were signalled.
    pub fn abort_all(&self) -> usize {
        let count = self.running.abort_all();
        tracing::info!(pool_id = %self.pool_id, count = count, "Aborting all running jobs");
        count
    }

    /// Ids of jobs executing right now.
    pub fn running_jobs(&self) -> Vec<String> {
        self.running.ids()
    }

    fn queue(&self) -> Option<Weak<dyn Queue>> {
        self.queue
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Runner for WorkerPool {
    fn id(&self) -> &str {
        &self.pool_id
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn set_queue(&self, queue: Weak<dyn Queue>) -> Result<()> {
        let mut slot = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        if self.started() {
            return Err(DroverError::State(
                "cannot change queue of a started pool".to_string(),
            ));
        }
        *slot = Some(queue);
        Ok(())
    }

    async fn start(&self, ctx: &CancellationToken) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            return Ok(());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(DroverError::State("worker pool is closed".to_string()));
        }
        let queue = self
            .queue()
            .ok_or_else(|| DroverError::State("worker pool has no queue".to_string()))?;
        let lock_timeout = queue
            .upgrade()
            .ok_or_else(|| DroverError::State("queue has been dropped".to_string()))?
            .info()
            .lock_timeout;

        let drain = ctx.child_token();
        let run = ctx.child_token();
        let ping_interval = self
            .config
            .lease_ping_interval
            .unwrap_or_else(|| crate::heartbeat::ping_interval(lock_timeout));

        let mut workers = JoinSet::new();
        for worker_id in 0..self.config.num_workers {
            let worker = Worker::new(
                worker_id,
                self.pool_id.clone(),
                queue.clone(),
                self.running.clone(),
                self.config.scope_acquisition,
                self.config.scope_backoff,
                ping_interval,
                drain.clone(),
                run.clone(),
            );
            workers.spawn(async move { worker.run().await });
        }

        self.started.store(true, Ordering::SeqCst);
        *state = Some(PoolState {
            workers,
            drain,
            run,
        });

        tracing::info!(
            workers = self.config.num_workers,
            pool_id = %self.pool_id,
            "Worker pool started"
        );
        Ok(())
    }

    async fn close(&self, ctx: &CancellationToken) {
        self.closed.store(true, Ordering::SeqCst);
        let Some(mut state) = self.state.lock().await.take() else {
            return;
        };

        tracing::info!(pool_id = %self.pool_id, "Shutdown requested, draining...");
        state.drain.cancel();

        let drained = tokio::select! {
            _ = ctx.cancelled() => false,
            _ = tokio::time::sleep(self.config.shutdown_timeout) => false,
            _ = join_all(&mut state.workers) => true,
        };

        if !drained {
            tracing::warn!(
                pool_id = %self.pool_id,
                in_progress = self.running.ids().len(),
                "Shutdown timeout reached, forcing stop"
            );
            state.run.cancel();

            // Cancelled workers still put their interrupted jobs back.
            let stopped = tokio::time::timeout(
                self.config.shutdown_timeout,
                join_all(&mut state.workers),
            )
            .await
            .is_ok();
            if !stopped {
                tracing::error!(
                    pool_id = %self.pool_id,
                    in_progress = self.running.ids().len(),
                    "Workers ignored cancellation, aborting them"
                );
                state.workers.shutdown().await;
            }
        }

        self.started.store(false, Ordering::SeqCst);
        tracing::info!(pool_id = %self.pool_id, "Worker pool stopped");
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(result) = workers.join_next().await {
        if let Err(e) = result {
            tracing::error!(error = %e, "Worker task panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QueueConfig, ScopeAcquisition};
    use crate::job::{Job, JobBase, JobType, RetryInfo};
    use crate::local::LocalQueue;
    use crate::testing::{Behavior, OverlapTracker, TestJob};
    use crate::wait::{wait_all, wait_all_interval};
    use proptest::prelude::*;
    use std::time::Duration;

    fn queue(workers: usize) -> Arc<LocalQueue> {
        LocalQueue::new(QueueConfig::builder().workers(workers).build()).unwrap()
    }

    #[test]
    fn test_running_jobs_abort() {
        let running = RunningJobs::default();
        let token = CancellationToken::new();
        running.register("a", token.clone());

        assert!(matches!(running.abort("b"), Err(DroverError::JobNotFound(_))));
        running.abort("a").unwrap();
        assert!(token.is_cancelled());
        assert!(running.finish("a"));
        assert!(running.ids().is_empty());
    }

    #[tokio::test]
    async fn test_pool_without_queue_fails_to_start() {
        let pool = WorkerPool::new(WorkerConfig::default());
        let err = pool.start(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, DroverError::State(_)));
        assert!(!pool.started());
    }

    #[tokio::test]
    async fn test_pool_runs_all_jobs() {
        let q = queue(3);
        let ctx = CancellationToken::new();
        let jobs: Vec<Arc<TestJob>> = (0..10).map(|i| TestJob::ok(&format!("job-{}", i))).collect();
        for job in &jobs {
            q.put(&ctx, job.clone()).await.unwrap();
        }

        q.start(&ctx).await.unwrap();
        assert!(q.runner().started());
        assert!(wait_all(&ctx, q.as_ref()).await);

        for job in &jobs {
            assert_eq!(job.runs(), 1);
            let status = job.status();
            assert!(status.completed);
            assert!(!status.in_progress);
        }
        q.close(&ctx).await;
        assert!(!q.runner().started());
    }

    #[tokio::test]
    async fn test_panicking_jobs_do_not_stop_pool() {
        let q = queue(2);
        let ctx = CancellationToken::new();
        let mut panicking = Vec::new();
        let mut healthy = Vec::new();
        for i in 0..5 {
            let bad = TestJob::new(
                JobBase::new(format!("panic-{}", i), JobType::new("test", 0)),
                Behavior::Panic,
            );
            let good = TestJob::ok(&format!("ok-{}", i));
            q.put(&ctx, bad.clone()).await.unwrap();
            q.put(&ctx, good.clone()).await.unwrap();
            panicking.push(bad);
            healthy.push(good);
        }

        q.start(&ctx).await.unwrap();
        assert!(wait_all(&ctx, q.as_ref()).await);

        for job in &panicking {
            let status = job.status();
            assert!(status.completed);
            assert!(status.has_errors());
            assert!(status.errors[0].contains("panicked"));
        }
        for job in &healthy {
            let status = job.status();
            assert!(status.completed);
            assert!(!status.has_errors());
        }
        assert_eq!(q.stats(&ctx).await.completed, 10);
        q.close(&ctx).await;
    }

    #[tokio::test]
    async fn test_retryable_job_runs_max_attempts() {
        let q = queue(2);
        let ctx = CancellationToken::new();
        let job = TestJob::new(
            JobBase::new("flaky", JobType::new("test", 0))
                .with_retry(RetryInfo::with_max_attempts(3).wait_between(Duration::from_millis(5))),
            Behavior::Fail { retryable: true },
        );
        q.put(&ctx, job.clone()).await.unwrap();
        q.start(&ctx).await.unwrap();
        assert!(wait_all(&ctx, q.as_ref()).await);

        assert_eq!(job.runs(), 3);
        let retry = job.base().retry_info();
        assert_eq!(retry.current_attempt, 3);
        assert_eq!(retry.state, crate::job::RetryState::ExhaustedAttempts);
        assert!(job.status().completed);
        q.close(&ctx).await;
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_later_attempt() {
        let q = queue(1);
        let ctx = CancellationToken::new();
        let job = TestJob::new(
            JobBase::new("eventually", JobType::new("test", 0))
                .with_retry(RetryInfo::with_max_attempts(5).wait_between(Duration::from_millis(5))),
            Behavior::FailTimes(2),
        );
        q.put(&ctx, job.clone()).await.unwrap();
        q.start(&ctx).await.unwrap();
        assert!(wait_all(&ctx, q.as_ref()).await);

        assert_eq!(job.runs(), 3);
        let retry = job.base().retry_info();
        assert_eq!(retry.state, crate::job::RetryState::Succeeded);
        assert_eq!(job.status().error_count, 2);
        q.close(&ctx).await;
    }

    #[tokio::test]
    async fn test_fatal_error_not_retried() {
        let q = queue(1);
        let ctx = CancellationToken::new();
        let job = TestJob::new(
            JobBase::new("broken", JobType::new("test", 0))
                .with_retry(RetryInfo::with_max_attempts(3).wait_between(Duration::from_millis(5))),
            Behavior::Fail { retryable: false },
        );
        q.put(&ctx, job.clone()).await.unwrap();
        q.start(&ctx).await.unwrap();
        assert!(wait_all(&ctx, q.as_ref()).await);

        assert_eq!(job.runs(), 1);
        assert_eq!(job.status().error_count, 1);
        q.close(&ctx).await;
    }

    #[tokio::test]
    async fn test_timeout_recorded() {
        let q = queue(1);
        let ctx = CancellationToken::new();
        let job = TestJob::new(
            JobBase::new("slow", JobType::new("test", 0)).with_timeout(Duration::from_millis(10)),
            Behavior::Hang,
        );
        q.put(&ctx, job.clone()).await.unwrap();
        q.start(&ctx).await.unwrap();
        assert!(wait_all(&ctx, q.as_ref()).await);

        let status = job.status();
        assert!(status.completed);
        assert!(status.errors[0].contains("timed out"));
        q.close(&ctx).await;
    }

    #[tokio::test]
    async fn test_abort_running_job() {
        let q = queue(1);
        let ctx = CancellationToken::new();
        let pool = Arc::new(WorkerPool::new(WorkerConfig::default()));
        q.set_runner(pool.clone()).unwrap();

        let job = TestJob::new(JobBase::new("stuck", JobType::new("test", 0)), Behavior::Hang);
        q.put(&ctx, job.clone()).await.unwrap();
        q.start(&ctx).await.unwrap();

        while pool.running_jobs().is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert_eq!(pool.running_jobs(), vec!["stuck".to_string()]);
        assert!(pool.abort_job("other").is_err());
        pool.abort_job("stuck").unwrap();

        assert!(wait_all(&ctx, q.as_ref()).await);
        let status = job.status();
        assert!(status.completed);
        assert!(status.errors[0].contains("aborted"));
        q.close(&ctx).await;
    }

    #[tokio::test]
    async fn test_close_cancels_jobs_after_timeout() {
        let q = queue(1);
        let ctx = CancellationToken::new();
        let pool = Arc::new(WorkerPool::new(
            WorkerConfig::builder()
                .shutdown_timeout(Duration::from_millis(20))
                .build(),
        ));
        q.set_runner(pool.clone()).unwrap();
        let job = TestJob::new(JobBase::new("forever", JobType::new("test", 0)), Behavior::Hang);
        q.put(&ctx, job.clone()).await.unwrap();
        q.start(&ctx).await.unwrap();
        while pool.running_jobs().is_empty() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        tokio::time::timeout(Duration::from_secs(2), q.close(&ctx))
            .await
            .unwrap();
        assert!(pool.start(&ctx).await.is_err());

        // The interrupted job is pending again, not stuck running.
        assert!(pool.running_jobs().is_empty());
        let stats = q.stats(&ctx).await;
        assert_eq!(stats.running, 0);
        assert_eq!(stats.pending, 1);
        let status = job.status();
        assert!(!status.in_progress);
        assert!(!status.completed);
        assert!(!status.has_errors());
    }

    async fn run_scoped(scopes: Vec<Vec<usize>>, mode: ScopeAcquisition) -> usize {
        let q = LocalQueue::new(
            QueueConfig::builder()
                .worker(
                    WorkerConfig::builder()
                        .num_workers(4)
                        .scope_acquisition(mode)
                        .scope_backoff(Duration::from_millis(1))
                        .build(),
                )
                .build(),
        )
        .unwrap();
        let ctx = CancellationToken::new();
        let tracker = Arc::new(OverlapTracker::default());

        for (i, tokens) in scopes.iter().enumerate() {
            let mut names: Vec<String> = tokens.iter().map(|t| format!("res-{}", t)).collect();
            names.sort();
            names.dedup();
            let job = TestJob::tracked(
                JobBase::new(format!("job-{}", i), JobType::new("test", 0)).with_scopes(names),
                Behavior::Sleep(Duration::from_millis(2)),
                tracker.clone(),
            );
            q.put(&ctx, job).await.unwrap();
        }

        q.start(&ctx).await.unwrap();
        assert!(wait_all_interval(&ctx, q.as_ref(), Duration::from_millis(2)).await);
        assert_eq!(q.scope_manager().held(), 0);
        q.close(&ctx).await;
        tracker.violations()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_fail_fast_scopes_serialize_jobs() {
        let scopes = vec![vec![0], vec![0], vec![0, 1], vec![1], vec![]];
        assert_eq!(run_scoped(scopes, ScopeAcquisition::FailFast).await, 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        #[test]
        fn prop_overlapping_scopes_never_run_concurrently(
            scopes in prop::collection::vec(prop::collection::vec(0usize..3, 0..3), 1..12)
        ) {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .worker_threads(4)
                .enable_all()
                .build()
                .unwrap();
            let violations = rt.block_on(run_scoped(scopes, ScopeAcquisition::Block));
            prop_assert_eq!(violations, 0);
        }
    }
}
