//! Individual worker loop.
//!
//! A worker fetches one job at a time, holds its scopes and lease while it
//! runs, and reports the outcome back to the queue. Every run happens in its
//! own task, so a panicking job is recorded as a failure instead of taking
//! the worker down.

use std::any::Any;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::ScopeAcquisition;
use crate::heartbeat::LeasePinger;
use crate::job::{Job, JobError};
use crate::pool::RunningJobs;
use crate::queue::Queue;
use crate::scope::ScopeGuard;

/// How a single run ended.
#[derive(Debug)]
enum Outcome {
    Success,
    Failed(JobError),
    Panicked(String),
    TimedOut(Duration),
    Cancelled,
}

/// Individual worker that processes jobs.
pub struct Worker {
    id: usize,
    pool_id: String,
    queue: Weak<dyn Queue>,
    running: Arc<RunningJobs>,
    scope_acquisition: ScopeAcquisition,
    scope_backoff: Duration,
    ping_interval: Duration,
    drain: CancellationToken,
    run: CancellationToken,
}

impl Worker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        pool_id: String,
        queue: Weak<dyn Queue>,
        running: Arc<RunningJobs>,
        scope_acquisition: ScopeAcquisition,
        scope_backoff: Duration,
        ping_interval: Duration,
        drain: CancellationToken,
        run: CancellationToken,
    ) -> Self {
        Self {
            id,
            pool_id,
            queue,
            running,
            scope_acquisition,
            scope_backoff,
            ping_interval,
            drain,
            run,
        }
    }

    pub async fn run(&self) {
        tracing::debug!(worker_id = self.id, pool_id = %self.pool_id, "Worker started");

        loop {
            let Some(queue) = self.queue.upgrade() else {
                break;
            };
            let Some(job) = queue.next(&self.drain).await else {
                break;
            };
            self.process(queue.as_ref(), job).await;
        }

        tracing::debug!(worker_id = self.id, "Worker stopped");
    }

    async fn process(&self, queue: &dyn Queue, job: Arc<dyn Job>) {
        let job_id = job.id().to_string();
        job.base().set_owner(&self.pool_id);

        // Lease renewal covers the scope wait too.
        let stop_ping = self.run.child_token();
        let _stop_ping_on_exit = stop_ping.clone().drop_guard();
        let pinger = LeasePinger::new(
            self.queue.clone(),
            job.clone(),
            self.ping_interval,
            stop_ping.clone(),
        );
        let ping_handle = tokio::spawn(pinger.run());

        let Some(scopes) = self.acquire_scopes(queue, &job).await else {
            return;
        };

        tracing::debug!(
            worker_id = self.id,
            job_id = %job_id,
            job_type = %job.job_type().name,
            "Processing job"
        );

        let token = self.run.child_token();
        self.running.register(&job_id, token.clone());
        let outcome = execute(job.clone(), token).await;
        let aborted = self.running.finish(&job_id);

        stop_ping.cancel();
        if let Err(e) = ping_handle.await {
            tracing::error!(worker_id = self.id, error = %e, "Lease pinger panicked");
        }

        if matches!(outcome, Outcome::Cancelled) && !aborted {
            // Pool is shutting down past its grace period; the job did not finish.
            tracing::warn!(worker_id = self.id, job_id = %job_id, "Job interrupted by shutdown");
            if let Err(e) = queue.requeue(&self.run, job).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to requeue interrupted job");
            }
            return;
        }

        self.record(job.as_ref(), outcome);
        job.mark_complete();

        if let Err(e) = queue.complete(&self.run, job).await {
            tracing::error!(
                worker_id = self.id,
                job_id = %job_id,
                error = %e,
                "Failed to report job completion"
            );
        }
        drop(scopes);
    }

    /// Take the job's scope tokens, or put the job back and return `None`.
    async fn acquire_scopes(&self, queue: &dyn Queue, job: &Arc<dyn Job>) -> Option<ScopeGuard> {
        let job_id = job.id();
        let tokens = job.base().scopes();
        let manager = queue.scope_manager();

        let acquired = match self.scope_acquisition {
            ScopeAcquisition::Block => {
                ScopeGuard::acquire(manager, job_id, tokens, &self.run).await
            }
            ScopeAcquisition::FailFast => ScopeGuard::try_acquire(manager, job_id, tokens),
        };

        match acquired {
            Ok(guard) => Some(guard),
            Err(e) => {
                tracing::debug!(
                    worker_id = self.id,
                    job_id = %job_id,
                    error = %e,
                    "Scopes unavailable, re-queuing job"
                );
                if let Err(e) = queue.requeue(&self.run, job.clone()).await {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to requeue job");
                }
                if self.scope_acquisition == ScopeAcquisition::FailFast {
                    tokio::select! {
                        _ = self.drain.cancelled() => {}
                        _ = tokio::time::sleep(self.scope_backoff) => {}
                    }
                }
                None
            }
        }
    }

    fn record(&self, job: &dyn Job, outcome: Outcome) {
        let base = job.base();
        let retryable = base.retry_info().retryable;

        match outcome {
            Outcome::Success => {
                base.update_retry(|r| r.needs_retry = false);
                tracing::debug!(
                    worker_id = self.id,
                    job_id = %job.id(),
                    "Job completed successfully"
                );
            }
            Outcome::Failed(err) => {
                let retry = err.retryable && retryable;
                base.add_error(err.message.clone());
                base.update_retry(|r| r.needs_retry = retry);
                tracing::warn!(
                    worker_id = self.id,
                    job_id = %job.id(),
                    error = %err.message,
                    retry = retry,
                    "Job failed"
                );
            }
            Outcome::Panicked(message) => {
                base.add_error(format!("job panicked: {}", message));
                base.update_retry(|r| r.needs_retry = false);
                tracing::error!(
                    worker_id = self.id,
                    job_id = %job.id(),
                    panic = %message,
                    "Job panicked"
                );
            }
            Outcome::TimedOut(limit) => {
                base.add_error(format!("job timed out after {:?}", limit));
                base.update_retry(|r| r.needs_retry = retryable);
                tracing::warn!(
                    worker_id = self.id,
                    job_id = %job.id(),
                    timeout_ms = limit.as_millis() as u64,
                    "Job timed out"
                );
            }
            Outcome::Cancelled => {
                base.add_error("job aborted");
                base.update_retry(|r| r.needs_retry = false);
                tracing::info!(worker_id = self.id, job_id = %job.id(), "Job aborted");
            }
        }
    }
}

/// Run the job in its own task so panics and aborts stay contained.
async fn execute(job: Arc<dyn Job>, token: CancellationToken) -> Outcome {
    let timeout = job.base().timeout();
    let mut tasks = JoinSet::new();
    let ctx = token.clone();
    tasks.spawn(async move { job.run(ctx).await });

    let joined = async {
        match tasks.join_next().await {
            Some(Ok(Ok(()))) => Outcome::Success,
            Some(Ok(Err(err))) => Outcome::Failed(err),
            Some(Err(e)) if e.is_panic() => Outcome::Panicked(panic_message(e.into_panic())),
            _ => Outcome::Cancelled,
        }
    };
    let deadline = async {
        match timeout {
            Some(limit) => {
                tokio::time::sleep(limit).await;
                limit
            }
            None => std::future::pending().await,
        }
    };

    let outcome = tokio::select! {
        outcome = joined => outcome,
        _ = token.cancelled() => Outcome::Cancelled,
        limit = deadline => {
            token.cancel();
            Outcome::TimedOut(limit)
        }
    };
    // Dropping the set aborts a run that is still going.
    drop(tasks);
    outcome
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobBase, JobType};
    use crate::testing::{Behavior, TestJob};

    fn job(behavior: Behavior) -> Arc<dyn Job> {
        TestJob::new(JobBase::new("w", JobType::new("test", 0)), behavior)
    }

    #[tokio::test]
    async fn test_execute_success_and_failure() {
        let outcome = execute(job(Behavior::Succeed), CancellationToken::new()).await;
        assert!(matches!(outcome, Outcome::Success));

        let outcome = execute(
            job(Behavior::Fail { retryable: false }),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(outcome, Outcome::Failed(e) if !e.retryable));
    }

    #[tokio::test]
    async fn test_execute_contains_panic() {
        let outcome = execute(job(Behavior::Panic), CancellationToken::new()).await;
        match outcome {
            Outcome::Panicked(message) => assert!(message.contains("test job panicked")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_execute_cancelled() {
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            canceller.cancel();
        });
        let outcome = execute(job(Behavior::Hang), token).await;
        assert!(matches!(outcome, Outcome::Cancelled));
    }

    #[tokio::test]
    async fn test_execute_timeout() {
        let slow: Arc<dyn Job> = TestJob::new(
            JobBase::new("slow", JobType::new("test", 0)).with_timeout(Duration::from_millis(5)),
            Behavior::Hang,
        );
        let outcome = execute(slow, CancellationToken::new()).await;
        assert!(matches!(outcome, Outcome::TimedOut(d) if d == Duration::from_millis(5)));
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(42u8)), "unknown panic payload");
    }
}
