//! Retry handling for jobs that failed with a retryable error.
//!
//! The queue hands such jobs to a [`RetryHandler`] instead of finishing them.
//! The handler waits out the job's retry delay, advances its attempt counter
//! and returns it to the queue.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::RetryConfig;
use crate::error::{DroverError, Result};
use crate::job::{Job, RetryState};
use crate::queue::Queue;

/// Schedules further attempts of retryable jobs.
#[async_trait]
pub trait RetryHandler: Send + Sync {
    /// Bind the handler to a queue. Fails once started.
    fn set_queue(&self, queue: Weak<dyn Queue>) -> Result<()>;

    fn started(&self) -> bool;

    async fn start(&self, ctx: &CancellationToken) -> Result<()>;

    /// Accept a job for retry. A job already waiting is not scheduled twice.
    async fn put(&self, ctx: &CancellationToken, job: Arc<dyn Job>) -> Result<()>;

    /// Drop the waiting retry for `job_id`. Returns whether one was waiting.
    fn cancel(&self, job_id: &str) -> bool;

    /// Number of jobs waiting for their next attempt.
    fn pending(&self) -> usize;

    /// Drop waiting retries and stop. A closed handler cannot be restarted.
    async fn close(&self, ctx: &CancellationToken);
}

/// A retry sleeping out its delay.
struct Waiting {
    seq: u64,
    token: CancellationToken,
}

/// Retry handler that sleeps out each job's delay in its own task.
pub struct BasicRetryHandler {
    config: RetryConfig,
    queue: Mutex<Option<Weak<dyn Queue>>>,
    waiting: Arc<Mutex<HashMap<String, Waiting>>>,
    next_seq: AtomicU64,
    tasks: Mutex<JoinSet<()>>,
    token: Mutex<Option<CancellationToken>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl BasicRetryHandler {
    /// Create a new BasicRetryHandler.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            queue: Mutex::new(None),
            waiting: Arc::new(Mutex::new(HashMap::new())),
            next_seq: AtomicU64::new(0),
            tasks: Mutex::new(JoinSet::new()),
            token: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RetryHandler for BasicRetryHandler {
    fn set_queue(&self, queue: Weak<dyn Queue>) -> Result<()> {
        let mut slot = lock(&self.queue);
        if self.started() {
            return Err(DroverError::RetryHandler(
                "cannot change queue of a started retry handler".to_string(),
            ));
        }
        *slot = Some(queue);
        Ok(())
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn start(&self, ctx: &CancellationToken) -> Result<()> {
        let mut token = lock(&self.token);
        if self.closed.load(Ordering::SeqCst) {
            return Err(DroverError::RetryHandler("retry handler is closed".to_string()));
        }
        if token.is_some() {
            return Ok(());
        }
        if lock(&self.queue).is_none() {
            return Err(DroverError::RetryHandler(
                "retry handler has no queue".to_string(),
            ));
        }
        *token = Some(ctx.child_token());
        self.started.store(true, Ordering::SeqCst);
        tracing::debug!(max_capacity = self.config.max_capacity, "Retry handler started");
        Ok(())
    }

    async fn put(&self, ctx: &CancellationToken, job: Arc<dyn Job>) -> Result<()> {
        if ctx.is_cancelled() {
            return Err(DroverError::Cancelled);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(DroverError::RetryHandler("retry handler is closed".to_string()));
        }
        let token = lock(&self.token)
            .clone()
            .ok_or_else(|| DroverError::RetryHandler("retry handler is not started".to_string()))?;
        let queue = lock(&self.queue)
            .clone()
            .ok_or_else(|| DroverError::RetryHandler("retry handler has no queue".to_string()))?;

        let job_id = job.id().to_string();
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let job_token = token.child_token();
        {
            let mut waiting = lock(&self.waiting);
            if waiting.contains_key(&job_id) {
                tracing::debug!(job_id = %job_id, "Retry already scheduled");
                return Ok(());
            }
            if waiting.len() >= self.config.max_capacity {
                return Err(DroverError::RetryHandler(format!(
                    "retry capacity of {} reached",
                    self.config.max_capacity
                )));
            }
            waiting.insert(
                job_id.clone(),
                Waiting {
                    seq,
                    token: job_token.clone(),
                },
            );
        }

        let delay = job.base().retry_info().next_retry_delay();
        tracing::debug!(
            job_id = %job_id,
            attempt = job.base().retry_info().current_attempt,
            delay_ms = delay.as_millis() as u64,
            "Job scheduled for retry"
        );

        let waiting = self.waiting.clone();
        let mut tasks = lock(&self.tasks);
        // Reap finished retries so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let slept = tokio::select! {
                _ = job_token.cancelled() => false,
                _ = tokio::time::sleep(delay) => true,
            };
            let current = {
                let mut waiting = lock(&waiting);
                // A cancelled entry may already have been replaced by a newer retry.
                let current = waiting.get(&job_id).is_some_and(|w| w.seq == seq);
                if current {
                    waiting.remove(&job_id);
                }
                current
            };
            if !slept || !current {
                return;
            }

            job.base().update_retry(|r| {
                r.current_attempt += 1;
                r.needs_retry = false;
                r.state = RetryState::Retrying;
            });

            let Some(queue) = queue.upgrade() else {
                return;
            };
            if let Err(e) = queue.requeue(&token, job).await {
                tracing::error!(job_id = %job_id, error = %e, "Failed to requeue job for retry");
            }
        });
        Ok(())
    }

    fn cancel(&self, job_id: &str) -> bool {
        let Some(entry) = lock(&self.waiting).remove(job_id) else {
            return false;
        };
        entry.token.cancel();
        tracing::debug!(job_id = %job_id, "Waiting retry dropped");
        true
    }

    fn pending(&self) -> usize {
        lock(&self.waiting).len()
    }

    async fn close(&self, ctx: &CancellationToken) {
        let token = {
            let mut slot = lock(&self.token);
            self.closed.store(true, Ordering::SeqCst);
            slot.take()
        };
        let Some(token) = token else {
            return;
        };
        let dropped = std::mem::take(&mut *lock(&self.waiting)).len();
        token.cancel();

        let mut tasks = std::mem::take(&mut *lock(&self.tasks));
        let finished = tokio::select! {
            _ = ctx.cancelled() => false,
            _ = async { while tasks.join_next().await.is_some() {} } => true,
        };
        if !finished {
            tasks.abort_all();
        }

        if dropped > 0 {
            tracing::info!(dropped = dropped, "Retry handler closed with waiting retries");
        }
        self.started.store(false, Ordering::SeqCst);
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
