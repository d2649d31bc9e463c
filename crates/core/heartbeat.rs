//! Lease renewal for running jobs.
//!
//! While a job runs, its worker periodically saves it back to the queue. Each
//! save renews the job's lease; a job whose lease lapses is reclaimed by the
//! reaper and dispatched again.

use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::job::Job;
use crate::queue::Queue;

/// Periodically saves one running job.
pub struct LeasePinger {
    queue: Weak<dyn Queue>,
    job: Arc<dyn Job>,
    interval: Duration,
    stop: CancellationToken,
}

impl LeasePinger {
    pub fn new(
        queue: Weak<dyn Queue>,
        job: Arc<dyn Job>,
        interval: Duration,
        stop: CancellationToken,
    ) -> Self {
        Self {
            queue,
            job,
            interval,
            stop,
        }
    }

    /// Run until the stop token fires or the queue is dropped.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately; the claim itself set the lease.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => break,
                _ = interval.tick() => {}
            }

            let Some(queue) = self.queue.upgrade() else {
                break;
            };
            if let Err(e) = queue.save(&self.stop, self.job.clone()).await {
                tracing::warn!(
                    job_id = %self.job.id(),
                    error = %e,
                    "Failed to renew job lease"
                );
            } else {
                tracing::trace!(job_id = %self.job.id(), "Job lease renewed");
            }
        }
    }
}

/// Lease renewal interval for a given lock timeout.
pub fn ping_interval(lock_timeout: Duration) -> Duration {
    (lock_timeout / 4).max(Duration::from_millis(1))
}

/// Generate a unique pool ID.
pub fn generate_pool_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    let ts = current_timestamp();
    format!("{}-{}-{}", host, pid, ts)
}

/// Get current Unix timestamp in seconds.
fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
