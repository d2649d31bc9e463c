//! Helpers that block until queued work is done.

use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::queue::Queue;

/// Poll interval used by [`wait_all`].
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_millis(100);

/// Wait until the queue has no pending or running jobs.
///
/// Returns `false` if `ctx` was cancelled first.
pub async fn wait_all(ctx: &CancellationToken, queue: &dyn Queue) -> bool {
    wait_all_interval(ctx, queue, DEFAULT_WAIT_INTERVAL).await
}

/// [`wait_all`] with an explicit poll interval.
pub async fn wait_all_interval(
    ctx: &CancellationToken,
    queue: &dyn Queue,
    interval: Duration,
) -> bool {
    loop {
        if queue.stats(ctx).await.is_idle() {
            return true;
        }
        tokio::select! {
            _ = ctx.cancelled() => return false,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}

/// Wait until the job with `id` is completed.
///
/// Returns `false` if `ctx` was cancelled first or the job is not stored.
pub async fn wait_job(
    ctx: &CancellationToken,
    queue: &dyn Queue,
    id: &str,
    interval: Duration,
) -> bool {
    loop {
        match queue.get(ctx, id).await {
            Some(job) if job.status().completed => return true,
            Some(_) => {}
            None => return false,
        }
        tokio::select! {
            _ = ctx.cancelled() => return false,
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
