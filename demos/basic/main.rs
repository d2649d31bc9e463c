//! Basic example using the in-memory queue.
//!
//! This example demonstrates:
//! - Creating a bounded local queue with a worker pool
//! - Jobs sharing a scope so they never run at the same time
//! - A dependency edge ordering a digest after the individual sends
//! - A flaky job recovered by the retry handler
//!
//! Run with: `cargo run -p demo-basic`

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use drover_core::{
    async_trait, wait_all, CancellationToken, Job, JobBase, JobError, JobResult, JobType,
    LocalQueue, Queue, QueueConfig, RetryInfo,
};

/// Email notification job payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EmailPayload {
    to: String,
    subject: String,
}

struct EmailJob {
    base: JobBase,
    payload: EmailPayload,
    /// Fail this many runs before succeeding.
    flaky_runs: u32,
    runs: AtomicU32,
}

impl EmailJob {
    fn new(id: &str, to: &str, subject: &str) -> Self {
        Self {
            base: JobBase::new(id, JobType::new("send_email", 1))
                .with_scopes(["smtp"])
                .with_timeout(Duration::from_secs(5)),
            payload: EmailPayload {
                to: to.to_string(),
                subject: subject.to_string(),
            },
            flaky_runs: 0,
            runs: AtomicU32::new(0),
        }
    }

    fn flaky(mut self, runs: u32) -> Self {
        self.base = self.base.with_retry(
            RetryInfo::with_max_attempts(runs + 1).wait_between(Duration::from_millis(200)),
        );
        self.flaky_runs = runs;
        self
    }
}

#[async_trait]
impl Job for EmailJob {
    fn base(&self) -> &JobBase {
        &self.base
    }

    async fn run(&self, ctx: CancellationToken) -> JobResult {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        println!("[email] sending to: {} (attempt {})", self.payload.to, run);
        println!("        subject: {}", self.payload.subject);

        tokio::select! {
            _ = ctx.cancelled() => return Err(JobError::fatal("cancelled")),
            _ = tokio::time::sleep(Duration::from_millis(300)) => {}
        }

        if run <= self.flaky_runs {
            println!("[email] smtp timeout, will retry\n");
            return Err(JobError::retryable("smtp timeout"));
        }
        println!("[email] sent\n");
        Ok(())
    }

    fn payload(&self) -> drover_core::Result<serde_json::Value> {
        Ok(serde_json::to_value(&self.payload)?)
    }
}

/// Summary sent once every individual email is out.
struct DigestJob {
    base: JobBase,
}

#[async_trait]
impl Job for DigestJob {
    fn base(&self) -> &JobBase {
        &self.base
    }

    async fn run(&self, _ctx: CancellationToken) -> JobResult {
        println!("[digest] all notifications delivered\n");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> drover_core::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("drover local queue example\n");

    let queue = LocalQueue::new(QueueConfig::builder().workers(2).capacity(16).build())?;
    let ctx = CancellationToken::new();

    let emails = vec![
        EmailJob::new("email-1", "alice@example.com", "Welcome!"),
        EmailJob::new("email-2", "bob@example.com", "Your order shipped").flaky(1),
        EmailJob::new("email-3", "charlie@example.com", "Password reset"),
    ];

    let digest = DigestJob {
        base: JobBase::new("digest", JobType::new("digest", 1)),
    };
    for email in &emails {
        digest.base().add_edge(email.id())?;
    }

    println!("Enqueueing {} jobs...\n", emails.len() + 1);
    queue.put(&ctx, Arc::new(digest)).await?;
    for email in emails {
        println!("  enqueued: {}", email.id());
        queue.put(&ctx, Arc::new(email)).await?;
    }

    let stats = queue.stats(&ctx).await;
    println!("\nPending: {}, blocked: {}", stats.pending, stats.blocked);
    println!("\nStarting worker pool (2 workers)...");
    println!("Press Ctrl+C to stop\n");

    let shutdown = ctx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        shutdown.cancel();
    });

    queue.start(&ctx).await?;
    if !wait_all(&ctx, queue.as_ref()).await {
        println!("Interrupted before all jobs finished");
    }

    let mut results = queue.results(&ctx).await;
    while let Some(job) = results.recv().await {
        let status = job.status();
        println!(
            "  {}: completed with {} error(s), attempt {}",
            job.id(),
            status.error_count,
            job.retry_info().current_attempt
        );
    }

    queue.close(&CancellationToken::new()).await;
    Ok(())
}
