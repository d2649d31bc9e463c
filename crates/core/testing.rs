//! Job and runner doubles shared by the unit tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{DroverError, Result};
use crate::job::{Job, JobBase, JobError, JobResult, JobType};
use crate::pool::Runner;
use crate::queue::Queue;

#[derive(Debug, Clone, Copy)]
pub(crate) enum Behavior {
    Succeed,
    Fail { retryable: bool },
    /// Fail with a retryable error on the first `n` runs, then succeed.
    FailTimes(usize),
    Panic,
    Sleep(Duration),
    /// Never finish unless cancelled or aborted.
    Hang,
}

/// Records the peak number of concurrent holders per scope token.
#[derive(Debug, Default)]
pub(crate) struct OverlapTracker {
    active: Mutex<HashMap<String, usize>>,
    violations: AtomicUsize,
}

impl OverlapTracker {
    fn enter(&self, tokens: &[String]) {
        let mut active = self.active.lock().unwrap();
        for token in tokens {
            let count = active.entry(token.clone()).or_default();
            *count += 1;
            if *count > 1 {
                self.violations.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    fn exit(&self, tokens: &[String]) {
        let mut active = self.active.lock().unwrap();
        for token in tokens {
            if let Some(count) = active.get_mut(token) {
                *count -= 1;
            }
        }
    }

    pub(crate) fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }
}

pub(crate) struct TestJob {
    base: JobBase,
    behavior: Behavior,
    runs: AtomicUsize,
    tracker: Option<Arc<OverlapTracker>>,
}

impl TestJob {
    pub(crate) fn new(base: JobBase, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            base,
            behavior,
            runs: AtomicUsize::new(0),
            tracker: None,
        })
    }

    pub(crate) fn ok(id: &str) -> Arc<Self> {
        Self::new(JobBase::new(id, JobType::new("test", 0)), Behavior::Succeed)
    }

    pub(crate) fn tracked(
        base: JobBase,
        behavior: Behavior,
        tracker: Arc<OverlapTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base,
            behavior,
            runs: AtomicUsize::new(0),
            tracker: Some(tracker),
        })
    }

    pub(crate) fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Job for TestJob {
    fn base(&self) -> &JobBase {
        &self.base
    }

    async fn run(&self, ctx: CancellationToken) -> JobResult {
        let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(tracker) = &self.tracker {
            tracker.enter(self.base.scopes());
        }

        let result = match self.behavior {
            Behavior::Succeed => Ok(()),
            Behavior::Fail { retryable: true } => Err(JobError::retryable("test job failed")),
            Behavior::Fail { retryable: false } => Err(JobError::fatal("test job failed")),
            Behavior::FailTimes(n) if run <= n => Err(JobError::retryable("test job failed")),
            Behavior::FailTimes(_) => Ok(()),
            Behavior::Panic => panic!("test job panicked"),
            Behavior::Sleep(d) => {
                tokio::select! {
                    _ = ctx.cancelled() => Err(JobError::fatal("cancelled")),
                    _ = tokio::time::sleep(d) => Ok(()),
                }
            }
            Behavior::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        };

        if let Some(tracker) = &self.tracker {
            tracker.exit(self.base.scopes());
        }
        result
    }
}

/// Runner that only counts lifecycle calls.
#[derive(Default)]
pub(crate) struct TestRunner {
    fail: bool,
    started: AtomicBool,
    starts: AtomicUsize,
    closes: AtomicUsize,
}

impl TestRunner {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub(crate) fn start_calls(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runner for TestRunner {
    fn id(&self) -> &str {
        "test-runner"
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn set_queue(&self, _queue: Weak<dyn Queue>) -> Result<()> {
        if self.started() {
            return Err(DroverError::State("runner already started".to_string()));
        }
        Ok(())
    }

    async fn start(&self, _ctx: &CancellationToken) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(DroverError::State("runner refused to start".to_string()));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self, _ctx: &CancellationToken) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
    }
}
