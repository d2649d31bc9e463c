//! In-process queue.
//!
//! All job records and counters live behind one `RwLock`. Dispatch order is
//! FIFO among ready jobs; jobs whose dependencies are unmet are parked and
//! re-examined whenever another job completes.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::dependency::DependencyState;
use crate::error::{DroverError, Result};
use crate::job::{Job, JobInfo, RetryState};
use crate::pool::{Runner, WorkerPool};
use crate::queue::{JobStream, Queue, QueueInfo, QueueStats, STREAM_BUFFER};
use crate::reaper::{LeaseReaper, LeaseStore};
use crate::retrier::{BasicRetryHandler, RetryHandler};
use crate::scope::ScopeManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Blocked,
    Running,
    RetryWaiting,
    Completed,
}

struct Record {
    job: Arc<dyn Job>,
    phase: Phase,
    holds_permit: bool,
    lease_renewed: Instant,
}

#[derive(Debug, Default)]
struct Counts {
    queued: usize,
    blocked: usize,
    running: usize,
    retry_waiting: usize,
    completed: usize,
}

impl Counts {
    fn slot(&mut self, phase: Phase) -> &mut usize {
        match phase {
            Phase::Queued => &mut self.queued,
            Phase::Blocked => &mut self.blocked,
            Phase::Running => &mut self.running,
            Phase::RetryWaiting => &mut self.retry_waiting,
            Phase::Completed => &mut self.completed,
        }
    }

    fn enter(&mut self, phase: Phase) {
        *self.slot(phase) += 1;
    }

    fn leave(&mut self, phase: Phase) {
        let slot = self.slot(phase);
        *slot = slot.saturating_sub(1);
    }
}

/// What `complete` decided for a finished job.
#[derive(Clone, Copy)]
enum Disposition {
    Done,
    Retry,
    Exhausted,
}

struct Storage {
    records: HashMap<String, Record>,
    ready: VecDeque<String>,
    blocked: HashSet<String>,
    counts: Counts,
    capacity: Option<Arc<Semaphore>>,
}

impl Storage {
    fn new(capacity: Option<Arc<Semaphore>>) -> Self {
        Self {
            records: HashMap::new(),
            ready: VecDeque::new(),
            blocked: HashSet::new(),
            counts: Counts::default(),
            capacity,
        }
    }

    fn insert(&mut self, job: Arc<dyn Job>, holds_permit: bool) {
        let id = job.id().to_string();
        self.records.insert(
            id.clone(),
            Record {
                job,
                phase: Phase::Queued,
                holds_permit,
                lease_renewed: Instant::now(),
            },
        );
        self.counts.enter(Phase::Queued);
        self.ready.push_back(id);
    }

    fn remove(&mut self, id: &str) -> Option<Record> {
        let record = self.records.remove(id)?;
        self.counts.leave(record.phase);
        self.blocked.remove(id);
        if record.holds_permit {
            if let Some(capacity) = &self.capacity {
                capacity.add_permits(1);
            }
        }
        Some(record)
    }

    fn phase(&self, id: &str) -> Option<Phase> {
        self.records.get(id).map(|r| r.phase)
    }

    fn transition(&mut self, id: &str, to: Phase) {
        let Some(record) = self.records.get_mut(id) else {
            return;
        };
        let from = record.phase;
        if from == to {
            return;
        }
        if from == Phase::Queued && record.holds_permit {
            record.holds_permit = false;
            if let Some(capacity) = &self.capacity {
                capacity.add_permits(1);
            }
        }
        if to == Phase::Running {
            record.lease_renewed = Instant::now();
        }
        record.phase = to;

        self.counts.leave(from);
        self.counts.enter(to);
        match (from, to) {
            (Phase::Blocked, _) => {
                self.blocked.remove(id);
            }
            (_, Phase::Blocked) => {
                self.blocked.insert(id.to_string());
            }
            _ => {}
        }
        if to == Phase::Queued {
            self.ready.push_back(id.to_string());
        }
    }

    /// Edges must all point at completed jobs before the manager is asked.
    fn evaluate(&self, job: &dyn Job) -> DependencyState {
        let edges_met = job.base().edges().iter().all(|edge| {
            self.records
                .get(edge)
                .is_some_and(|r| r.phase == Phase::Completed)
        });
        if edges_met {
            job.base().dependency_state()
        } else {
            DependencyState::Blocked
        }
    }

    /// Move blocked jobs whose dependencies are now met back to the ready set.
    fn reevaluate_blocked(&mut self) -> usize {
        let candidates: Vec<String> = self.blocked.iter().cloned().collect();
        let mut moved = 0;
        for id in candidates {
            let Some(job) = self.records.get(&id).map(|r| r.job.clone()) else {
                continue;
            };
            if self.evaluate(job.as_ref()) != DependencyState::Blocked {
                job.base().set_unsatisfiable(false);
                self.transition(&id, Phase::Queued);
                moved += 1;
            }
        }
        moved
    }

    /// Flag blocked jobs when nothing queued, running or retrying can unblock them.
    fn detect_stall(&self) {
        let counts = &self.counts;
        if counts.blocked == 0
            || counts.queued > 0
            || counts.running > 0
            || counts.retry_waiting > 0
        {
            return;
        }
        for id in &self.blocked {
            let Some(record) = self.records.get(id) else {
                continue;
            };
            if !record.job.status().unsatisfiable {
                record.job.base().set_unsatisfiable(true);
                tracing::warn!(
                    job_id = %id,
                    edges = ?record.job.base().edges(),
                    "Job dependencies cannot be satisfied by any stored job"
                );
            }
        }
    }

    fn stats(&self) -> QueueStats {
        let counts = &self.counts;
        QueueStats {
            running: counts.running,
            completed: counts.completed,
            pending: counts.queued + counts.blocked + counts.retry_waiting,
            blocked: counts.blocked,
            total: self.records.len(),
        }
    }
}

/// In-memory queue with an owned worker pool and retry handler.
///
/// ```rust,no_run
/// use drover_core::{wait_all, CancellationToken, LocalQueue, Queue, QueueConfig};
///
/// # async fn demo() -> drover_core::Result<()> {
/// let queue = LocalQueue::new(QueueConfig::builder().workers(12).capacity(50).build())?;
/// let ctx = CancellationToken::new();
///
/// queue.start(&ctx).await?;
/// wait_all(&ctx, queue.as_ref()).await;
/// queue.close(&ctx).await;
/// # Ok(())
/// # }
/// ```
pub struct LocalQueue {
    id: String,
    config: QueueConfig,
    me: Weak<LocalQueue>,
    storage: RwLock<Storage>,
    capacity: Option<Arc<Semaphore>>,
    dispatch: Notify,
    shutdown: CancellationToken,
    started: AtomicBool,
    closed: AtomicBool,
    runner: Mutex<Arc<dyn Runner>>,
    retry_handler: Mutex<Arc<dyn RetryHandler>>,
    scopes: Arc<ScopeManager>,
    reaper: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl LocalQueue {
    /// Create a queue with a [`WorkerPool`] and a [`BasicRetryHandler`]
    /// already bound to it.
    pub fn new(config: QueueConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let capacity = config.capacity.map(|n| Arc::new(Semaphore::new(n)));
        let runner: Arc<dyn Runner> = Arc::new(WorkerPool::new(config.worker.clone()));
        let retry_handler: Arc<dyn RetryHandler> =
            Arc::new(BasicRetryHandler::new(config.retry.clone()));

        let queue = Arc::new_cyclic(|me| Self {
            id: format!("queue.local.{}", uuid::Uuid::new_v4()),
            config,
            me: me.clone(),
            storage: RwLock::new(Storage::new(capacity.clone())),
            capacity,
            dispatch: Notify::new(),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            runner: Mutex::new(runner.clone()),
            retry_handler: Mutex::new(retry_handler.clone()),
            scopes: Arc::new(ScopeManager::new()),
            reaper: tokio::sync::Mutex::new(None),
        });

        runner.set_queue(queue.weak())?;
        retry_handler.set_queue(queue.weak())?;
        Ok(queue)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn retry_handler(&self) -> Arc<dyn RetryHandler> {
        lock(&self.retry_handler).clone()
    }

    /// Replace the retry handler. Fails once the queue has started.
    pub fn set_retry_handler(&self, handler: Arc<dyn RetryHandler>) -> Result<()> {
        let mut slot = lock(&self.retry_handler);
        if self.started.load(Ordering::SeqCst) {
            return Err(DroverError::State(
                "cannot set retry handler on active queue".to_string(),
            ));
        }
        handler.set_queue(self.weak())?;
        *slot = handler;
        Ok(())
    }

    fn weak(&self) -> Weak<dyn Queue> {
        self.me.clone()
    }

    fn notify_ready(&self, count: usize) {
        for _ in 0..count {
            self.dispatch.notify_one();
        }
    }

    /// Pop queued jobs until one is ready, parking blocked ones on the way.
    async fn dispatch_ready(&self) -> Option<Arc<dyn Job>> {
        let mut storage = self.storage.write().await;
        let mut unblocked = 0;
        let mut dispatched = None;

        while let Some(id) = storage.ready.pop_front() {
            let Some(record) = storage.records.get(&id) else {
                continue;
            };
            if record.phase != Phase::Queued {
                continue;
            }
            let job = record.job.clone();

            match storage.evaluate(job.as_ref()) {
                DependencyState::Ready => {
                    storage.transition(&id, Phase::Running);
                    job.base().mark_dispatched(None);
                    tracing::debug!(queue_id = %self.id, job_id = %id, "Dispatching job");
                    dispatched = Some(job);
                    break;
                }
                DependencyState::Blocked => {
                    storage.transition(&id, Phase::Blocked);
                    tracing::debug!(
                        queue_id = %self.id,
                        job_id = %id,
                        "Job blocked on dependencies"
                    );
                }
                DependencyState::Passed => {
                    job.mark_complete();
                    storage.transition(&id, Phase::Completed);
                    unblocked += storage.reevaluate_blocked();
                    tracing::debug!(
                        queue_id = %self.id,
                        job_id = %id,
                        "Dependency already satisfied, job completed without running"
                    );
                }
            }
        }

        if dispatched.is_none() {
            storage.detect_stall();
        }
        drop(storage);

        self.notify_ready(unblocked);
        dispatched
    }
}

#[async_trait]
impl Queue for LocalQueue {
    fn id(&self) -> &str {
        &self.id
    }

    async fn put(&self, ctx: &CancellationToken, job: Arc<dyn Job>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DroverError::State("queue is closed".to_string()));
        }
        if ctx.is_cancelled() {
            return Err(DroverError::Cancelled);
        }

        let id = job.id().to_string();
        if !self.config.allow_overwrite && self.storage.read().await.records.contains_key(&id) {
            return Err(DroverError::DuplicateJob(id));
        }

        let permit = match &self.capacity {
            Some(capacity) => {
                let permit = tokio::select! {
                    biased;
                    _ = ctx.cancelled() => return Err(DroverError::Cancelled),
                    _ = self.shutdown.cancelled() => {
                        return Err(DroverError::State("queue is closed".to_string()))
                    }
                    permit = capacity.clone().acquire_owned() => permit,
                };
                Some(permit.map_err(|_| DroverError::State("queue is closed".to_string()))?)
            }
            None => None,
        };

        let mut storage = self.storage.write().await;
        if ctx.is_cancelled() {
            return Err(DroverError::Cancelled);
        }
        match storage.phase(&id) {
            Some(_) if !self.config.allow_overwrite => {
                return Err(DroverError::DuplicateJob(id));
            }
            Some(Phase::Running) => {
                return Err(DroverError::State(format!(
                    "cannot overwrite running job '{}'",
                    id
                )));
            }
            Some(phase) => {
                if phase == Phase::RetryWaiting {
                    self.retry_handler().cancel(&id);
                }
                storage.remove(&id);
                tracing::debug!(queue_id = %self.id, job_id = %id, "Overwriting stored job");
            }
            None => {}
        }

        let holds_permit = match permit {
            Some(permit) => {
                permit.forget();
                true
            }
            None => false,
        };
        storage.insert(job, holds_permit);
        drop(storage);

        self.dispatch.notify_one();
        tracing::debug!(queue_id = %self.id, job_id = %id, "Job stored");
        Ok(())
    }

    async fn save(&self, _ctx: &CancellationToken, job: Arc<dyn Job>) -> Result<()> {
        let mut storage = self.storage.write().await;
        if let Some(record) = storage.records.get_mut(job.id()) {
            record.job = job;
            record.lease_renewed = Instant::now();
        }
        Ok(())
    }

    async fn get(&self, _ctx: &CancellationToken, id: &str) -> Option<Arc<dyn Job>> {
        let storage = self.storage.read().await;
        storage.records.get(id).map(|r| r.job.clone())
    }

    async fn next(&self, ctx: &CancellationToken) -> Option<Arc<dyn Job>> {
        loop {
            if ctx.is_cancelled() || self.shutdown.is_cancelled() {
                return None;
            }

            let notified = self.dispatch.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(job) = self.dispatch_ready().await {
                return Some(job);
            }

            tokio::select! {
                _ = ctx.cancelled() => return None,
                _ = self.shutdown.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    async fn complete(&self, ctx: &CancellationToken, job: Arc<dyn Job>) -> Result<()> {
        let id = job.id().to_string();
        let mut storage = self.storage.write().await;

        let Some(record) = storage.records.get_mut(&id) else {
            return Err(DroverError::JobNotFound(id));
        };
        if matches!(record.phase, Phase::Completed | Phase::RetryWaiting) {
            tracing::debug!(
                queue_id = %self.id,
                job_id = %id,
                "Ignoring repeated completion report"
            );
            return Ok(());
        }
        record.job = job.clone();

        let base = job.base();
        if !base.status().completed {
            base.mark_complete();
        }

        let retry = base.retry_info();
        let disposition = if retry.retryable && retry.needs_retry {
            if retry.can_retry() {
                Disposition::Retry
            } else {
                Disposition::Exhausted
            }
        } else {
            Disposition::Done
        };

        match disposition {
            Disposition::Retry => {
                base.reset_for_retry();
                base.update_retry(|r| r.state = RetryState::Waiting);
                storage.transition(&id, Phase::RetryWaiting);
            }
            Disposition::Exhausted => {
                base.update_retry(|r| {
                    r.needs_retry = false;
                    r.state = RetryState::ExhaustedAttempts;
                });
                base.add_error(format!(
                    "retry attempts exhausted after {} of {}",
                    retry.current_attempt, retry.max_attempts
                ));
                storage.transition(&id, Phase::Completed);
                tracing::warn!(
                    queue_id = %self.id,
                    job_id = %id,
                    attempts = retry.current_attempt,
                    "Job exhausted its retry attempts"
                );
            }
            Disposition::Done => {
                if retry.retryable && retry.current_attempt > 1 {
                    base.update_retry(|r| r.state = RetryState::Succeeded);
                }
                storage.transition(&id, Phase::Completed);
                tracing::debug!(
                    queue_id = %self.id,
                    job_id = %id,
                    errors = base.status().error_count,
                    "Job completed"
                );
            }
        }

        let unblocked = storage.reevaluate_blocked();
        storage.detect_stall();
        drop(storage);
        self.notify_ready(unblocked);

        if matches!(disposition, Disposition::Retry) {
            if let Err(e) = self.retry_handler().put(ctx, job.clone()).await {
                let mut storage = self.storage.write().await;
                if storage.phase(&id) == Some(Phase::RetryWaiting) {
                    base.add_error(format!("could not schedule retry: {}", e));
                    base.update_retry(|r| r.state = RetryState::NotRetrying);
                    base.mark_complete();
                    storage.transition(&id, Phase::Completed);
                    let unblocked = storage.reevaluate_blocked();
                    drop(storage);
                    self.notify_ready(unblocked);
                }
                return Err(e);
            }
        }

        Ok(())
    }

    async fn requeue(&self, _ctx: &CancellationToken, job: Arc<dyn Job>) -> Result<()> {
        let id = job.id().to_string();
        let mut storage = self.storage.write().await;

        let Some(record) = storage.records.get_mut(&id) else {
            return Err(DroverError::JobNotFound(id));
        };
        match record.phase {
            Phase::Queued => return Ok(()),
            Phase::Completed => {
                return Err(DroverError::State(format!(
                    "completed job '{}' cannot be requeued",
                    id
                )));
            }
            Phase::Running | Phase::Blocked | Phase::RetryWaiting => {}
        }
        if !same_job(&record.job, &job) {
            return Err(DroverError::State(format!(
                "job '{}' was replaced and this instance cannot be requeued",
                id
            )));
        }
        record.job = job.clone();
        job.base().release_claim();
        storage.transition(&id, Phase::Queued);
        drop(storage);

        self.dispatch.notify_one();
        tracing::debug!(queue_id = %self.id, job_id = %id, "Job requeued");
        Ok(())
    }

    async fn stats(&self, _ctx: &CancellationToken) -> QueueStats {
        self.storage.read().await.stats()
    }

    fn info(&self) -> QueueInfo {
        QueueInfo {
            started: self.started.load(Ordering::SeqCst),
            lock_timeout: self.config.lock_timeout,
        }
    }

    async fn job_info(&self, ctx: &CancellationToken) -> JobStream<JobInfo> {
        let jobs: Vec<Arc<dyn Job>> = {
            let storage = self.storage.read().await;
            storage.records.values().map(|r| r.job.clone()).collect()
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            for job in jobs {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    sent = tx.send(JobInfo::from_job(job.as_ref())) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }

    async fn results(&self, ctx: &CancellationToken) -> JobStream<Arc<dyn Job>> {
        let jobs: Vec<Arc<dyn Job>> = {
            let storage = self.storage.read().await;
            storage
                .records
                .values()
                .filter(|r| r.job.status().completed)
                .map(|r| r.job.clone())
                .collect()
        };

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            for job in jobs {
                tokio::select! {
                    _ = ctx.cancelled() => return,
                    sent = tx.send(job) => {
                        if sent.is_err() {
                            return;
                        }
                    }
                }
            }
        });
        rx
    }

    fn runner(&self) -> Arc<dyn Runner> {
        lock(&self.runner).clone()
    }

    fn set_runner(&self, runner: Arc<dyn Runner>) -> Result<()> {
        let mut slot = lock(&self.runner);
        if self.started.load(Ordering::SeqCst) {
            return Err(DroverError::State(
                "cannot set runner on active queue".to_string(),
            ));
        }
        runner.set_queue(self.weak())?;
        *slot = runner;
        Ok(())
    }

    fn scope_manager(&self) -> Arc<ScopeManager> {
        self.scopes.clone()
    }

    async fn start(&self, ctx: &CancellationToken) -> Result<()> {
        let mut reaper = self.reaper.lock().await;
        if self.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(DroverError::State("queue is closed".to_string()));
        }
        if ctx.is_cancelled() {
            return Err(DroverError::Cancelled);
        }

        // Flip under the runner slot so set_runner cannot race the start.
        let runner = {
            let slot = lock(&self.runner);
            self.started.store(true, Ordering::SeqCst);
            slot.clone()
        };

        if let Err(e) = runner.start(ctx).await {
            self.started.store(false, Ordering::SeqCst);
            return Err(DroverError::State(format!("starting worker pool: {}", e)));
        }
        if let Err(e) = self.retry_handler().start(ctx).await {
            self.started.store(false, Ordering::SeqCst);
            runner.close(ctx).await;
            return Err(DroverError::State(format!("starting retry handler: {}", e)));
        }

        let lease_reaper = LeaseReaper::new(
            self.me.clone(),
            self.config.reaper_interval,
            self.config.lock_timeout,
            self.shutdown.clone(),
        );
        *reaper = Some(tokio::spawn(async move { lease_reaper.run().await }));

        tracing::info!(
            queue_id = %self.id,
            capacity = ?self.config.capacity,
            "Queue started"
        );
        Ok(())
    }

    async fn close(&self, ctx: &CancellationToken) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.cancel();
        tracing::info!(queue_id = %self.id, "Closing queue, draining workers...");

        self.runner().close(ctx).await;
        self.retry_handler().close(ctx).await;

        if let Some(handle) = self.reaper.lock().await.take() {
            tokio::select! {
                _ = ctx.cancelled() => {}
                result = handle => {
                    if let Err(e) = result {
                        tracing::error!(error = %e, "Reaper task panicked");
                    }
                }
            }
        }

        tracing::info!(queue_id = %self.id, "Queue closed");
    }
}

#[async_trait]
impl LeaseStore for LocalQueue {
    async fn reclaim_expired(&self, lock_timeout: Duration) -> usize {
        let mut storage = self.storage.write().await;
        let expired: Vec<String> = storage
            .records
            .iter()
            .filter(|(_, r)| r.phase == Phase::Running && r.lease_renewed.elapsed() > lock_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(record) = storage.records.get(id) {
                tracing::warn!(
                    queue_id = %self.id,
                    job_id = %id,
                    owner = ?record.job.status().owner,
                    "Job lease expired, making it reclaimable"
                );
                record.job.base().release_claim();
            }
            storage.transition(id, Phase::Queued);
        }
        drop(storage);

        self.notify_ready(expired.len());
        expired.len()
    }

    async fn recheck_blocked(&self) -> usize {
        let mut storage = self.storage.write().await;
        if storage.blocked.is_empty() {
            return 0;
        }
        let moved = storage.reevaluate_blocked();
        storage.detect_stall();
        drop(storage);

        self.notify_ready(moved);
        moved
    }
}

impl Drop for LocalQueue {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Identity of the job object, ignoring vtable metadata.
fn same_job(a: &Arc<dyn Job>, b: &Arc<dyn Job>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
