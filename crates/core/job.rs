//! Job definition and related types.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::dependency::{Always, DependencyManager, DependencyState};
use crate::error::Result;

/// Result type for job runs.
pub type JobResult = std::result::Result<(), JobError>;

/// Error returned from [`Job::run`].
#[derive(Debug)]
pub struct JobError {
    /// Error message.
    pub message: String,
    /// Whether the job should be retried (only honoured for retryable jobs).
    pub retryable: bool,
}

impl JobError {
    /// Create a new retryable error.
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    /// Create a new non-retryable error.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl<E: std::error::Error> From<E> for JobError {
    fn from(err: E) -> Self {
        Self::retryable(err.to_string())
    }
}

/// Name and version of a job implementation, used by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobType {
    pub name: String,
    pub version: u32,
}

impl JobType {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// Mutable execution status of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatus {
    /// Claimed by a worker and not yet reported complete.
    pub in_progress: bool,
    /// Finished, successfully or not.
    pub completed: bool,
    /// Number of errors recorded across all attempts.
    pub error_count: usize,
    /// Bumped on every status transition.
    pub modification_count: u64,
    /// Error messages, oldest first.
    pub errors: Vec<String>,
    /// Identity of the runner holding the lease while in progress.
    pub owner: Option<String>,
    /// Set while the job is blocked and nothing in the queue can unblock it.
    pub unsatisfiable: bool,
}

impl JobStatus {
    pub fn has_errors(&self) -> bool {
        self.error_count > 0
    }
}

/// Creation and execution timestamps (Unix milliseconds).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeInfo {
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub ended_at: Option<i64>,
}

impl Default for TimeInfo {
    fn default() -> Self {
        Self {
            created_at: current_timestamp_millis(),
            started_at: None,
            ended_at: None,
        }
    }
}

impl TimeInfo {
    /// Wall-clock duration of the last run, if it finished.
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.ended_at) {
            (Some(start), Some(end)) if end >= start => {
                Some(Duration::from_millis((end - start) as u64))
            }
            _ => None,
        }
    }
}

/// How the wait between attempts grows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Backoff {
    /// Always wait `wait_between`.
    #[default]
    Fixed,
    /// Wait `wait_between * 2^(attempt - 1)`.
    Exponential,
}

/// Where a retryable job is in its retry lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryState {
    #[default]
    NotRetrying,
    /// Accepted by the retry handler, waiting out the delay.
    Waiting,
    /// Delay elapsed, job handed back to the queue.
    Retrying,
    /// A later attempt succeeded.
    Succeeded,
    /// Failed on its last permitted attempt.
    ExhaustedAttempts,
}

/// Retry policy plus the job's position in it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryInfo {
    /// Whether failed runs may be retried at all.
    pub retryable: bool,
    /// Set when the last run failed with a retryable error.
    pub needs_retry: bool,
    /// Total attempts permitted, including the first.
    pub max_attempts: u32,
    /// Attempt currently running or last run, starting at 1.
    pub current_attempt: u32,
    /// Base delay between attempts.
    #[serde(with = "duration_serde")]
    pub wait_between: Option<Duration>,
    pub backoff: Backoff,
    pub state: RetryState,
}

impl Default for RetryInfo {
    fn default() -> Self {
        Self {
            retryable: false,
            needs_retry: false,
            max_attempts: 1,
            current_attempt: 1,
            wait_between: Some(Duration::from_secs(1)),
            backoff: Backoff::Fixed,
            state: RetryState::NotRetrying,
        }
    }
}

impl RetryInfo {
    /// Retryable policy with the given attempt limit.
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            retryable: true,
            max_attempts,
            ..Default::default()
        }
    }

    /// Set the base delay between attempts.
    pub fn wait_between(mut self, delay: Duration) -> Self {
        self.wait_between = Some(delay);
        self
    }

    /// Set the backoff strategy.
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Check if another attempt is permitted.
    pub fn can_retry(&self) -> bool {
        self.retryable && self.current_attempt < self.max_attempts
    }

    /// Delay before the next attempt.
    pub fn next_retry_delay(&self) -> Duration {
        let base = self.wait_between.unwrap_or(Duration::ZERO);
        match self.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let exp = self.current_attempt.saturating_sub(1).min(16);
                base.saturating_mul(2u32.pow(exp))
            }
        }
    }
}

/// State shared by every job implementation.
///
/// Implementations embed a `JobBase` and return it from [`Job::base`]. All
/// fields use interior mutability so a job can be shared between the queue,
/// the worker running it and observers.
#[derive(Debug)]
pub struct JobBase {
    id: String,
    job_type: JobType,
    scopes: Vec<String>,
    timeout: Option<Duration>,
    status: Mutex<JobStatus>,
    time: Mutex<TimeInfo>,
    retry: Mutex<RetryInfo>,
    dependency: Mutex<Box<dyn DependencyManager>>,
}

impl JobBase {
    /// Create a base with an [`Always`] dependency and no retry policy.
    pub fn new(id: impl Into<String>, job_type: JobType) -> Self {
        Self {
            id: id.into(),
            job_type,
            scopes: Vec::new(),
            timeout: None,
            status: Mutex::new(JobStatus::default()),
            time: Mutex::new(TimeInfo::default()),
            retry: Mutex::new(RetryInfo::default()),
            dependency: Mutex::new(Box::new(Always::new())),
        }
    }

    /// Declare resource tokens this job needs exclusively while it runs.
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Abort the run (recorded as an error) if it takes longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retry(self, retry: RetryInfo) -> Self {
        *lock(&self.retry) = retry;
        self
    }

    pub fn with_dependency(self, dependency: Box<dyn DependencyManager>) -> Self {
        *lock(&self.dependency) = dependency;
        self
    }

    pub(crate) fn with_status(self, status: JobStatus, time: TimeInfo) -> Self {
        *lock(&self.status) = status;
        *lock(&self.time) = time;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn job_type(&self) -> &JobType {
        &self.job_type
    }

    pub fn scopes(&self) -> &[String] {
        &self.scopes
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn status(&self) -> JobStatus {
        lock(&self.status).clone()
    }

    pub fn time_info(&self) -> TimeInfo {
        lock(&self.time).clone()
    }

    pub fn retry_info(&self) -> RetryInfo {
        lock(&self.retry).clone()
    }

    /// Apply `f` to the retry info under its lock.
    pub fn update_retry<R>(&self, f: impl FnOnce(&mut RetryInfo) -> R) -> R {
        f(&mut lock(&self.retry))
    }

    /// Mark the job finished. Errors already recorded are kept.
    pub fn mark_complete(&self) {
        let mut status = lock(&self.status);
        status.completed = true;
        status.in_progress = false;
        status.modification_count += 1;
        drop(status);
        lock(&self.time).ended_at = Some(current_timestamp_millis());
    }

    pub fn add_error(&self, message: impl Into<String>) {
        let mut status = lock(&self.status);
        status.errors.push(message.into());
        status.error_count += 1;
    }

    /// Replace the dependency manager.
    pub fn set_dependency(&self, dependency: Box<dyn DependencyManager>) {
        *lock(&self.dependency) = dependency;
    }

    /// Add an edge to the current dependency manager.
    pub fn add_edge(&self, id: &str) -> Result<()> {
        lock(&self.dependency).add_edge(id)
    }

    pub fn edges(&self) -> Vec<String> {
        lock(&self.dependency).edges()
    }

    pub fn dependency_state(&self) -> DependencyState {
        lock(&self.dependency).state()
    }

    /// Run `f` against the dependency manager.
    pub fn with_dependency_ref<R>(&self, f: impl FnOnce(&dyn DependencyManager) -> R) -> R {
        f(lock(&self.dependency).as_ref())
    }

    pub(crate) fn mark_dispatched(&self, owner: Option<&str>) {
        let mut status = lock(&self.status);
        status.in_progress = true;
        status.completed = false;
        status.unsatisfiable = false;
        status.owner = owner.map(str::to_string);
        status.modification_count += 1;
        drop(status);
        let mut time = lock(&self.time);
        time.started_at = Some(current_timestamp_millis());
        time.ended_at = None;
    }

    pub(crate) fn set_owner(&self, owner: &str) {
        lock(&self.status).owner = Some(owner.to_string());
    }

    /// Drop the claim without finishing, making the job dispatchable again.
    pub(crate) fn release_claim(&self) {
        let mut status = lock(&self.status);
        status.in_progress = false;
        status.owner = None;
        status.modification_count += 1;
    }

    pub(crate) fn reset_for_retry(&self) {
        let mut status = lock(&self.status);
        status.completed = false;
        status.in_progress = false;
        status.owner = None;
        status.modification_count += 1;
    }

    pub(crate) fn set_unsatisfiable(&self, unsatisfiable: bool) {
        lock(&self.status).unsatisfiable = unsatisfiable;
    }
}

/// Capability set of a unit of work.
///
/// The queue and runner only see this trait; payloads are supplied by callers.
///
/// ```rust
/// use drover_core::{async_trait, CancellationToken, Job, JobBase, JobResult, JobType};
///
/// struct Compile {
///     base: JobBase,
///     target: String,
/// }
///
/// #[async_trait]
/// impl Job for Compile {
///     fn base(&self) -> &JobBase {
///         &self.base
///     }
///
///     async fn run(&self, _ctx: CancellationToken) -> JobResult {
///         println!("compiling {}", self.target);
///         Ok(())
///     }
/// }
///
/// let job = Compile {
///     base: JobBase::new("compile-1", JobType::new("compile", 0)),
///     target: "all".to_string(),
/// };
/// assert_eq!(job.id(), "compile-1");
/// ```
#[async_trait]
pub trait Job: Send + Sync + 'static {
    /// Shared identity and status.
    fn base(&self) -> &JobBase;

    /// Do the work. `ctx` is cancelled when the job is aborted or the pool
    /// shuts down past its grace period.
    async fn run(&self, ctx: CancellationToken) -> JobResult;

    /// Payload for interchange; jobs that are never persisted can keep the
    /// default.
    fn payload(&self) -> Result<serde_json::Value> {
        Ok(serde_json::Value::Null)
    }

    fn id(&self) -> &str {
        self.base().id()
    }

    fn job_type(&self) -> &JobType {
        self.base().job_type()
    }

    fn status(&self) -> JobStatus {
        self.base().status()
    }

    fn mark_complete(&self) {
        self.base().mark_complete()
    }

    fn add_error(&self, message: String) {
        self.base().add_error(message)
    }

    fn dependency_state(&self) -> DependencyState {
        self.base().dependency_state()
    }

    fn retry_info(&self) -> RetryInfo {
        self.base().retry_info()
    }

    fn scopes(&self) -> &[String] {
        self.base().scopes()
    }

    fn time_info(&self) -> TimeInfo {
        self.base().time_info()
    }
}

/// Read-only snapshot of a job for introspection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub time: TimeInfo,
    pub retry: RetryInfo,
    pub scopes: Vec<String>,
    pub edges: Vec<String>,
}

impl JobInfo {
    pub fn from_job(job: &dyn Job) -> Self {
        let base = job.base();
        Self {
            id: base.id().to_string(),
            job_type: base.job_type().clone(),
            status: base.status(),
            time: base.time_info(),
            retry: base.retry_info(),
            scopes: base.scopes().to_vec(),
            edges: base.edges(),
        }
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Get current Unix timestamp in milliseconds.
pub(crate) fn current_timestamp_millis() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Serde module for optional Duration serialization.
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match duration {
            Some(d) => (d.as_millis() as u64).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::CreatesFile;

    struct Noop {
        base: JobBase,
    }

    #[async_trait]
    impl Job for Noop {
        fn base(&self) -> &JobBase {
            &self.base
        }

        async fn run(&self, _ctx: CancellationToken) -> JobResult {
            Ok(())
        }
    }

    fn noop(id: &str) -> Noop {
        Noop {
            base: JobBase::new(id, JobType::new("noop", 0)),
        }
    }

    #[test]
    fn test_job_initial_state() {
        let job = noop("a");
        let status = job.status();
        assert!(!status.in_progress);
        assert!(!status.completed);
        assert_eq!(status.error_count, 0);
        assert!(job.base().time_info().started_at.is_none());
        assert_eq!(job.base().dependency_state(), DependencyState::Ready);
    }

    #[test]
    fn test_mark_complete_keeps_errors() {
        let job = noop("a");
        job.base().add_error("boom");
        job.mark_complete();

        let status = job.status();
        assert!(status.completed);
        assert!(status.has_errors());
        assert_eq!(status.errors, vec!["boom".to_string()]);
        assert!(job.base().time_info().ended_at.is_some());
    }

    #[test]
    fn test_modification_count_increments() {
        let job = noop("a");
        job.base().mark_dispatched(Some("pool-1"));
        assert_eq!(job.status().owner.as_deref(), Some("pool-1"));
        job.mark_complete();
        job.base().reset_for_retry();
        let status = job.status();
        assert_eq!(status.modification_count, 3);
        assert!(!status.completed);
        assert!(status.owner.is_none());
    }

    #[test]
    fn test_retry_info_can_retry() {
        let mut retry = RetryInfo::with_max_attempts(3);
        assert!(retry.can_retry());
        retry.current_attempt = 2;
        assert!(retry.can_retry());
        retry.current_attempt = 3;
        assert!(!retry.can_retry());
    }

    #[test]
    fn test_retry_info_not_retryable_by_default() {
        let retry = RetryInfo::default();
        assert!(!retry.retryable);
        assert!(!retry.can_retry());
    }

    #[test]
    fn test_exponential_backoff() {
        let mut retry = RetryInfo::with_max_attempts(5)
            .wait_between(Duration::from_millis(100))
            .backoff(Backoff::Exponential);

        assert_eq!(retry.next_retry_delay(), Duration::from_millis(100));
        retry.current_attempt = 2;
        assert_eq!(retry.next_retry_delay(), Duration::from_millis(200));
        retry.current_attempt = 4;
        assert_eq!(retry.next_retry_delay(), Duration::from_millis(800));
    }

    #[test]
    fn test_fixed_backoff() {
        let mut retry = RetryInfo::with_max_attempts(5).wait_between(Duration::from_millis(50));
        retry.current_attempt = 4;
        assert_eq!(retry.next_retry_delay(), Duration::from_millis(50));
    }

    #[test]
    fn test_dependency_edges_through_base() {
        let job = noop("pkg");
        job.base().set_dependency(Box::new(CreatesFile::new("/nonexistent/drover")));
        job.base().add_edge("compile").unwrap();
        assert!(job.base().add_edge("compile").is_err());
        assert_eq!(job.base().edges(), vec!["compile".to_string()]);
        job.base()
            .with_dependency_ref(|dep| assert_eq!(dep.dependency_type().name, "create-file"));
    }

    #[test]
    fn test_job_info_snapshot() {
        let job = Noop {
            base: JobBase::new("snap", JobType::new("noop", 2))
                .with_scopes(["db", "cache"])
                .with_retry(RetryInfo::with_max_attempts(2)),
        };
        let info = JobInfo::from_job(&job);
        job.mark_complete();

        assert_eq!(info.id, "snap");
        assert_eq!(info.job_type.version, 2);
        assert!(!info.status.completed);
        assert_eq!(info.scopes, vec!["db".to_string(), "cache".to_string()]);
        assert!(info.retry.retryable);
    }

    #[test]
    fn test_retry_info_serialization() {
        let retry = RetryInfo::with_max_attempts(4).wait_between(Duration::from_millis(1500));
        let json = serde_json::to_value(&retry).unwrap();
        assert_eq!(json["wait_between"], 1500);
        assert_eq!(json["state"], "NotRetrying");

        let back: RetryInfo = serde_json::from_value(json).unwrap();
        assert_eq!(back, retry);
    }

    #[test]
    fn test_time_info_duration() {
        let time = TimeInfo {
            created_at: 0,
            started_at: Some(1_000),
            ended_at: Some(1_250),
        };
        assert_eq!(time.duration(), Some(Duration::from_millis(250)));
        assert_eq!(TimeInfo::default().duration(), None);
    }

    #[test]
    fn test_job_error_constructors() {
        assert!(JobError::retryable("flaky").retryable);
        assert!(!JobError::fatal("bad input").retryable);
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk");
        let err: JobError = io.into();
        assert!(err.retryable);
        assert_eq!(err.message, "disk");
    }
}
