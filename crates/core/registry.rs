//! Type registry and serializable job interchange.
//!
//! A [`Registry`] maps type names to constructors so a [`JobInterchange`]
//! read back from storage or the wire can be turned into a live job again.
//! Registries are plain values; each queue or service builds its own.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::dependency::{Always, CreatesFile, DependencyManager, DependencyType};
use crate::error::{DroverError, Result};
use crate::job::{duration_serde, Job, JobBase, JobStatus, JobType, RetryInfo, TimeInfo};

/// Builds a job from its restored base and payload.
pub type JobFactory = fn(JobBase, Value) -> Result<Arc<dyn Job>>;

/// Builds a dependency manager from its serialized body.
pub type DependencyFactory = fn(Value) -> Result<Box<dyn DependencyManager>>;

/// Constructors for job and dependency types, keyed by name.
#[derive(Debug, Default, Clone)]
pub struct Registry {
    jobs: HashMap<String, (u32, JobFactory)>,
    dependencies: HashMap<String, (u32, DependencyFactory)>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the bundled dependency managers.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .dependencies
            .insert(Always::NAME.to_string(), (0, always_factory as DependencyFactory));
        registry
            .dependencies
            .insert(CreatesFile::NAME.to_string(), (0, creates_file_factory as DependencyFactory));
        registry
    }

    pub fn register_job(&mut self, job_type: JobType, factory: JobFactory) -> Result<()> {
        if self.jobs.contains_key(&job_type.name) {
            return Err(DroverError::Registry(format!(
                "job type '{}' is already registered",
                job_type.name
            )));
        }
        self.jobs.insert(job_type.name, (job_type.version, factory));
        Ok(())
    }

    pub fn register_dependency(
        &mut self,
        dependency_type: DependencyType,
        factory: DependencyFactory,
    ) -> Result<()> {
        if self.dependencies.contains_key(&dependency_type.name) {
            return Err(DroverError::Registry(format!(
                "dependency type '{}' is already registered",
                dependency_type.name
            )));
        }
        self.dependencies
            .insert(dependency_type.name, (dependency_type.version, factory));
        Ok(())
    }

    /// Registered job types, sorted by name.
    pub fn job_types(&self) -> Vec<JobType> {
        let mut types: Vec<JobType> = self
            .jobs
            .iter()
            .map(|(name, (version, _))| JobType::new(name.clone(), *version))
            .collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        types
    }

    /// Registered dependency types, sorted by name.
    pub fn dependency_types(&self) -> Vec<DependencyType> {
        let mut types: Vec<DependencyType> = self
            .dependencies
            .iter()
            .map(|(name, (version, _))| DependencyType::new(name.clone(), *version))
            .collect();
        types.sort_by(|a, b| a.name.cmp(&b.name));
        types
    }

    pub fn build_job(&self, base: JobBase, payload: Value) -> Result<Arc<dyn Job>> {
        let job_type = base.job_type().clone();
        let (version, factory) = self.jobs.get(&job_type.name).ok_or_else(|| {
            DroverError::Registry(format!("job type '{}' is not registered", job_type.name))
        })?;
        if *version != job_type.version {
            return Err(DroverError::Registry(format!(
                "job type '{}' version mismatch: registered {}, got {}",
                job_type.name, version, job_type.version
            )));
        }
        factory(base, payload)
    }

    pub fn build_dependency(
        &self,
        dependency_type: &DependencyType,
        body: Value,
    ) -> Result<Box<dyn DependencyManager>> {
        let (version, factory) = self.dependencies.get(&dependency_type.name).ok_or_else(|| {
            DroverError::Registry(format!(
                "dependency type '{}' is not registered",
                dependency_type.name
            ))
        })?;
        if *version != dependency_type.version {
            return Err(DroverError::Registry(format!(
                "dependency type '{}' version mismatch: registered {}, got {}",
                dependency_type.name, version, dependency_type.version
            )));
        }
        factory(body)
    }
}

fn always_factory(body: Value) -> Result<Box<dyn DependencyManager>> {
    let dependency: Always = serde_json::from_value(body)?;
    Ok(Box::new(dependency))
}

fn creates_file_factory(body: Value) -> Result<Box<dyn DependencyManager>> {
    let dependency: CreatesFile = serde_json::from_value(body)?;
    Ok(Box::new(dependency))
}

/// Serialized dependency manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyInterchange {
    pub dependency_type: DependencyType,
    pub body: Value,
}

/// Serialized form of a job, independent of its concrete type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobInterchange {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub time: TimeInfo,
    pub retry: RetryInfo,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default, with = "duration_serde")]
    pub timeout: Option<Duration>,
    pub dependency: DependencyInterchange,
    pub body: Value,
}

impl JobInterchange {
    /// Capture a job's state and payload.
    pub fn from_job(job: &dyn Job) -> Result<Self> {
        let base = job.base();
        let dependency = base.with_dependency_ref(|dep| -> Result<DependencyInterchange> {
            Ok(DependencyInterchange {
                dependency_type: dep.dependency_type(),
                body: dep.to_json()?,
            })
        })?;

        Ok(Self {
            id: base.id().to_string(),
            job_type: base.job_type().clone(),
            status: base.status(),
            time: base.time_info(),
            retry: base.retry_info(),
            scopes: base.scopes().to_vec(),
            timeout: base.timeout(),
            dependency,
            body: job.payload()?,
        })
    }

    /// Rebuild the job through `registry`.
    pub fn into_job(self, registry: &Registry) -> Result<Arc<dyn Job>> {
        let dependency =
            registry.build_dependency(&self.dependency.dependency_type, self.dependency.body)?;

        let mut base = JobBase::new(self.id, self.job_type)
            .with_scopes(self.scopes)
            .with_retry(self.retry)
            .with_dependency(dependency)
            .with_status(self.status, self.time);
        if let Some(timeout) = self.timeout {
            base = base.with_timeout(timeout);
        }

        registry.build_job(base, self.body)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
