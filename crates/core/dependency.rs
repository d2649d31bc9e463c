//! Dependency managers decide whether a job may be dispatched.
//!
//! A manager answers two questions: which other jobs (by id) this job waits
//! on, and whether its own condition is met. The queue combines both: a job is
//! dispatched only when every edge points at a completed job and the manager
//! reports [`DependencyState::Ready`].
//!
//! Edges are plain ids, so the graph may contain cycles or point at jobs that
//! have not been submitted yet. Nothing here walks the graph.

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::PathBuf;

use crate::error::{DroverError, Result};

/// Readiness reported by a dependency manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DependencyState {
    /// The job can run now.
    Ready,
    /// The job must wait; it stays stored and is re-checked later.
    Blocked,
    /// The condition is permanently satisfied; the job's outcome already
    /// exists and it is recorded as completed without running.
    Passed,
}

/// Name and version of a dependency implementation, used by the registry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DependencyType {
    pub name: String,
    pub version: u32,
}

impl DependencyType {
    pub fn new(name: impl Into<String>, version: u32) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

/// Capability set every dependency implementation provides.
pub trait DependencyManager: Send + Sync + Debug {
    /// Type descriptor for interchange.
    fn dependency_type(&self) -> DependencyType;

    /// Manager-specific readiness, ignoring edges.
    fn state(&self) -> DependencyState;

    /// Ids of the jobs this job depends on.
    fn edges(&self) -> Vec<String>;

    /// Add an edge. Adding the same id twice is an error.
    fn add_edge(&mut self, id: &str) -> Result<()>;

    /// Serialized form of this manager, including its edges.
    fn to_json(&self) -> Result<serde_json::Value>;
}

/// Ordered, duplicate-free edge list shared by the bundled managers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobEdges {
    edges: Vec<String>,
}

impl JobEdges {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn edges(&self) -> Vec<String> {
        self.edges.clone()
    }

    pub fn add_edge(&mut self, id: &str) -> Result<()> {
        if self.edges.iter().any(|e| e == id) {
            return Err(DroverError::Dependency(format!(
                "edge to '{}' already exists",
                id
            )));
        }
        self.edges.push(id.to_string());
        Ok(())
    }
}

/// Always ready; ordering comes from edges alone.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Always {
    #[serde(default)]
    edges: JobEdges,
}

impl Always {
    pub const NAME: &'static str = "always";

    pub fn new() -> Self {
        Self::default()
    }
}

impl DependencyManager for Always {
    fn dependency_type(&self) -> DependencyType {
        DependencyType::new(Self::NAME, 0)
    }

    fn state(&self) -> DependencyState {
        DependencyState::Ready
    }

    fn edges(&self) -> Vec<String> {
        self.edges.edges()
    }

    fn add_edge(&mut self, id: &str) -> Result<()> {
        self.edges.add_edge(id)
    }

    fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

/// Passed once `path` exists, so a job producing a file runs at most once.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatesFile {
    path: PathBuf,
    #[serde(default)]
    edges: JobEdges,
}

impl CreatesFile {
    pub const NAME: &'static str = "create-file";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            edges: JobEdges::new(),
        }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }
}

impl DependencyManager for CreatesFile {
    fn dependency_type(&self) -> DependencyType {
        DependencyType::new(Self::NAME, 0)
    }

    fn state(&self) -> DependencyState {
        if self.path.exists() {
            DependencyState::Passed
        } else {
            DependencyState::Ready
        }
    }

    fn edges(&self) -> Vec<String> {
        self.edges.edges()
    }

    fn add_edge(&mut self, id: &str) -> Result<()> {
        self.edges.add_edge(id)
    }

    fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}
