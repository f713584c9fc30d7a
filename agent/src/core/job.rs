//! The unit of work a driver executes and its monotonic status.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::errors::{InvalidTransitionError, MissingMetadataError};
use crate::core::lifecycle::Operation;
use crate::core::types::{ConfigurationVersion, Run, Variable, Workspace};

/// Well-known keys drivers record in [`JobStatus`] metadata.
pub mod metadata_keys {
    /// Docker container id.
    pub const CONTAINER_ID: &str = "container_id";
    /// Kubernetes pod name.
    pub const POD_NAME: &str = "pod_name";
    /// Directory the inline runner executes in.
    pub const WORKING_DIRECTORY: &str = "working_directory";
    /// Scratch directory the inline driver owns and removes on cleanup.
    pub const RUN_DIRECTORY: &str = "run_directory";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ImagePullPolicy {
    Always,
    Never,
    #[default]
    IfNotPresent,
}

impl ImagePullPolicy {
    /// Spelling used by Kubernetes pod specs.
    pub fn as_kubernetes(self) -> &'static str {
        match self {
            ImagePullPolicy::Always => "Always",
            ImagePullPolicy::Never => "Never",
            ImagePullPolicy::IfNotPresent => "IfNotPresent",
        }
    }
}

/// Everything a driver needs to execute one run attempt. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub organization_id: String,
    pub backend_image: String,
    pub image_pull_policy: ImagePullPolicy,
    pub run: Run,
    pub workspace: Workspace,
    /// State-backend token fetched from the coordinator.
    pub backend_token: String,
    /// Callback token minted by the authorizer for this run.
    pub proxy_token: String,
    pub configuration_version: ConfigurationVersion,
    pub variables: Vec<Variable>,
    pub operation: Operation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Complete,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Complete | JobState::Failed)
    }

    fn rank(self) -> u8 {
        match self {
            JobState::Pending => 0,
            JobState::Running => 1,
            JobState::Complete | JobState::Failed => 2,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Complete => "complete",
            JobState::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Backend handles plus the job state.
///
/// State only moves forward: `pending -> running -> {complete | failed}`.
/// Skipping `running` is allowed, re-entering the current non-terminal state
/// is a no-op, and terminal states are final.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    metadata: BTreeMap<String, String>,
    state: JobState,
    history: Vec<JobState>,
}

impl Default for JobStatus {
    fn default() -> Self {
        Self {
            metadata: BTreeMap::new(),
            state: JobState::Pending,
            history: vec![JobState::Pending],
        }
    }
}

impl JobStatus {
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Every distinct state this job has been in, in order.
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    pub fn transition(&mut self, next: JobState) -> Result<(), InvalidTransitionError> {
        if next == self.state && !next.is_terminal() {
            return Ok(());
        }
        if self.state.is_terminal() || next.rank() <= self.state.rank() {
            return Err(InvalidTransitionError {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.history.push(next);
        Ok(())
    }

    pub fn set_metadata(&mut self, key: &str, value: impl Into<String>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn get_metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Checked accessor for handles a later phase depends on.
    pub fn require_metadata(&self, key: &str) -> Result<&str, MissingMetadataError> {
        self.get_metadata(key).ok_or_else(|| MissingMetadataError {
            key: key.to_string(),
        })
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }
}

/// One dispatch attempt. Created right before start, dropped after cleanup.
#[derive(Debug, Clone)]
pub struct Job {
    spec: JobSpec,
    pub status: JobStatus,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            spec,
            status: JobStatus::default(),
        }
    }

    pub fn spec(&self) -> &JobSpec {
        &self.spec
    }

    pub fn run_id(&self) -> &str {
        &self.spec.run.id
    }

    /// Marks the job failed unless it already reached a terminal state.
    pub fn mark_failed(&mut self) {
        if !self.status.state().is_terminal() {
            let _ = self.status.transition(JobState::Failed);
        }
    }
}
