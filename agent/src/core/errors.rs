//! Typed failures that callers match on with `downcast_ref`.

use std::time::Duration;

use thiserror::Error;

use crate::core::job::JobState;

#[derive(Debug, Error)]
#[error("workspace {workspace_id} is already locked")]
pub struct WorkspaceLockedError {
    pub workspace_id: String,
}

#[derive(Debug, Error)]
#[error("invalid operation for run {run_id}: status {status:?} is not dispatchable")]
pub struct InvalidOperationError {
    pub run_id: String,
    pub status: String,
}

/// The execution unit finished with a failing exit status.
#[derive(Debug, Error)]
#[error("{}", describe_exit(.code))]
pub struct ExitStatusError {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i64>,
}

fn describe_exit(code: &Option<i64>) -> String {
    match code {
        Some(code) => format!("exited with code {code}"),
        None => "terminated without an exit code".to_string(),
    }
}

#[derive(Debug, Error)]
#[error("pod {pod} failed: {reason}")]
pub struct PodFailedError {
    pub pod: String,
    pub reason: String,
}

#[derive(Debug, Error)]
#[error("job metadata is missing {key:?}")]
pub struct MissingMetadataError {
    pub key: String,
}

#[derive(Debug, Error)]
#[error("job state cannot move from {from} to {to}")]
pub struct InvalidTransitionError {
    pub from: JobState,
    pub to: JobState,
}

#[derive(Debug, Error)]
#[error("job did not reach a terminal state within {timeout:?}")]
pub struct WaitTimeoutError {
    pub timeout: Duration,
}
