//! Test-only fakes and fixtures shared by unit and integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use flate2::Compression;
use flate2::write::GzEncoder;
use tokio_util::sync::CancellationToken;

use crate::bus::Subscriber;
use crate::core::errors::ExitStatusError;
use crate::core::job::{ImagePullPolicy, Job, JobSpec, JobState};
use crate::core::lifecycle::{EventKind, LifecycleEvent, Operation};
use crate::core::types::{
    ConfigurationVersion, Run, RunEvent, RunStatusUpdate, Variable, Workspace,
};
use crate::driver::Driver;
use crate::io::coordinator::Coordinator;
use crate::listener::{DeliverySource, RunHandler};

pub const WORKSPACE_ID: &str = "ws-1";
pub const ORGANIZATION_ID: &str = "org-1";

/// Run in workspace `ws-1` with ids derived from `id`.
pub fn run_fixture(id: &str, status: &str) -> Run {
    Run {
        id: id.to_string(),
        status: status.to_string(),
        workspace_id: WORKSPACE_ID.to_string(),
        configuration_version_id: format!("cv-{id}"),
        plan_id: format!("plan-{id}"),
        apply_id: format!("apply-{id}"),
        is_destroy: false,
    }
}

pub fn workspace_fixture(id: &str, locked: bool) -> Workspace {
    Workspace {
        id: id.to_string(),
        name: "networking-prod".to_string(),
        locked,
        working_directory: String::new(),
        tool_version: None,
    }
}

pub fn event_fixture(run_id: &str) -> RunEvent {
    RunEvent {
        organization_id: ORGANIZATION_ID.to_string(),
        run_id: run_id.to_string(),
        workspace_id: WORKSPACE_ID.to_string(),
    }
}

pub fn job_spec_fixture(operation: Operation) -> JobSpec {
    let status = match operation {
        Operation::Plan => "plan_queued",
        Operation::Apply => "apply_queued",
    };
    let run = run_fixture("run-1", status);
    JobSpec {
        organization_id: ORGANIZATION_ID.to_string(),
        backend_image: "ghcr.io/run-agent/runner:test".to_string(),
        image_pull_policy: ImagePullPolicy::IfNotPresent,
        configuration_version: ConfigurationVersion {
            id: run.configuration_version_id.clone(),
            status: "uploaded".to_string(),
        },
        run,
        workspace: workspace_fixture(WORKSPACE_ID, false),
        backend_token: "backend-token".to_string(),
        proxy_token: "proxy-token".to_string(),
        variables: Vec::new(),
        operation,
    }
}

/// Build a `.tar.gz` holding the given `(path, contents)` files.
pub fn configuration_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (path, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, path, contents.as_bytes())
            .expect("append archive entry");
    }
    builder
        .into_inner()
        .expect("finish tar")
        .finish()
        .expect("finish gzip")
}

/// Writes the coordinator received, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorCall {
    PlanStatus { plan_id: String, status: String },
    ApplyStatus { apply_id: String, status: String },
    RunStatus { run_id: String, update: RunStatusUpdate },
    UploadPlan { run_id: String, content: String },
    AppendLogs { run_id: String, chunk: String },
    UploadLogs { run_id: String, content: String },
}

#[derive(Default)]
struct CoordinatorState {
    runs: HashMap<String, Run>,
    workspaces: HashMap<String, Workspace>,
    variables: HashMap<String, Vec<Variable>>,
    archives: HashMap<String, Vec<u8>>,
    queue: Vec<Run>,
    failing_queue_reads: usize,
    queue_reads: usize,
    backend_token_error: Option<String>,
    fail_writes: bool,
    calls: Vec<CoordinatorCall>,
}

/// In-memory coordinator. Reading the queue drains it.
#[derive(Default)]
pub struct FakeCoordinator {
    state: Mutex<CoordinatorState>,
}

impl FakeCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut CoordinatorState) -> T) -> T {
        let mut state = self.state.lock().expect("coordinator state");
        f(&mut state)
    }

    pub fn add_run(&self, run: Run) {
        self.with_state(|s| s.runs.insert(run.id.clone(), run));
    }

    pub fn add_workspace(&self, workspace: Workspace) {
        self.with_state(|s| s.workspaces.insert(workspace.id.clone(), workspace));
    }

    pub fn set_variables(&self, workspace_id: &str, variables: Vec<Variable>) {
        self.with_state(|s| s.variables.insert(workspace_id.to_string(), variables));
    }

    pub fn add_archive(&self, configuration_version_id: &str, bytes: Vec<u8>) {
        self.with_state(|s| {
            s.archives
                .insert(configuration_version_id.to_string(), bytes)
        });
    }

    pub fn push_queue(&self, run: Run) {
        self.with_state(|s| {
            s.runs.entry(run.id.clone()).or_insert_with(|| run.clone());
            s.queue.push(run);
        });
    }

    /// Fail the next `count` queue reads.
    pub fn fail_queue_reads(&self, count: usize) {
        self.with_state(|s| s.failing_queue_reads = count);
    }

    pub fn queue_reads(&self) -> usize {
        self.with_state(|s| s.queue_reads)
    }

    pub fn fail_backend_token(&self, message: &str) {
        self.with_state(|s| s.backend_token_error = Some(message.to_string()));
    }

    /// Make every status update and upload fail.
    pub fn fail_writes(&self) {
        self.with_state(|s| s.fail_writes = true);
    }

    pub fn calls(&self) -> Vec<CoordinatorCall> {
        self.with_state(|s| s.calls.clone())
    }

    fn record(&self, call: CoordinatorCall) -> Result<()> {
        self.with_state(|s| {
            if s.fail_writes {
                return Err(anyhow!("coordinator unavailable"));
            }
            s.calls.push(call);
            Ok(())
        })
    }
}

#[async_trait]
impl Coordinator for FakeCoordinator {
    async fn run_queue(&self, _organization_id: &str) -> Result<Vec<Run>> {
        self.with_state(|s| {
            s.queue_reads += 1;
            if s.failing_queue_reads > 0 {
                s.failing_queue_reads -= 1;
                return Err(anyhow!("queue unavailable"));
            }
            Ok(std::mem::take(&mut s.queue))
        })
    }

    async fn read_run(&self, run_id: &str) -> Result<Run> {
        self.with_state(|s| s.runs.get(run_id).cloned())
            .ok_or_else(|| anyhow!("run {run_id} not found"))
    }

    async fn read_workspace(&self, _organization_id: &str, workspace_id: &str) -> Result<Workspace> {
        self.with_state(|s| s.workspaces.get(workspace_id).cloned())
            .ok_or_else(|| anyhow!("workspace {workspace_id} not found"))
    }

    async fn read_configuration_version(&self, id: &str) -> Result<ConfigurationVersion> {
        Ok(ConfigurationVersion {
            id: id.to_string(),
            status: "uploaded".to_string(),
        })
    }

    async fn download_configuration_version(&self, id: &str) -> Result<Vec<u8>> {
        self.with_state(|s| s.archives.get(id).cloned())
            .ok_or_else(|| anyhow!("configuration version {id} has no archive"))
    }

    async fn list_variables(&self, workspace_id: &str) -> Result<Vec<Variable>> {
        Ok(self.with_state(|s| s.variables.get(workspace_id).cloned().unwrap_or_default()))
    }

    async fn run_backend_token(&self, run_id: &str) -> Result<String> {
        match self.with_state(|s| s.backend_token_error.clone()) {
            Some(message) => Err(anyhow!(message)),
            None => Ok(format!("backend-{run_id}")),
        }
    }

    async fn update_plan_status(&self, plan_id: &str, status: &str) -> Result<()> {
        self.record(CoordinatorCall::PlanStatus {
            plan_id: plan_id.to_string(),
            status: status.to_string(),
        })
    }

    async fn update_apply_status(&self, apply_id: &str, status: &str) -> Result<()> {
        self.record(CoordinatorCall::ApplyStatus {
            apply_id: apply_id.to_string(),
            status: status.to_string(),
        })
    }

    async fn update_run_status(&self, run_id: &str, update: &RunStatusUpdate) -> Result<()> {
        self.record(CoordinatorCall::RunStatus {
            run_id: run_id.to_string(),
            update: update.clone(),
        })
    }

    async fn upload_plan(&self, run_id: &str, content: &str) -> Result<()> {
        self.record(CoordinatorCall::UploadPlan {
            run_id: run_id.to_string(),
            content: content.to_string(),
        })
    }

    async fn append_logs(&self, run_id: &str, chunk: &str) -> Result<()> {
        self.record(CoordinatorCall::AppendLogs {
            run_id: run_id.to_string(),
            chunk: chunk.to_string(),
        })
    }

    async fn upload_logs(&self, run_id: &str, content: &str) -> Result<()> {
        self.record(CoordinatorCall::UploadLogs {
            run_id: run_id.to_string(),
            content: content.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverCall {
    Start,
    Wait,
    Cleanup,
}

#[derive(Default)]
struct DriverLog {
    calls: Vec<DriverCall>,
    jobs: Vec<JobSpec>,
}

/// Driver with scripted outcomes that records every phase call.
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    log: Arc<Mutex<DriverLog>>,
    start_error: Option<String>,
    exit_code: Option<i64>,
    cleanup_error: Option<String>,
}

impl ScriptedDriver {
    pub fn succeeding() -> Self {
        Self::default()
    }

    pub fn failing_start(message: &str) -> Self {
        Self {
            start_error: Some(message.to_string()),
            ..Self::default()
        }
    }

    /// `wait` fails with an [`ExitStatusError`] carrying `code`.
    pub fn failing_wait(code: i64) -> Self {
        Self {
            exit_code: Some(code),
            ..Self::default()
        }
    }

    pub fn with_cleanup_error(mut self, message: &str) -> Self {
        self.cleanup_error = Some(message.to_string());
        self
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.log.lock().expect("driver log").calls.clone()
    }

    /// Specs of every job that reached `start`.
    pub fn jobs(&self) -> Vec<JobSpec> {
        self.log.lock().expect("driver log").jobs.clone()
    }

    fn record(&self, call: DriverCall) {
        self.log.lock().expect("driver log").calls.push(call);
    }
}

#[async_trait]
impl Driver for ScriptedDriver {
    async fn start(&self, job: &mut Job) -> Result<()> {
        self.record(DriverCall::Start);
        self.log
            .lock()
            .expect("driver log")
            .jobs
            .push(job.spec().clone());
        if let Some(message) = &self.start_error {
            return Err(anyhow!(message.clone()));
        }
        Ok(())
    }

    async fn wait(&self, job: &mut Job) -> Result<()> {
        self.record(DriverCall::Wait);
        job.status.transition(JobState::Running)?;
        if let Some(code) = self.exit_code {
            job.status.transition(JobState::Failed)?;
            return Err(ExitStatusError { code: Some(code) }.into());
        }
        job.status.transition(JobState::Complete)?;
        Ok(())
    }

    async fn cleanup(&self, _job: &mut Job) -> Result<()> {
        self.record(DriverCall::Cleanup);
        match &self.cleanup_error {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }
}

/// Subscriber that keeps every event it receives.
#[derive(Clone, Default)]
pub struct RecordingSubscriber {
    events: Arc<Mutex<Vec<LifecycleEvent>>>,
    fail: bool,
}

impl RecordingSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records, then returns an error.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events.lock().expect("events").clone()
    }

    pub fn kinds(&self) -> Vec<EventKind> {
        self.events().iter().map(LifecycleEvent::kind).collect()
    }
}

#[async_trait]
impl Subscriber for RecordingSubscriber {
    async fn notify(&self, event: &LifecycleEvent) -> Result<()> {
        self.events.lock().expect("events").push(event.clone());
        if self.fail {
            return Err(anyhow!("subscriber down"));
        }
        Ok(())
    }
}

/// Handler that records events, optionally failing one run and cancelling
/// the listener after a number of events.
#[derive(Clone, Default)]
pub struct RecordingHandler {
    events: Arc<Mutex<Vec<RunEvent>>>,
    fail_on: Option<String>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_on(run_id: &str) -> Self {
        Self {
            fail_on: Some(run_id.to_string()),
            ..Self::default()
        }
    }

    pub fn cancel_after(mut self, count: usize, token: CancellationToken) -> Self {
        self.cancel_after = Some((count, token));
        self
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().expect("events").clone()
    }

    pub fn run_ids(&self) -> Vec<String> {
        self.events().into_iter().map(|e| e.run_id).collect()
    }
}

#[async_trait]
impl RunHandler for RecordingHandler {
    async fn handle(&self, event: RunEvent) -> Result<()> {
        let run_id = event.run_id.clone();
        let seen = {
            let mut events = self.events.lock().expect("events");
            events.push(event);
            events.len()
        };
        if let Some((count, token)) = &self.cancel_after
            && seen >= *count
        {
            token.cancel();
        }
        if self.fail_on.as_deref() == Some(run_id.as_str()) {
            return Err(anyhow!("handler rejected {run_id}"));
        }
        Ok(())
    }
}

/// Delivery source replaying a fixed script; `Err` entries are transient failures.
pub struct ScriptedDeliveries {
    items: VecDeque<Result<Vec<u8>, String>>,
}

impl ScriptedDeliveries {
    pub fn new(items: Vec<Result<Vec<u8>, String>>) -> Self {
        Self {
            items: items.into(),
        }
    }
}

#[async_trait]
impl DeliverySource for ScriptedDeliveries {
    async fn next_delivery(&mut self) -> Option<Result<Vec<u8>>> {
        self.items
            .pop_front()
            .map(|item| item.map_err(|message| anyhow!(message)))
    }
}
