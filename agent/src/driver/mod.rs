//! Execution backends.
//!
//! A [`Driver`] runs one [`Job`] through `start`, `wait` and `cleanup`. The
//! agent always calls [`drive`], which guarantees `cleanup` runs exactly once
//! whatever `start` or `wait` returned.

pub mod docker;
pub mod inline;
pub mod kubernetes;

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

use crate::core::errors::WaitTimeoutError;
use crate::core::job::{Job, JobSpec};
use crate::core::types::VariableCategory;

pub const ENV_ORGANIZATION_ID: &str = "RUN_AGENT_ORGANIZATION_ID";
pub const ENV_RUN_ID: &str = "RUN_AGENT_RUN_ID";
pub const ENV_ACCESS_TOKEN: &str = "RUN_AGENT_ACCESS_TOKEN";
pub const ENV_CALLBACK_URL: &str = "RUN_AGENT_CALLBACK_URL";
pub const ENV_BACKEND_TOKEN: &str = "RUN_AGENT_BACKEND_TOKEN";
pub const ENV_WORKSPACE: &str = "TF_WORKSPACE";
const ENV_HTTP_BACKEND_USERNAME: &str = "TF_HTTP_USERNAME";
const ENV_HTTP_BACKEND_PASSWORD: &str = "TF_HTTP_PASSWORD";
const TERRAFORM_VAR_PREFIX: &str = "TF_VAR_";

#[async_trait]
pub trait Driver: Send + Sync {
    /// Provision the execution unit and record its handles in job metadata.
    async fn start(&self, job: &mut Job) -> Result<()>;

    /// Block until the execution unit is terminal. Errors when it failed.
    async fn wait(&self, job: &mut Job) -> Result<()>;

    /// Release whatever `start` provisioned. Must tolerate a failed or partial start.
    async fn cleanup(&self, job: &mut Job) -> Result<()>;
}

/// Run a job through start, wait and cleanup.
///
/// Returns the start or wait error. Cleanup errors are logged only. The job
/// is left in a terminal state.
pub async fn drive(driver: &dyn Driver, job: &mut Job) -> Result<()> {
    let result = match driver.start(job).await {
        Ok(()) => driver.wait(job).await,
        Err(err) => Err(err.context("start job")),
    };
    if result.is_err() {
        job.mark_failed();
    }

    if let Err(err) = driver.cleanup(job).await {
        warn!(
            run_id = %job.run_id(),
            error = %format!("{err:#}"),
            "cleanup failed"
        );
    }

    info!(run_id = %job.run_id(), job_state = %job.status.state(), "job finished");
    result
}

/// How `wait` polls a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    /// Sleep before the first probe.
    pub initial_delay: Duration,
    pub interval: Duration,
    /// Give up after this long. `None` waits indefinitely.
    pub timeout: Option<Duration>,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            interval: Duration::from_secs(1),
            timeout: None,
        }
    }
}

/// Call `probe` until it yields a value, sleeping `interval` between calls.
///
/// Probe errors end the wait immediately. Exceeding the policy timeout
/// returns [`WaitTimeoutError`].
pub async fn poll_until<T, F, Fut>(policy: &PollPolicy, mut probe: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let started = Instant::now();
    if !policy.initial_delay.is_zero() {
        sleep(policy.initial_delay).await;
    }
    let mut probes = 0u64;
    loop {
        probes += 1;
        if let Some(value) = probe().await? {
            debug!(probes, "poll reached terminal state");
            return Ok(value);
        }
        if let Some(timeout) = policy.timeout
            && started.elapsed() >= timeout
        {
            return Err(WaitTimeoutError { timeout }.into());
        }
        sleep(policy.interval).await;
    }
}

/// Environment every execution unit receives.
///
/// Non-HCL variables are appended: `env` variables verbatim, `terraform`
/// variables as `TF_VAR_<key>`. Variables without a value are skipped.
pub fn job_environment(spec: &JobSpec, callback_url: &str) -> Vec<(String, String)> {
    let mut env = vec![
        (ENV_ORGANIZATION_ID.to_string(), spec.organization_id.clone()),
        (ENV_RUN_ID.to_string(), spec.run.id.clone()),
        (ENV_ACCESS_TOKEN.to_string(), spec.proxy_token.clone()),
        (ENV_CALLBACK_URL.to_string(), callback_url.to_string()),
        (ENV_BACKEND_TOKEN.to_string(), spec.backend_token.clone()),
        (ENV_WORKSPACE.to_string(), spec.workspace.name.clone()),
        (ENV_HTTP_BACKEND_USERNAME.to_string(), "runner".to_string()),
        (ENV_HTTP_BACKEND_PASSWORD.to_string(), spec.backend_token.clone()),
    ];

    for var in &spec.variables {
        if var.hcl {
            continue;
        }
        let Some(value) = &var.value else {
            debug!(key = %var.key, "skipping variable without a value");
            continue;
        };
        let name = match var.category {
            VariableCategory::Env => var.key.clone(),
            VariableCategory::Terraform => format!("{TERRAFORM_VAR_PREFIX}{}", var.key),
            VariableCategory::Other => continue,
        };
        env.push((name, value.clone()));
    }
    env
}

/// Arguments handed to the runner command after the configured program.
pub fn runner_args(spec: &JobSpec, directory: &Path) -> Vec<String> {
    let mut args = vec![
        format!("--directory={}", directory.display()),
        format!("--run-id={}", spec.run.id),
    ];
    if let Some(version) = &spec.workspace.tool_version {
        args.push(format!("--version={version}"));
    }
    if spec.run.is_destroy {
        args.push("--destroy".to_string());
    }
    args.push(spec.operation.command(spec.run.is_destroy).to_string());
    args
}
