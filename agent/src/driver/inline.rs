//! Runs the runner command as a local child process.

use std::path::{Component, Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{Driver, job_environment, runner_args};
use crate::core::errors::{ExitStatusError, WaitTimeoutError};
use crate::core::job::{Job, JobState, metadata_keys};
use crate::io::archive::extract_tar_gz;
use crate::io::coordinator::Coordinator;
use crate::io::process::run_command;

#[derive(Debug, Clone)]
pub struct InlineOptions {
    /// Program plus leading arguments; run arguments are appended.
    pub command: Vec<String>,
    /// Parent directory of per-run scratch directories.
    pub work_root: PathBuf,
    pub callback_url: String,
    pub output_limit_bytes: usize,
    pub timeout: Option<Duration>,
}

pub struct InlineDriver {
    options: InlineOptions,
    coordinator: Arc<dyn Coordinator>,
}

impl InlineDriver {
    pub fn new(options: InlineOptions, coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            options,
            coordinator,
        }
    }

    fn build_command(&self, job: &Job, directory: &Path) -> Result<Command> {
        let (program, leading) = self
            .options
            .command
            .split_first()
            .ok_or_else(|| anyhow!("inline command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(leading)
            .args(runner_args(job.spec(), directory))
            .envs(job_environment(job.spec(), &self.options.callback_url))
            .current_dir(directory);
        Ok(cmd)
    }
}

#[async_trait]
impl Driver for InlineDriver {
    #[instrument(skip_all, fields(run_id = %job.run_id()))]
    async fn start(&self, job: &mut Job) -> Result<()> {
        let configuration_version_id = job.spec().configuration_version.id.clone();
        let working_directory = job.spec().workspace.working_directory.clone();
        check_relative(&working_directory)?;

        let archive = self
            .coordinator
            .download_configuration_version(&configuration_version_id)
            .await
            .context("download configuration version")?;

        let run_dir = self.options.work_root.join(format!(
            "run-{}-{}",
            job.run_id(),
            Uuid::new_v4().simple()
        ));
        // Recorded before extraction so cleanup also removes a partial unpack.
        job.status
            .set_metadata(metadata_keys::RUN_DIRECTORY, run_dir.display().to_string());

        let dest = run_dir.clone();
        let root = tokio::task::spawn_blocking(move || extract_tar_gz(&archive, &dest))
            .await
            .context("join archive extraction")?
            .context("extract configuration version")?;

        let directory = root.join(&working_directory);
        if !directory.is_dir() {
            bail!(
                "working directory {working_directory:?} not found in configuration version {configuration_version_id}"
            );
        }
        info!(directory = %directory.display(), "configuration extracted");
        job.status
            .set_metadata(metadata_keys::WORKING_DIRECTORY, directory.display().to_string());
        Ok(())
    }

    #[instrument(skip_all, fields(run_id = %job.run_id()))]
    async fn wait(&self, job: &mut Job) -> Result<()> {
        let directory = PathBuf::from(
            job.status
                .require_metadata(metadata_keys::WORKING_DIRECTORY)?,
        );
        let cmd = self.build_command(job, &directory)?;
        let timeout = self.options.timeout;
        let limit = self.options.output_limit_bytes;

        job.status.transition(JobState::Running)?;
        let output = tokio::task::spawn_blocking(move || run_command(cmd, timeout, limit))
            .await
            .context("join runner process")?
            .context("run runner command")?;
        debug!(output = %output.render(), "runner output");

        if output.status.success() {
            job.status.transition(JobState::Complete)?;
            return Ok(());
        }

        job.status.transition(JobState::Failed)?;
        if output.timed_out
            && let Some(timeout) = timeout
        {
            return Err(WaitTimeoutError { timeout }.into());
        }
        Err(ExitStatusError {
            code: output.status.code().map(i64::from),
        }
        .into())
    }

    #[instrument(skip_all, fields(run_id = %job.run_id()))]
    async fn cleanup(&self, job: &mut Job) -> Result<()> {
        let Some(run_dir) = job.status.get_metadata(metadata_keys::RUN_DIRECTORY) else {
            debug!("nothing to clean up");
            return Ok(());
        };
        match tokio::fs::remove_dir_all(run_dir).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(run_dir, "run directory already gone");
                Ok(())
            }
            Err(err) => Err(err).with_context(|| format!("remove {run_dir}")),
        }
    }
}

fn check_relative(working_directory: &str) -> Result<()> {
    let escapes = Path::new(working_directory)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        bail!("working directory {working_directory:?} must be relative to the configuration root");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::lifecycle::Operation;
    use crate::driver::drive;
    use crate::test_support::{FakeCoordinator, configuration_archive, job_spec_fixture};

    fn driver(
        coordinator: Arc<FakeCoordinator>,
        work_root: &Path,
        script: &str,
    ) -> InlineDriver {
        InlineDriver::new(
            InlineOptions {
                command: vec!["sh".to_string(), "-c".to_string(), script.to_string()],
                work_root: work_root.to_path_buf(),
                callback_url: "http://callback.test".to_string(),
                output_limit_bytes: 10_000,
                timeout: None,
            },
            coordinator,
        )
    }

    fn coordinator_with_archive(cv_id: &str) -> Arc<FakeCoordinator> {
        let coordinator = FakeCoordinator::new();
        coordinator.add_archive(
            cv_id,
            configuration_archive(&[("infra/main.tf", "# main"), ("README.md", "docs")]),
        );
        Arc::new(coordinator)
    }

    #[tokio::test]
    async fn runs_command_in_working_directory_with_environment() {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut spec = job_spec_fixture(Operation::Plan);
        spec.workspace.working_directory = "infra".to_string();
        let coordinator = coordinator_with_archive(&spec.configuration_version.id);
        let script = format!(
            "test -f main.tf && test \"$RUN_AGENT_RUN_ID\" = {} && test \"$TF_WORKSPACE\" = {}",
            spec.run.id, spec.workspace.name
        );
        let driver = driver(coordinator, temp.path(), &script);

        let mut job = Job::new(spec);
        drive(&driver, &mut job).await.expect("drive");
        assert_eq!(job.status.state(), JobState::Complete);
        assert_eq!(
            job.status.history(),
            &[JobState::Pending, JobState::Running, JobState::Complete]
        );

        let run_dir = job
            .status
            .get_metadata(metadata_keys::RUN_DIRECTORY)
            .expect("run dir recorded");
        assert!(!Path::new(run_dir).exists(), "cleanup removes the run directory");
    }

    #[tokio::test]
    async fn non_zero_exit_fails_the_job() {
        let temp = tempfile::tempdir().expect("tempdir");
        let spec = job_spec_fixture(Operation::Apply);
        let coordinator = coordinator_with_archive(&spec.configuration_version.id);
        let driver = driver(coordinator, temp.path(), "exit 3");

        let mut job = Job::new(spec);
        let err = drive(&driver, &mut job).await.expect_err("exit 3");
        let exit = err.downcast_ref::<ExitStatusError>().expect("exit status");
        assert_eq!(exit.code, Some(3));
        assert_eq!(job.status.state(), JobState::Failed);
    }

    #[tokio::test]
    async fn missing_archive_fails_start_and_cleanup_is_a_no_op() {
        let temp = tempfile::tempdir().expect("tempdir");
        let coordinator = Arc::new(FakeCoordinator::new());
        let driver = driver(coordinator, temp.path(), "exit 0");

        let mut job = Job::new(job_spec_fixture(Operation::Plan));
        let err = drive(&driver, &mut job).await.expect_err("no archive");
        assert!(format!("{err:#}").contains("download configuration version"));
        assert_eq!(job.status.state(), JobState::Failed);
        assert!(job.status.get_metadata(metadata_keys::RUN_DIRECTORY).is_none());
    }

    #[tokio::test]
    async fn wait_without_start_reports_missing_metadata() {
        let temp = tempfile::tempdir().expect("tempdir");
        let driver = driver(Arc::new(FakeCoordinator::new()), temp.path(), "exit 0");
        let mut job = Job::new(job_spec_fixture(Operation::Plan));
        let err = driver.wait(&mut job).await.expect_err("no metadata");
        assert!(
            err.downcast_ref::<crate::core::errors::MissingMetadataError>()
                .is_some()
        );
    }

    #[test]
    fn working_directory_must_stay_inside_configuration() {
        assert!(check_relative("").is_ok());
        assert!(check_relative("envs/prod").is_ok());
        assert!(check_relative("../outside").is_err());
        assert!(check_relative("/etc").is_err());
    }
}
