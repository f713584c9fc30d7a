//! Runs the runner image as a container on the local Docker engine.

use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogsOptions, RemoveContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use futures::StreamExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{Driver, PollPolicy, job_environment, poll_until, runner_args};
use crate::core::errors::ExitStatusError;
use crate::core::job::{ImagePullPolicy, Job, JobState, metadata_keys};

const CONTAINER_WORKSPACE: &str = "/workspace";

/// What the driver asks the engine to create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRequest {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    /// `KEY=value` pairs.
    pub env: Vec<String>,
    pub binds: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerPhase {
    /// Created but not yet running.
    Starting,
    Running,
    Exited { code: i64 },
}

/// The slice of the Docker API the driver uses.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    async fn image_exists(&self, image: &str) -> Result<bool>;
    async fn pull_image(&self, image: &str) -> Result<()>;
    /// Returns the container id.
    async fn create_container(&self, request: &ContainerRequest) -> Result<String>;
    async fn start_container(&self, id: &str) -> Result<()>;
    async fn inspect_container(&self, id: &str) -> Result<ContainerPhase>;
    async fn container_logs(&self, id: &str) -> Result<String>;
    /// Force-removes the container and its anonymous volumes.
    async fn remove_container(&self, id: &str) -> Result<()>;
}

/// [`ContainerEngine`] over a bollard connection.
#[derive(Clone)]
pub struct BollardEngine {
    docker: Docker,
}

impl BollardEngine {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().context("connect to docker")?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerEngine for BollardEngine {
    async fn image_exists(&self, image: &str) -> Result<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(err) => Err(err).with_context(|| format!("inspect image {image}")),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(item) = progress.next().await {
            let info = item.with_context(|| format!("pull image {image}"))?;
            if let Some(status) = info.status {
                debug!(image, %status, "pull progress");
            }
        }
        Ok(())
    }

    async fn create_container(&self, request: &ContainerRequest) -> Result<String> {
        let host_config = HostConfig {
            binds: if request.binds.is_empty() {
                None
            } else {
                Some(request.binds.clone())
            },
            extra_hosts: Some(vec!["host.docker.internal:host-gateway".to_string()]),
            ..Default::default()
        };
        let config = Config {
            image: Some(request.image.clone()),
            cmd: Some(request.cmd.clone()),
            env: Some(request.env.clone()),
            working_dir: Some(CONTAINER_WORKSPACE.to_string()),
            host_config: Some(host_config),
            ..Default::default()
        };
        let options = CreateContainerOptions {
            name: request.name.clone(),
            ..Default::default()
        };
        let response = self
            .docker
            .create_container(Some(options), config)
            .await
            .with_context(|| format!("create container {}", request.name))?;
        for warning in &response.warnings {
            warn!(container = %request.name, %warning, "docker create warning");
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        self.docker
            .start_container::<String>(id, None)
            .await
            .with_context(|| format!("start container {id}"))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerPhase> {
        let response = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
            .with_context(|| format!("inspect container {id}"))?;
        let state = response.state.unwrap_or_default();
        let phase = match state.status {
            Some(ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD) => {
                ContainerPhase::Exited {
                    code: state.exit_code.unwrap_or(-1),
                }
            }
            Some(
                ContainerStateStatusEnum::RUNNING
                | ContainerStateStatusEnum::PAUSED
                | ContainerStateStatusEnum::RESTARTING,
            ) => ContainerPhase::Running,
            _ => ContainerPhase::Starting,
        };
        Ok(phase)
    }

    async fn container_logs(&self, id: &str) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut stream = self.docker.logs(id, Some(options));
        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("read logs of container {id}"))?;
            logs.push_str(&chunk.to_string());
        }
        Ok(logs)
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker
            .remove_container(id, Some(options))
            .await
            .with_context(|| format!("remove container {id}"))
    }
}

#[derive(Debug, Clone)]
pub struct DockerOptions {
    /// Program plus leading arguments inside the image.
    pub command: Vec<String>,
    pub callback_url: String,
    /// Host path bind-mounted at `/workspace`.
    pub workspace_mount: Option<String>,
    pub poll: PollPolicy,
}

pub struct DockerDriver<E> {
    engine: E,
    options: DockerOptions,
}

impl<E: ContainerEngine> DockerDriver<E> {
    pub fn new(engine: E, options: DockerOptions) -> Self {
        Self { engine, options }
    }

    async fn ensure_image(&self, image: &str, policy: ImagePullPolicy) -> Result<()> {
        let pull = match policy {
            ImagePullPolicy::Always => true,
            ImagePullPolicy::Never => false,
            ImagePullPolicy::IfNotPresent => !self.engine.image_exists(image).await?,
        };
        if pull {
            info!(image, "pulling runner image");
            self.engine.pull_image(image).await?;
        }
        Ok(())
    }

    fn container_request(&self, job: &Job) -> ContainerRequest {
        let spec = job.spec();
        let directory = Path::new(CONTAINER_WORKSPACE).join(&spec.workspace.working_directory);
        let mut cmd = self.options.command.clone();
        cmd.extend(runner_args(spec, &directory));
        let env = job_environment(spec, &self.options.callback_url)
            .into_iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect();
        let binds = self
            .options
            .workspace_mount
            .iter()
            .map(|host| format!("{host}:{CONTAINER_WORKSPACE}"))
            .collect();
        ContainerRequest {
            name: format!("run-agent-{}-{}", spec.run.id, short_suffix()),
            image: spec.backend_image.clone(),
            cmd,
            env,
            binds,
        }
    }
}

fn short_suffix() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}

#[async_trait]
impl<E: ContainerEngine> Driver for DockerDriver<E> {
    #[instrument(skip_all, fields(run_id = %job.run_id()))]
    async fn start(&self, job: &mut Job) -> Result<()> {
        let image = job.spec().backend_image.clone();
        self.ensure_image(&image, job.spec().image_pull_policy)
            .await?;

        let request = self.container_request(job);
        let container_id = self.engine.create_container(&request).await?;
        if let Err(err) = self.engine.start_container(&container_id).await {
            if let Err(remove_err) = self.engine.remove_container(&container_id).await {
                warn!(
                    %container_id,
                    error = %format!("{remove_err:#}"),
                    "failed to remove container after start failure"
                );
            }
            return Err(err);
        }

        info!(%container_id, name = %request.name, "container started");
        job.status
            .set_metadata(metadata_keys::CONTAINER_ID, container_id);
        job.status.transition(JobState::Running)?;
        Ok(())
    }

    #[instrument(skip_all, fields(run_id = %job.run_id()))]
    async fn wait(&self, job: &mut Job) -> Result<()> {
        let container_id = job
            .status
            .require_metadata(metadata_keys::CONTAINER_ID)?
            .to_string();

        let code = poll_until(&self.options.poll, || {
            let probe = self.engine.inspect_container(&container_id);
            async move {
                Ok(match probe.await? {
                    ContainerPhase::Exited { code } => Some(code),
                    ContainerPhase::Running | ContainerPhase::Starting => None,
                })
            }
        })
        .await?;

        debug!(%container_id, code, "container exited");
        if code == 0 {
            job.status.transition(JobState::Complete)?;
            Ok(())
        } else {
            job.status.transition(JobState::Failed)?;
            Err(ExitStatusError { code: Some(code) }.into())
        }
    }

    #[instrument(skip_all, fields(run_id = %job.run_id()))]
    async fn cleanup(&self, job: &mut Job) -> Result<()> {
        let Some(container_id) = job.status.get_metadata(metadata_keys::CONTAINER_ID) else {
            debug!("no container to remove");
            return Ok(());
        };
        match self.engine.container_logs(container_id).await {
            Ok(logs) => info!(container_id, logs = %logs, "container logs"),
            Err(err) => warn!(container_id, error = %format!("{err:#}"), "failed to read container logs"),
        }
        self.engine.remove_container(container_id).await
    }
}
