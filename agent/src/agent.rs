//! Per-run orchestration.
//!
//! For each [`RunEvent`] the agent reads the run, classifies the operation,
//! refuses locked workspaces, publishes the Started event, gathers what the
//! job needs, drives it through the configured [`Driver`] and publishes
//! exactly one terminal event. Precondition failures are returned to the
//! listener; execution failures end in a Failed event and `Ok`.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{error, info, instrument, warn};

use crate::auth::Authorizer;
use crate::bus::EventBus;
use crate::core::errors::WorkspaceLockedError;
use crate::core::job::{ImagePullPolicy, Job, JobSpec};
use crate::core::lifecycle::{LifecycleEvent, Operation};
use crate::core::types::{Run, RunEvent, Workspace};
use crate::driver::{Driver, drive};
use crate::io::coordinator::Coordinator;
use crate::listener::RunHandler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSettings {
    pub runner_image: String,
    pub image_pull_policy: ImagePullPolicy,
}

/// How a dispatched attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Completed {
        operation: Operation,
    },
    Failed {
        operation: Operation,
        error: String,
    },
}

pub struct Agent {
    settings: AgentSettings,
    coordinator: Arc<dyn Coordinator>,
    driver: Arc<dyn Driver>,
    authorizer: Authorizer,
    bus: Arc<EventBus>,
}

impl Agent {
    pub fn new(
        settings: AgentSettings,
        coordinator: Arc<dyn Coordinator>,
        driver: Arc<dyn Driver>,
        authorizer: Authorizer,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            settings,
            coordinator,
            driver,
            authorizer,
            bus,
        }
    }

    /// Process one run event.
    ///
    /// Errors are precondition failures (unreadable run, unknown status,
    /// locked workspace); no event has been published for them.
    #[instrument(skip_all, fields(run_id = %event.run_id))]
    pub async fn process(&self, event: &RunEvent) -> Result<DispatchOutcome> {
        let run = self
            .coordinator
            .read_run(&event.run_id)
            .await
            .with_context(|| format!("read run {}", event.run_id))?;
        let operation = Operation::classify(&run)?;
        let workspace = self
            .coordinator
            .read_workspace(&event.organization_id, &run.workspace_id)
            .await
            .with_context(|| format!("read workspace {}", run.workspace_id))?;
        if workspace.locked {
            return Err(WorkspaceLockedError {
                workspace_id: workspace.id,
            }
            .into());
        }

        info!(%operation, workspace = %workspace.name, "dispatching run");
        self.bus
            .publish(&LifecycleEvent::started(operation, &run))
            .await;

        match self.dispatch(event, &run, workspace, operation).await {
            Ok(()) => {
                self.bus
                    .publish(&LifecycleEvent::completed(operation, &run))
                    .await;
                info!(%operation, "run completed");
                Ok(DispatchOutcome::Completed { operation })
            }
            Err(err) => {
                error!(%operation, error = %format!("{err:#}"), "run failed");
                self.bus
                    .publish(&LifecycleEvent::failed(operation, &run, &err))
                    .await;
                Ok(DispatchOutcome::Failed {
                    operation,
                    error: format!("{err:#}"),
                })
            }
        }
    }

    async fn dispatch(
        &self,
        event: &RunEvent,
        run: &Run,
        workspace: Workspace,
        operation: Operation,
    ) -> Result<()> {
        let backend_token = self
            .coordinator
            .run_backend_token(&run.id)
            .await
            .context("fetch backend token")?;
        let configuration_version = self
            .coordinator
            .read_configuration_version(&run.configuration_version_id)
            .await
            .context("read configuration version")?;
        let variables = self
            .coordinator
            .list_variables(&workspace.id)
            .await
            .context("list workspace variables")?;
        let proxy_token = self.authorizer.generate_token(&run.id).await?;

        let spec = JobSpec {
            organization_id: event.organization_id.clone(),
            backend_image: self.settings.runner_image.clone(),
            image_pull_policy: self.settings.image_pull_policy,
            run: run.clone(),
            workspace,
            backend_token,
            proxy_token,
            configuration_version,
            variables,
            operation,
        };
        let mut job = Job::new(spec);
        let result = drive(self.driver.as_ref(), &mut job).await;

        if let Err(err) = self.authorizer.revoke(&run.id).await {
            warn!(error = %format!("{err:#}"), "failed to revoke callback token");
        }
        result
    }
}

#[async_trait]
impl RunHandler for Agent {
    async fn handle(&self, event: RunEvent) -> Result<()> {
        self.process(&event).await.map(|_| ())
    }
}
