//! Polling listener over the coordinator's run queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::{Listener, RunEvent, RunHandler};
use crate::io::coordinator::Coordinator;

/// Polls the organization's run queue on a fixed interval.
pub struct PollingListener {
    coordinator: Arc<dyn Coordinator>,
    organization_id: String,
    interval: Duration,
}

impl PollingListener {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        organization_id: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            organization_id: organization_id.into(),
            interval,
        }
    }
}

#[async_trait]
impl Listener for PollingListener {
    async fn listen(
        &mut self,
        handler: &dyn RunHandler,
        shutdown: CancellationToken,
    ) -> Result<()> {
        info!(
            organization_id = %self.organization_id,
            interval_ms = self.interval.as_millis() as u64,
            "polling run queue"
        );
        'poll: loop {
            let queue = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'poll,
                queue = self.coordinator.run_queue(&self.organization_id) => queue,
            };

            match queue {
                Ok(runs) => {
                    debug!(queued = runs.len(), "run queue fetched");
                    for run in runs {
                        if shutdown.is_cancelled() {
                            break 'poll;
                        }
                        let event = RunEvent::from_run(&self.organization_id, &run);
                        let run_id = event.run_id.clone();
                        if let Err(err) = handler.handle(event).await {
                            error!(%run_id, error = %format!("{err:#}"), "failed handling run");
                        }
                    }
                }
                Err(err) => {
                    error!(error = %format!("{err:#}"), "failed fetching run queue");
                }
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break 'poll,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("polling listener stopped");
        Ok(())
    }
}
