//! Broker listener: run events consumed from an AMQP queue.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{BasicConsumeOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties, Consumer};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{Listener, RunEvent, RunHandler};

const CONSUMER_TAG: &str = "run-agent";

/// A stream of raw message bodies.
#[async_trait]
pub trait DeliverySource: Send {
    /// Next body. `Some(Err)` is a transient failure; `None` means the
    /// source is exhausted and will never yield again.
    async fn next_delivery(&mut self) -> Option<Result<Vec<u8>>>;
}

struct AmqpSession {
    _connection: Connection,
    _channel: Channel,
    consumer: Consumer,
}

/// AMQP queue consumer with automatic acknowledgement.
///
/// Messages are acked by the broker on delivery, so a crash mid-run loses
/// that message. The connection is re-established after failures, waiting
/// `reconnect_interval` between attempts.
pub struct AmqpSource {
    url: String,
    queue: String,
    reconnect_interval: Duration,
    session: Option<AmqpSession>,
}

impl AmqpSource {
    pub fn new(url: impl Into<String>, queue: impl Into<String>, reconnect_interval: Duration) -> Self {
        Self {
            url: url.into(),
            queue: queue.into(),
            reconnect_interval,
            session: None,
        }
    }

    async fn open(&self) -> Result<AmqpSession> {
        let connection = Connection::connect(&self.url, ConnectionProperties::default())
            .await
            .context("connect to amqp broker")?;
        let channel = connection
            .create_channel()
            .await
            .context("open amqp channel")?;
        channel
            .queue_declare(&self.queue, queue_check_options(), FieldTable::default())
            .await
            .with_context(|| format!("queue {} is not available", self.queue))?;
        let consumer = channel
            .basic_consume(
                &self.queue,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack: true,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("consume queue {}", self.queue))?;
        info!(queue = %self.queue, "consuming run events");
        Ok(AmqpSession {
            _connection: connection,
            _channel: channel,
            consumer,
        })
    }
}

/// Passive: only checks that the operator's queue exists.
fn queue_check_options() -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: true,
        ..QueueDeclareOptions::default()
    }
}

#[async_trait]
impl DeliverySource for AmqpSource {
    async fn next_delivery(&mut self) -> Option<Result<Vec<u8>>> {
        if self.session.is_none() {
            match self.open().await {
                Ok(session) => self.session = Some(session),
                Err(err) => {
                    tokio::time::sleep(self.reconnect_interval).await;
                    return Some(Err(err));
                }
            }
        }
        let session = self.session.as_mut()?;
        match session.consumer.next().await {
            Some(Ok(delivery)) => Some(Ok(delivery.data)),
            Some(Err(err)) => {
                self.session = None;
                Some(Err(anyhow::Error::new(err).context("receive amqp delivery")))
            }
            None => {
                self.session = None;
                Some(Err(anyhow!("amqp consumer stream closed")))
            }
        }
    }
}

/// Consumes JSON-encoded [`RunEvent`]s from a [`DeliverySource`].
///
/// Malformed bodies and handler errors are logged and dropped; nothing is
/// redelivered by the agent.
pub struct BrokerListener<S> {
    source: S,
}

impl<S: DeliverySource> BrokerListener<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }
}

#[async_trait]
impl<S: DeliverySource> Listener for BrokerListener<S> {
    async fn listen(
        &mut self,
        handler: &dyn RunHandler,
        shutdown: CancellationToken,
    ) -> Result<()> {
        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                delivery = self.source.next_delivery() => delivery,
            };
            let body = match delivery {
                Some(Ok(body)) => body,
                Some(Err(err)) => {
                    warn!(error = %format!("{err:#}"), "delivery failed");
                    continue;
                }
                None => {
                    info!("delivery source exhausted");
                    break;
                }
            };

            let event: RunEvent = match serde_json::from_slice(&body) {
                Ok(event) => event,
                Err(err) => {
                    error!(
                        error = %err,
                        body = %String::from_utf8_lossy(&body),
                        "discarding malformed run event"
                    );
                    continue;
                }
            };
            let run_id = event.run_id.clone();
            if let Err(err) = handler.handle(event).await {
                error!(%run_id, error = %format!("{err:#}"), "failed handling run");
            }
        }
        info!("broker listener stopped");
        Ok(())
    }
}
