//! Run discovery.
//!
//! A [`Listener`] finds pending runs and hands them to a [`RunHandler`] one at
//! a time, awaiting each before asking for the next. Handler errors are logged
//! and never end the loop; cancelling the shutdown token does, between events.

pub mod broker;
pub mod polling;

use anyhow::Result;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use crate::core::types::RunEvent;
pub use self::broker::{AmqpSource, BrokerListener, DeliverySource};
pub use self::polling::PollingListener;

#[async_trait]
pub trait RunHandler: Send + Sync {
    async fn handle(&self, event: RunEvent) -> Result<()>;
}

#[async_trait]
pub trait Listener: Send {
    /// Deliver events to `handler` until `shutdown` is cancelled.
    async fn listen(
        &mut self,
        handler: &dyn RunHandler,
        shutdown: CancellationToken,
    ) -> Result<()>;
}
