//! Originating producer: puts a freshly built slip onto its first address.

use crate::channel::{Address, Channel};
use crate::error::{Error, Result};
use crate::slip::RoutingSlip;
use serde::Serialize;
use tracing::debug;

/// Sends new slips into their workflows over an owned channel.
pub struct Producer<C> {
    channel: C,
}

impl<C: Channel> Producer<C> {
    pub fn new(channel: C) -> Self {
        Self { channel }
    }

    /// Publish `slip` to the address of the step it is positioned before.
    /// Returns that address.
    pub async fn send<P: Serialize + Sync>(&mut self, slip: &RoutingSlip<P>) -> Result<Address> {
        let address = slip
            .upcoming()
            .map(|step| step.routing_address.clone())
            .ok_or_else(|| Error::RoutingGap {
                order: slip.current_step.saturating_add(1),
            })?;
        let body = slip.to_bytes()?;
        self.channel.declare(&address).await?;
        self.channel.publish(&address, &body, true).await?;
        debug!(%address, bytes = body.len(), "sent slip");
        Ok(address)
    }

    pub async fn close(mut self) -> Result<()> {
        self.channel.close().await
    }
}
