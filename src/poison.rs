//! Poison message handling.
//!
//! A body that cannot be mapped into a slip is never retried: the consumer
//! rejects it without requeue so the broker moves it onto the queue's
//! dead-letter path.

use crate::channel::{Channel, Delivery};
use crate::error::Result;
use crate::slip::RoutingSlip;
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::warn;

/// Maps a raw message body into a typed slip.
pub type Mapper<P> = Arc<dyn Fn(&[u8]) -> Result<RoutingSlip<P>> + Send + Sync>;

/// Outcome of mapping a body.
#[derive(Debug)]
pub enum Decoded<P> {
    Slip(RoutingSlip<P>),
    Rejected(String),
}

/// Run `mapper`, turning any failure into [`Decoded::Rejected`].
pub fn try_deserialize<P>(
    body: &[u8],
    mapper: impl FnOnce(&[u8]) -> Result<RoutingSlip<P>>,
) -> Decoded<P> {
    match mapper(body) {
        Ok(slip) => Decoded::Slip(slip),
        Err(e) => Decoded::Rejected(e.to_string()),
    }
}

/// Decodes deliveries and quarantines the ones that do not decode.
pub struct PoisonPolicy<P> {
    mapper: Mapper<P>,
}

impl<P> Clone for PoisonPolicy<P> {
    fn clone(&self) -> Self {
        Self {
            mapper: Arc::clone(&self.mapper),
        }
    }
}

impl<P: DeserializeOwned> PoisonPolicy<P> {
    /// Decode bodies as JSON routing slips.
    pub fn json() -> Self {
        Self::with_mapper(|body| RoutingSlip::from_bytes(body))
    }
}

impl<P: DeserializeOwned> Default for PoisonPolicy<P> {
    fn default() -> Self {
        Self::json()
    }
}

impl<P> PoisonPolicy<P> {
    pub fn with_mapper(
        mapper: impl Fn(&[u8]) -> Result<RoutingSlip<P>> + Send + Sync + 'static,
    ) -> Self {
        Self {
            mapper: Arc::new(mapper),
        }
    }

    pub fn decode(&self, body: &[u8]) -> Decoded<P> {
        try_deserialize(body, |b| (self.mapper)(b))
    }

    /// Reject `delivery` without requeue and account for it.
    pub async fn quarantine<C: Channel + ?Sized>(
        &self,
        channel: &mut C,
        delivery: &Delivery,
        reason: &'static str,
        detail: &str,
    ) -> Result<()> {
        warn!(
            address = %delivery.address,
            tag = %delivery.tag,
            reason,
            detail,
            "rejecting message to dead-letter path"
        );
        channel.reject(delivery, false).await?;
        metrics::dead_lettered().add(
            1,
            &[
                KeyValue::new("address", delivery.address.to_string()),
                KeyValue::new("reason", reason),
            ],
        );
        Ok(())
    }
}
