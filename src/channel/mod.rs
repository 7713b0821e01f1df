//! Reliable point-to-point channel over a message broker.
//!
//! An [`Address`] names both a queue and the routing key that feeds it, so a
//! single direct exchange behaves as a set of independent point-to-point
//! channels. Every queue is declared with a dead-letter path to
//! `"invalid." + address` so that rejected messages are quarantined instead
//! of redelivered forever.

pub mod memory;
pub mod pgmq;

pub use memory::{MemoryBroker, MemoryChannel, QueueStats};
pub use pgmq::PgmqChannel;

use crate::error::{Error, Result};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Prefix of every dead-letter routing key and queue name.
pub const DEAD_LETTER_PREFIX: &str = "invalid.";

// ---------------------------------------------------------------------------
// Address
// ---------------------------------------------------------------------------

/// A point-to-point endpoint: queue name and routing key in one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The address rejected messages are forwarded to.
    pub fn dead_letter(&self) -> Address {
        Address(format!("{DEAD_LETTER_PREFIX}{}", self.0))
    }

    pub fn is_dead_letter(&self) -> bool {
        self.0.starts_with(DEAD_LETTER_PREFIX)
    }
}

impl std::fmt::Display for Address {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Address {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&Address> for Address {
    fn from(a: &Address) -> Self {
        a.clone()
    }
}

// ---------------------------------------------------------------------------
// Topology
// ---------------------------------------------------------------------------

/// Exchange names a channel declares against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Durable direct exchange carrying workflow traffic.
    pub exchange: String,
    /// Durable direct exchange receiving rejected messages.
    pub dead_letter_exchange: String,
}

impl Default for Topology {
    fn default() -> Self {
        Self {
            exchange: "practical-messaging-work-queue".to_string(),
            dead_letter_exchange: "practical-messaging-invalid".to_string(),
        }
    }
}

/// Dead-letter arguments attached to a queue at declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    pub routing_key: Address,
}

impl DeadLetter {
    pub fn for_address(topology: &Topology, address: &Address) -> Self {
        Self {
            exchange: topology.dead_letter_exchange.clone(),
            routing_key: address.dead_letter(),
        }
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Channel-local handle used to accept or reject a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeliveryTag(pub u64);

impl std::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a consumer and not yet acknowledged.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub tag: DeliveryTag,
    pub address: Address,
    pub body: Vec<u8>,
    /// True if the broker handed this message out before.
    pub redelivered: bool,
}

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// A broker session owned by exactly one worker.
///
/// Receives never acknowledge implicitly: every delivery must end in
/// [`Channel::accept`] or [`Channel::reject`], or be released by
/// [`Channel::close`] for redelivery.
#[async_trait]
pub trait Channel: Send {
    /// Idempotently declare the exchange, queue, binding and dead-letter
    /// path for `address`.
    async fn declare(&mut self, address: &Address) -> Result<()>;

    /// Limit this channel to `prefetch` unacknowledged deliveries. Must be
    /// called before the first receive.
    async fn set_fair_dispatch(&mut self, prefetch: u16) -> Result<()>;

    /// Publish `body` to the exchange under routing key `address`.
    async fn publish(&mut self, address: &Address, body: &[u8], persistent: bool) -> Result<()>;

    /// Take the next message from `address`, or `None` if it is empty.
    async fn receive(&mut self, address: &Address) -> Result<Option<Delivery>>;

    /// Remove the delivery from its queue for good.
    async fn accept(&mut self, delivery: &Delivery) -> Result<()>;

    /// Remove the delivery from its queue. Without requeue the broker
    /// forwards it along the queue's dead-letter path.
    async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<()>;

    /// Release the session. Unacknowledged deliveries become visible again.
    async fn close(&mut self) -> Result<()>;
}

// ---------------------------------------------------------------------------
// Shared bookkeeping
// ---------------------------------------------------------------------------

/// Per-channel prefetch accounting and in-flight delivery tracking.
///
/// `T` is whatever the broker needs to settle a delivery later.
#[derive(Debug)]
pub(crate) struct InFlight<T> {
    prefetch: Option<u16>,
    received_any: bool,
    next_tag: u64,
    deliveries: HashMap<DeliveryTag, T>,
}

impl<T> InFlight<T> {
    pub(crate) fn new() -> Self {
        Self {
            prefetch: None,
            received_any: false,
            next_tag: 0,
            deliveries: HashMap::new(),
        }
    }

    pub(crate) fn set_prefetch(&mut self, prefetch: u16) -> Result<()> {
        if self.received_any {
            return Err(Error::Topology(
                "fair dispatch must be configured before the first receive".to_string(),
            ));
        }
        if prefetch == 0 {
            return Err(Error::Topology("prefetch must be at least 1".to_string()));
        }
        self.prefetch = Some(prefetch);
        Ok(())
    }

    pub(crate) fn prefetch(&self) -> Option<u16> {
        self.prefetch
    }

    /// Fails if another delivery would exceed the prefetch limit.
    pub(crate) fn check_capacity(&mut self) -> Result<()> {
        self.received_any = true;
        match self.prefetch {
            Some(prefetch) if self.deliveries.len() >= usize::from(prefetch) => {
                Err(Error::PrefetchExhausted { prefetch })
            }
            _ => Ok(()),
        }
    }

    pub(crate) fn track(&mut self, handle: T) -> DeliveryTag {
        self.next_tag += 1;
        let tag = DeliveryTag(self.next_tag);
        self.deliveries.insert(tag, handle);
        tag
    }

    pub(crate) fn settle(&mut self, tag: DeliveryTag) -> Result<T> {
        self.deliveries
            .remove(&tag)
            .ok_or_else(|| Error::Other(format!("unknown or already settled delivery {tag}")))
    }

    pub(crate) fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub(crate) fn drain(&mut self) -> Vec<T> {
        self.deliveries.drain().map(|(_, handle)| handle).collect()
    }
}

/// Record a channel operation against the shared counter.
pub(crate) fn record_operation(address: &Address, operation: &'static str) {
    metrics::channel_operations().add(
        1,
        &[
            KeyValue::new("address", address.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}
