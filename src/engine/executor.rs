//! Routing step executor: one delivery, one hop.

use crate::channel::{Address, Channel, Delivery};
use crate::error::Result;
use crate::poison::{Decoded, PoisonPolicy};
use crate::slip::RoutingSlip;
use crate::telemetry::hop::{record_outcome, record_step, start_hop_span};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Instant;
use tracing::{Instrument, Span, debug, info, warn};

/// Business logic of one routing step.
///
/// Runs on every hop that executes a step, including the last one, where it
/// is the workflow's terminal action. Errors are not caught by the executor.
#[async_trait]
pub trait StepHandler<P>: Send + Sync {
    async fn handle(&self, slip: &mut RoutingSlip<P>) -> Result<()>;
}

#[async_trait]
impl<P, F> StepHandler<P> for F
where
    P: Send + 'static,
    F: Fn(&mut RoutingSlip<P>) -> Result<()> + Send + Sync,
{
    async fn handle(&self, slip: &mut RoutingSlip<P>) -> Result<()> {
        self(slip)
    }
}

/// Why a delivery was quarantined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadLetterReason {
    /// The body did not map into a slip.
    Poison,
}

impl DeadLetterReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DeadLetterReason::Poison => "poison",
        }
    }
}

/// What one call to [`RoutingStep::run_once`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HopOutcome {
    /// Nothing was queued.
    Idle,
    /// Step `order` ran and the slip went on to `to`.
    Forwarded { order: u32, to: Address },
    /// Step `order` was the last one; the slip was accepted and not
    /// republished.
    Completed { order: u32 },
    /// The slip arrived with no step after its cursor. Accepted without
    /// running the handler.
    Terminal { current_step: u32 },
    /// The delivery was rejected onto the dead-letter path.
    DeadLettered { reason: DeadLetterReason },
}

impl HopOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            HopOutcome::Idle => "idle",
            HopOutcome::Forwarded { .. } => "forwarded",
            HopOutcome::Completed { .. } => "completed",
            HopOutcome::Terminal { .. } => "terminal",
            HopOutcome::DeadLettered { .. } => "dead_lettered",
        }
    }
}

/// Consumes slips from one address, runs a handler, and passes each slip
/// on to the address of its next step.
pub struct RoutingStep<C, P, H> {
    channel: C,
    address: Address,
    policy: PoisonPolicy<P>,
    handler: H,
}

impl<C, P, H> RoutingStep<C, P, H>
where
    C: Channel,
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
    H: StepHandler<P>,
{
    /// A step decoding JSON slips from `address`.
    pub fn new(channel: C, address: impl Into<Address>, handler: H) -> Self {
        Self {
            channel,
            address: address.into(),
            policy: PoisonPolicy::json(),
            handler,
        }
    }

    /// Replace the body mapper.
    pub fn with_policy(mut self, policy: PoisonPolicy<P>) -> Self {
        self.policy = policy;
        self
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn channel(&self) -> &C {
        &self.channel
    }

    /// Declare the inbound address and set fair dispatch. Call once before
    /// the first [`run_once`](Self::run_once).
    pub async fn prepare(&mut self, prefetch: u16) -> Result<()> {
        self.channel.declare(&self.address).await?;
        self.channel.set_fair_dispatch(prefetch).await
    }

    /// Receive and process at most one delivery.
    ///
    /// The inbound delivery is accepted only after the outbound publish
    /// succeeded. On error it is left unacknowledged for redelivery.
    pub async fn run_once(&mut self) -> Result<HopOutcome> {
        let Some(delivery) = self.channel.receive(&self.address).await? else {
            debug!(address = %self.address, "did not receive message");
            return Ok(HopOutcome::Idle);
        };

        let started = Instant::now();
        let span = start_hop_span(&self.address, delivery.tag.0, delivery.redelivered);
        let outcome = self.process(&delivery).instrument(span.clone()).await?;
        record_outcome(&span, outcome.label());

        let labels = [
            KeyValue::new("address", self.address.to_string()),
            KeyValue::new("outcome", outcome.label()),
        ];
        metrics::hops().add(1, &labels);
        metrics::hop_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("address", self.address.to_string())],
        );
        Ok(outcome)
    }

    async fn process(&mut self, delivery: &Delivery) -> Result<HopOutcome> {
        let mut slip = match self.policy.decode(&delivery.body) {
            Decoded::Slip(slip) => slip,
            Decoded::Rejected(detail) => {
                return self
                    .dead_letter(delivery, DeadLetterReason::Poison, &detail)
                    .await;
            }
        };

        let next = slip.next_order().and_then(|order| {
            slip.step(order)
                .map(|step| (order, step.routing_address.clone()))
        });
        let Some((order, expected)) = next else {
            self.channel.accept(delivery).await?;
            info!(current_step = slip.current_step, "no step left on slip, workflow ended");
            return Ok(HopOutcome::Terminal {
                current_step: slip.current_step,
            });
        };
        if expected != self.address {
            warn!(%expected, "slip delivered to an address other than its step's");
        }
        record_step(&Span::current(), order);

        self.handler.handle(&mut slip).await?;
        slip.current_step = order;

        let Some(next) = slip.upcoming().map(|s| s.routing_address.clone()) else {
            self.channel.accept(delivery).await?;
            info!(order, "workflow complete");
            return Ok(HopOutcome::Completed { order });
        };

        let body = slip.to_bytes()?;
        self.channel.declare(&next).await?;
        self.channel.publish(&next, &body, true).await?;
        self.channel.accept(delivery).await?;
        info!(order, to = %next, "forwarded slip");
        Ok(HopOutcome::Forwarded { order, to: next })
    }

    async fn dead_letter(
        &mut self,
        delivery: &Delivery,
        reason: DeadLetterReason,
        detail: &str,
    ) -> Result<HopOutcome> {
        self.policy
            .quarantine(&mut self.channel, delivery, reason.as_str(), detail)
            .await?;
        Ok(HopOutcome::DeadLettered { reason })
    }

    /// Close the underlying channel, releasing any unsettled delivery.
    pub async fn close(&mut self) -> Result<()> {
        self.channel.close().await
    }
}
