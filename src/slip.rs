//! Routing slip data model.
//!
//! A routing slip carries its own workflow: an ordered map of steps and a
//! cursor. The step a slip is addressed to is always `current_step + 1`;
//! a slip with no entry at that position has finished its workflow.

use crate::channel::Address;
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// Step
// ---------------------------------------------------------------------------

/// One hop in a workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    /// 1-based position within the slip.
    pub order: u32,

    /// Where the slip goes for this step. Serialized as `routing_key` to
    /// stay compatible with deployed producers.
    #[serde(rename = "routing_key")]
    pub routing_address: Address,

    /// Reserved. Persisted with the slip but never read by the engine.
    #[serde(default)]
    pub completed: bool,
}

impl Step {
    pub fn new(order: u32, routing_address: impl Into<Address>) -> Self {
        Self {
            order,
            routing_address: routing_address.into(),
            completed: false,
        }
    }
}

// ---------------------------------------------------------------------------
// RoutingSlip
// ---------------------------------------------------------------------------

/// The unit of work travelling end to end.
///
/// Payload fields are flattened into the top-level JSON object next to
/// `steps` and `current_step`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(serialize = "P: Serialize", deserialize = "P: DeserializeOwned"))]
pub struct RoutingSlip<P> {
    #[serde(with = "step_map")]
    pub steps: BTreeMap<u32, Step>,

    #[serde(default)]
    pub current_step: u32,

    #[serde(flatten)]
    pub payload: P,
}

impl<P> RoutingSlip<P> {
    /// A slip with no steps, positioned before step 1.
    pub fn new(payload: P) -> Self {
        Self {
            steps: BTreeMap::new(),
            current_step: 0,
            payload,
        }
    }

    /// Append a step after the highest existing order.
    pub fn with_step(mut self, routing_address: impl Into<Address>) -> Self {
        let order = self.steps.keys().next_back().copied().unwrap_or(0) + 1;
        self.steps.insert(order, Step::new(order, routing_address));
        self
    }

    /// Build a slip from an ordered list of addresses.
    pub fn from_addresses<I, A>(payload: P, addresses: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Address>,
    {
        addresses
            .into_iter()
            .fold(Self::new(payload), |slip, address| slip.with_step(address))
    }

    pub fn step(&self, order: u32) -> Option<&Step> {
        self.steps.get(&order)
    }

    /// Order of the step after the cursor. `None` once the cursor sits at
    /// `u32::MAX`, where no further step can exist.
    pub fn next_order(&self) -> Option<u32> {
        self.current_step.checked_add(1)
    }

    /// The step at `current_step + 1`, if any. This is the step the slip is
    /// addressed to while in flight.
    pub fn upcoming(&self) -> Option<&Step> {
        self.next_order().and_then(|order| self.steps.get(&order))
    }

    /// True once no step remains after the cursor.
    pub fn is_terminal(&self) -> bool {
        self.upcoming().is_none()
    }
}

impl<P: Serialize> RoutingSlip<P> {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

impl<P: DeserializeOwned> RoutingSlip<P> {
    /// Decode a slip from a JSON message body.
    pub fn from_bytes(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Steps are keyed by stringified order on the wire. Keys are parsed by hand
/// because integer map keys do not survive serde's flatten buffering.
mod step_map {
    use super::Step;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(
        steps: &BTreeMap<u32, Step>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_map(steps.iter().map(|(order, step)| (order.to_string(), step)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<u32, Step>, D::Error> {
        let raw = BTreeMap::<String, Step>::deserialize(deserializer)?;
        let mut steps = BTreeMap::new();
        for (key, step) in raw {
            let order: u32 = key
                .parse()
                .map_err(|_| D::Error::custom(format!("step key {key:?} is not an integer")))?;
            if order == 0 {
                return Err(D::Error::custom("step orders are 1-based"));
            }
            if order != step.order {
                return Err(D::Error::custom(format!(
                    "step key {order} does not match step order {}",
                    step.order
                )));
            }
            steps.insert(order, step);
        }
        Ok(steps)
    }
}
