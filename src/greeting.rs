//! Greeting workflow: a salutation enriched with a recipient, then delivered.

use crate::error::Result;
use crate::slip::RoutingSlip;
use crate::wire::Field;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

pub const ENRICHER_ADDRESS: &str = "routing.slip.enricher";
pub const RECEIVER_ADDRESS: &str = "routing.slip.receiver";

/// Payload of a greeting slip.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Greeting {
    pub salutation: Option<String>,
    pub recipient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Fields this schema does not name, kept so they survive each hop.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Field>,
}

impl Greeting {
    pub fn new(salutation: impl Into<String>) -> Self {
        Self {
            salutation: Some(salutation.into()),
            correlation_id: Some(Uuid::new_v4()),
            ..Self::default()
        }
    }

    /// The rendered greeting, e.g. "Hello World #1 Clarissa Harlowe".
    pub fn line(&self) -> String {
        match (&self.salutation, &self.recipient) {
            (Some(s), Some(r)) => format!("{s} {r}"),
            (Some(s), None) => s.clone(),
            (None, Some(r)) => r.clone(),
            (None, None) => String::new(),
        }
    }
}

/// Enricher step: fills in the recipient.
pub fn enrich(slip: &mut RoutingSlip<Greeting>) -> Result<()> {
    slip.payload.recipient = Some("Clarissa Harlowe".to_string());
    Ok(())
}

/// Receiver step: the terminal action, which logs the greeting.
pub fn greet(slip: &mut RoutingSlip<Greeting>) -> Result<()> {
    info!(
        correlation_id = ?slip.payload.correlation_id,
        greeting = %slip.payload.line(),
        "received greeting"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn unknown_fields_ride_along() {
        let id = Uuid::new_v4();
        let body = json!({
            "salutation": "Hello",
            "recipient": null,
            "trace": id.to_string(),
            "attempt": 2,
            "current_step": 0,
            "steps": {"1": {"order": 1, "routing_key": ENRICHER_ADDRESS, "completed": false}}
        });
        let slip: RoutingSlip<Greeting> =
            RoutingSlip::from_bytes(body.to_string().as_bytes()).unwrap();
        assert_eq!(slip.payload.extra["trace"].as_uuid(), Some(id));
        assert_eq!(slip.payload.extra["attempt"], Field::Value(json!(2)));

        let again: serde_json::Value = serde_json::from_slice(&slip.to_bytes().unwrap()).unwrap();
        assert_eq!(again["trace"], json!(id.to_string()));
        assert_eq!(again["attempt"], json!(2));
    }

    #[test]
    fn enrich_sets_recipient() {
        let mut slip = RoutingSlip::new(Greeting::new("Hello"));
        enrich(&mut slip).unwrap();
        assert_eq!(slip.payload.line(), "Hello Clarissa Harlowe");
    }
}
