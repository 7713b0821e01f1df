//! Typed configuration from environment variables and workflow files.
//!
//! Loads once at startup, fails fast if required vars are missing.
//! The database URL is wrapped in `secrecy::SecretString` to keep it out of logs.

use crate::channel::{Address, Topology};
use crate::channel::pgmq::DEFAULT_VISIBILITY_TIMEOUT;
use crate::error::{Error, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub topology: Topology,
    /// Seconds a received message stays hidden from other consumers.
    pub visibility_timeout: i32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let defaults = Topology::default();
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            topology: Topology {
                exchange: std::env::var("ROUTESLIP_EXCHANGE").unwrap_or(defaults.exchange),
                dead_letter_exchange: std::env::var("ROUTESLIP_INVALID_EXCHANGE")
                    .unwrap_or(defaults.dead_letter_exchange),
            },
            visibility_timeout: parsed_var("ROUTESLIP_VISIBILITY_TIMEOUT")?
                .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT),
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("{name}={raw:?} is not a valid value"))),
        Err(_) => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// Worker timings
// ---------------------------------------------------------------------------

/// Timings for the polling loop and its shutdown handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerConfig {
    /// Pause after a poll that found nothing.
    pub idle_interval: Duration,
    /// Bounded wait on the cancellation token after every iteration.
    pub cancel_wait: Duration,
    /// How long a supervisor waits for workers after cancelling them.
    pub shutdown_timeout: Duration,
    /// Unacknowledged deliveries allowed per worker.
    pub prefetch: u16,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_millis(500),
            cancel_wait: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(30),
            prefetch: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Workflow definitions
// ---------------------------------------------------------------------------

/// Top-level TOML wrapper.
#[derive(Debug, Deserialize)]
struct WorkflowFile {
    workflow: WorkflowConfig,
}

/// An ordered list of step addresses a producer stamps onto new slips.
///
/// ```toml
/// [workflow]
/// name = "greeting"
/// steps = ["routing.slip.enricher", "routing.slip.receiver"]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WorkflowConfig {
    pub name: String,
    pub steps: Vec<Address>,
}

impl WorkflowConfig {
    pub fn parse(content: &str) -> Result<Self> {
        let file: WorkflowFile =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad workflow: {e}")))?;
        let workflow = file.workflow;
        if workflow.steps.is_empty() {
            return Err(Error::Config(format!(
                "workflow {} has no steps",
                workflow.name
            )));
        }
        if let Some(bad) = workflow.steps.iter().find(|a| a.as_str().is_empty()) {
            return Err(Error::Config(format!(
                "workflow {} has an empty step address {bad:?}",
                workflow.name
            )));
        }
        Ok(workflow)
    }

    /// Load a workflow definition from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read workflow {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    pub fn first(&self) -> Option<&Address> {
        self.steps.first()
    }
}
