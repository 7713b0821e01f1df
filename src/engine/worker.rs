//! Cooperative polling loop with a bounded-latency cancellation check.
//!
//! ```text
//! Running -> (idle pause | process one) -> CheckCancellation -> Running | Stopped
//! ```
//!
//! Cancellation is only observed between iterations. A worker asked to stop
//! finishes the hop it is on, waits at most `cancel_wait`, then closes its
//! channel and returns.

use super::executor::{HopOutcome, RoutingStep, StepHandler};
use crate::channel::{Address, Channel};
use crate::config::WorkerConfig;
use crate::error::Result;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Counts of what a worker did before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub forwarded: u64,
    pub completed: u64,
    pub dead_lettered: u64,
    pub idle_polls: u64,
}

impl WorkerReport {
    fn record(&mut self, outcome: &HopOutcome) {
        match outcome {
            HopOutcome::Idle => self.idle_polls += 1,
            HopOutcome::Forwarded { .. } => self.forwarded += 1,
            HopOutcome::Completed { .. } | HopOutcome::Terminal { .. } => self.completed += 1,
            HopOutcome::DeadLettered { .. } => self.dead_lettered += 1,
        }
    }

    /// Deliveries taken off the queue, whatever became of them.
    pub fn processed(&self) -> u64 {
        self.forwarded + self.completed + self.dead_lettered
    }
}

/// Drives one [`RoutingStep`] until cancelled or until a hop fails.
pub struct Worker<C, P, H> {
    name: String,
    step: RoutingStep<C, P, H>,
    config: WorkerConfig,
}

impl<C, P, H> Worker<C, P, H>
where
    C: Channel,
    P: Serialize + DeserializeOwned + Send + Sync + 'static,
    H: StepHandler<P>,
{
    pub fn new(name: impl Into<String>, step: RoutingStep<C, P, H>, config: WorkerConfig) -> Self {
        Self {
            name: name.into(),
            step,
            config,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &Address {
        self.step.address()
    }

    /// Run until `cancel` fires. The channel is closed on every exit path.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a hop (handler failures included)
    /// or by closing the channel. The in-flight delivery, if any, is
    /// released for redelivery.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<WorkerReport> {
        let result = self.poll(&cancel).await;
        let closed = self.step.close().await;

        match (result, closed) {
            (Ok(report), Ok(())) => {
                info!(worker = %self.name, ?report, "worker stopped");
                Ok(report)
            }
            (Ok(_), Err(e)) => {
                error!(worker = %self.name, "failed to close channel: {e}");
                Err(e)
            }
            (Err(e), closed) => {
                if let Err(close_err) = closed {
                    warn!(worker = %self.name, "failed to close channel: {close_err}");
                }
                error!(worker = %self.name, "worker terminated: {e}");
                Err(e)
            }
        }
    }

    async fn poll(&mut self, cancel: &CancellationToken) -> Result<WorkerReport> {
        self.step.prepare(self.config.prefetch).await?;
        info!(worker = %self.name, address = %self.step.address(), "worker started");

        let mut report = WorkerReport::default();
        loop {
            let outcome = self.step.run_once().await?;
            report.record(&outcome);
            if outcome == HopOutcome::Idle {
                tokio::time::sleep(self.config.idle_interval).await;
            }

            if cancelled_within(cancel, self.config.cancel_wait).await {
                info!(worker = %self.name, "stop instruction received");
                return Ok(report);
            }
        }
    }
}

/// Wait up to `wait` for `cancel` to fire.
async fn cancelled_within(cancel: &CancellationToken, wait: std::time::Duration) -> bool {
    tokio::time::timeout(wait, cancel.cancelled()).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn bounded_wait_reports_cancellation() {
        let cancel = CancellationToken::new();
        assert!(!cancelled_within(&cancel, Duration::from_millis(5)).await);
        cancel.cancel();
        assert!(cancelled_within(&cancel, Duration::from_millis(5)).await);
    }

    #[test]
    fn report_counts_by_outcome() {
        let mut report = WorkerReport::default();
        report.record(&HopOutcome::Idle);
        report.record(&HopOutcome::Completed { order: 2 });
        report.record(&HopOutcome::Forwarded {
            order: 1,
            to: Address::new("b"),
        });
        assert_eq!(report.processed(), 2);
        assert_eq!(report.idle_polls, 1);
    }
}
