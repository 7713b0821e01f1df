//! Supervisor: starts workers on their own tasks and shuts them down.
//!
//! The supervisor does no broker I/O itself. Shutdown is best-effort: after
//! cancelling, it waits up to a fixed timeout and then leaves any worker
//! still running to die with the process.

use super::executor::StepHandler;
use super::worker::{Worker, WorkerReport};
use crate::channel::Channel;
use crate::error::Error;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How a worker ended.
#[derive(Debug)]
pub enum WorkerOutcome {
    /// Stopped after cancellation.
    Stopped(WorkerReport),
    /// Terminated by an error.
    Failed(Error),
    /// The task panicked or was aborted.
    Panicked(String),
    /// Still running when the shutdown timeout expired.
    TimedOut,
}

/// A worker that has exited (or was given up on).
#[derive(Debug)]
pub struct WorkerExit {
    pub name: String,
    pub outcome: WorkerOutcome,
}

/// Result of [`Supervisor::shutdown`].
#[derive(Debug, Default)]
pub struct ShutdownReport {
    pub exits: Vec<WorkerExit>,
}

impl ShutdownReport {
    /// True when every worker stopped within the timeout.
    pub fn all_stopped(&self) -> bool {
        self.exits
            .iter()
            .all(|exit| !matches!(exit.outcome, WorkerOutcome::TimedOut))
    }
}

struct Running {
    name: String,
    handle: JoinHandle<crate::error::Result<WorkerReport>>,
}

/// Owns the cancellation token shared by all of its workers.
pub struct Supervisor {
    cancel: CancellationToken,
    shutdown_timeout: Duration,
    workers: Vec<Running>,
}

impl Supervisor {
    pub fn new(shutdown_timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            shutdown_timeout,
            workers: Vec::new(),
        }
    }

    /// Start `worker` on a dedicated task.
    pub fn spawn<C, P, H>(&mut self, worker: Worker<C, P, H>)
    where
        C: Channel + 'static,
        P: Serialize + DeserializeOwned + Send + Sync + 'static,
        H: StepHandler<P> + 'static,
    {
        let name = worker.name().to_string();
        info!(worker = %name, address = %worker.address(), "spawning worker");
        let handle = tokio::spawn(worker.run(self.cancel.child_token()));
        self.workers.push(Running { name, handle });
    }

    /// Number of workers not yet reaped.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Collect workers that have already exited, without waiting.
    ///
    /// Restarting them is left to the caller.
    pub async fn reap(&mut self) -> Vec<WorkerExit> {
        let (finished, running): (Vec<_>, Vec<_>) = std::mem::take(&mut self.workers)
            .into_iter()
            .partition(|w| w.handle.is_finished());
        self.workers = running;

        let mut exits = Vec::with_capacity(finished.len());
        for worker in finished {
            let outcome = join_outcome(worker.handle.await);
            exits.push(WorkerExit {
                name: worker.name,
                outcome,
            });
        }
        exits
    }

    /// Signal cancellation, then wait up to the shutdown timeout for every
    /// worker to stop.
    pub async fn shutdown(self) -> ShutdownReport {
        info!(workers = self.workers.len(), "shutting down workers");
        self.cancel.cancel();
        let deadline = tokio::time::Instant::now() + self.shutdown_timeout;

        let mut report = ShutdownReport::default();
        for mut worker in self.workers {
            let outcome = match tokio::time::timeout_at(deadline, &mut worker.handle).await {
                Ok(joined) => join_outcome(joined),
                Err(_) => {
                    warn!(worker = %worker.name, "worker did not stop in time, abandoning it");
                    WorkerOutcome::TimedOut
                }
            };
            report.exits.push(WorkerExit {
                name: worker.name,
                outcome,
            });
        }
        report
    }
}

fn join_outcome(
    joined: std::result::Result<crate::error::Result<WorkerReport>, tokio::task::JoinError>,
) -> WorkerOutcome {
    match joined {
        Ok(Ok(report)) => WorkerOutcome::Stopped(report),
        Ok(Err(e)) => WorkerOutcome::Failed(e),
        Err(e) => WorkerOutcome::Panicked(e.to_string()),
    }
}
