//! Execution engine: per-hop executor, polling worker, supervisor.

pub mod executor;
pub mod supervisor;
pub mod worker;

pub use executor::{DeadLetterReason, HopOutcome, RoutingStep, StepHandler};
pub use supervisor::{ShutdownReport, Supervisor, WorkerExit, WorkerOutcome};
pub use worker::{Worker, WorkerReport};
