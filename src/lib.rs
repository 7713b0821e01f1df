//! # routeslip
//!
//! Routing-slip workflows over a point-to-point message broker.
//!
//! A slip carries its own ordered list of steps and a cursor. Each worker
//! consumes slips from one address, runs its step, and publishes the slip to
//! whatever address the next step names. Malformed messages are rejected
//! onto a dead-letter queue; competing workers share an address fairly.
//!
//! Brokers: Postgres with pgmq ([`channel::PgmqChannel`]) and an in-memory
//! broker for tests ([`channel::MemoryBroker`]).

pub mod channel;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod greeting;
pub mod poison;
pub mod producer;
pub mod slip;
pub mod telemetry;
pub mod wire;

pub use channel::{Address, Channel, Delivery, Topology};
pub use error::{Error, Result};
pub use slip::{RoutingSlip, Step};
