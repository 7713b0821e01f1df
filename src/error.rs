//! Error types for routeslip.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Broker unreachable, dropped, or the channel was already closed.
    #[error("connection error: {0}")]
    Connection(String),

    /// A declaration conflicts with existing broker topology.
    #[error("topology error: {0}")]
    Topology(String),

    /// A message body could not be mapped into a routing slip.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The slip references a step order that has no entry.
    #[error("routing gap: slip has no step {order}")]
    RoutingGap { order: u32 },

    /// Receive attempted while the fair-dispatch limit is already held.
    #[error("prefetch limit of {prefetch} unacknowledged deliveries reached")]
    PrefetchExhausted { prefetch: u16 },

    /// Business logic of a routing step failed.
    #[error("step handler failed: {0}")]
    Handler(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Lost connectivity is reported as [`Error::Connection`] so callers can
/// tell a dead broker from a failed statement.
impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => Error::Connection(e.to_string()),
            other => Error::Database(other),
        }
    }
}
