//! pgmq queue operations via direct SQLx.
//!
//! Calls pgmq's SQL functions: pgmq.create, pgmq.send, pgmq.read,
//! pgmq.archive, pgmq.delete (inside dead-letter moves), pgmq.set_vt, pgmq.metrics.

use crate::error::{Error, Result};
use crate::telemetry::metrics;
use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};

/// A message read from a pgmq queue.
#[derive(Debug, Clone)]
pub struct PgmqMessage {
    pub msg_id: i64,
    pub read_ct: i32,
    pub enqueued_at: chrono::DateTime<chrono::Utc>,
    pub vt: chrono::DateTime<chrono::Utc>,
    pub message: serde_json::Value,
}

/// JSON wrapper around a raw message body.
///
/// pgmq stores `jsonb`, so bodies are carried as text when they are valid
/// UTF-8 and hex-encoded otherwise. Malformed JSON bodies therefore survive
/// the trip and can still be dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_hex: Option<String>,
    #[serde(default = "default_persistent")]
    pub persistent: bool,
}

fn default_persistent() -> bool {
    true
}

impl Envelope {
    pub fn wrap(bytes: &[u8], persistent: bool) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Self {
                body: Some(text.to_string()),
                body_hex: None,
                persistent,
            },
            Err(_) => Self {
                body: None,
                body_hex: Some(hex::encode(bytes)),
                persistent,
            },
        }
    }

    pub fn unwrap_body(&self) -> Result<Vec<u8>> {
        match (&self.body, &self.body_hex) {
            (Some(text), _) => Ok(text.as_bytes().to_vec()),
            (None, Some(encoded)) => hex::decode(encoded)
                .map_err(|e| Error::Deserialization(format!("bad hex body: {e}"))),
            (None, None) => Ok(Vec::new()),
        }
    }

    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| Error::Deserialization(format!("bad message envelope: {e}")))
    }
}

fn record(queue_name: &str, operation: &'static str) {
    metrics::queue_operations().add(
        1,
        &[
            KeyValue::new("queue", queue_name.to_string()),
            KeyValue::new("operation", operation),
        ],
    );
}

impl super::Db {
    /// Create a pgmq queue (idempotent).
    pub async fn create_queue(&self, queue_name: &str) -> Result<()> {
        sqlx::query("SELECT pgmq.create($1)")
            .bind(queue_name)
            .execute(self.pool())
            .await?;
        record(queue_name, "create");
        Ok(())
    }

    /// Send a message to a pgmq queue. Returns the message ID.
    pub async fn send_to_queue(&self, queue_name: &str, payload: &serde_json::Value) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT pgmq.send($1, $2)")
            .bind(queue_name)
            .bind(payload)
            .fetch_one(self.pool())
            .await?;
        record(queue_name, "send");
        Ok(row.0)
    }

    /// Read the next message from a queue (visibility timeout in seconds).
    /// Returns None if queue is empty.
    pub async fn read_from_queue(
        &self,
        queue_name: &str,
        vt_seconds: i32,
    ) -> Result<Option<PgmqMessage>> {
        let row = sqlx::query_as::<
            _,
            (
                i64,
                i32,
                chrono::DateTime<chrono::Utc>,
                chrono::DateTime<chrono::Utc>,
                serde_json::Value,
            ),
        >("SELECT msg_id, read_ct, enqueued_at, vt, message FROM pgmq.read($1, $2, 1)")
        .bind(queue_name)
        .bind(vt_seconds)
        .fetch_optional(self.pool())
        .await?;

        let msg = row.map(|(msg_id, read_ct, enqueued_at, vt, message)| PgmqMessage {
            msg_id,
            read_ct,
            enqueued_at,
            vt,
            message,
        });

        record(queue_name, if msg.is_some() { "read" } else { "read_empty" });
        Ok(msg)
    }

    /// Archive a message (moves to archive table, preserves for audit).
    pub async fn archive_message(&self, queue_name: &str, msg_id: i64) -> Result<()> {
        sqlx::query("SELECT pgmq.archive($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(self.pool())
            .await?;
        record(queue_name, "archive");
        Ok(())
    }

    /// Change when a read message becomes visible again. An offset of 0
    /// hands it straight back to the queue.
    pub async fn set_visibility(&self, queue_name: &str, msg_id: i64, vt_seconds: i32) -> Result<()> {
        sqlx::query("SELECT msg_id FROM pgmq.set_vt($1, $2, $3)")
            .bind(queue_name)
            .bind(msg_id)
            .bind(vt_seconds)
            .fetch_optional(self.pool())
            .await?;
        record(queue_name, "set_vt");
        Ok(())
    }

    /// Atomically copy a message into each of `targets` and delete it from
    /// `queue_name`. With no targets the message is only deleted.
    pub async fn move_message(
        &self,
        queue_name: &str,
        msg_id: i64,
        targets: &[String],
        payload: &serde_json::Value,
    ) -> Result<()> {
        let mut tx = self.pool().begin().await?;
        for target in targets {
            sqlx::query("SELECT pgmq.send($1, $2)")
                .bind(target)
                .bind(payload)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query("SELECT pgmq.delete($1, $2)")
            .bind(queue_name)
            .bind(msg_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        record(queue_name, "move");
        Ok(())
    }

    /// Number of messages currently stored in a queue.
    pub async fn queue_length(&self, queue_name: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as("SELECT queue_length FROM pgmq.metrics($1)")
            .bind(queue_name)
            .fetch_one(self.pool())
            .await?;
        Ok(row.0)
    }
}
