//! Postgres broker: pgmq queues plus topology tables.
//!
//! Unacknowledged deliveries are hidden by pgmq's visibility timeout, so a
//! worker that dies without closing its channel still gets its message
//! redelivered once the timeout lapses.

use super::{Address, Channel, DeadLetter, Delivery, InFlight, Topology, record_operation};
use crate::db::Db;
use crate::db::pgmq::Envelope;
use crate::db::topology::QueueInfo;
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Default visibility timeout (seconds) for reads.
pub const DEFAULT_VISIBILITY_TIMEOUT: i32 = 30;

#[derive(Debug)]
struct Pending {
    queue: QueueInfo,
    msg_id: i64,
    envelope: serde_json::Value,
}

/// A session on the Postgres broker.
#[derive(Debug)]
pub struct PgmqChannel {
    db: Db,
    topology: Topology,
    visibility_timeout: i32,
    in_flight: InFlight<Pending>,
    queues: HashMap<Address, QueueInfo>,
    closed: bool,
}

impl PgmqChannel {
    /// Open a session without declaring anything.
    pub async fn connect(db: Db, topology: Topology) -> Result<Self> {
        db.health_check()
            .await
            .map_err(|e| Error::Connection(format!("broker unavailable: {e}")))?;
        Ok(Self {
            db,
            topology,
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            in_flight: InFlight::new(),
            queues: HashMap::new(),
            closed: false,
        })
    }

    /// Open a session and declare the topology for `address`.
    pub async fn open(db: Db, topology: Topology, address: &Address) -> Result<Self> {
        let mut channel = Self::connect(db, topology).await?;
        channel.declare(address).await?;
        Ok(channel)
    }

    pub fn with_visibility_timeout(mut self, seconds: i32) -> Self {
        self.visibility_timeout = seconds.max(1);
        self
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::Connection("channel is closed".to_string()))
        } else {
            Ok(())
        }
    }

    /// Declared queue for `address`, from cache or the topology tables.
    async fn queue(&mut self, address: &Address) -> Result<QueueInfo> {
        if let Some(info) = self.queues.get(address) {
            return Ok(info.clone());
        }
        let info = self
            .db
            .queue_info(address)
            .await?
            .ok_or_else(|| Error::Topology(format!("queue {address} is not declared")))?;
        self.queues.insert(address.clone(), info.clone());
        Ok(info)
    }
}

#[async_trait]
impl Channel for PgmqChannel {
    async fn declare(&mut self, address: &Address) -> Result<()> {
        self.ensure_open()?;
        if self.queues.contains_key(address) {
            return Ok(());
        }
        let dead_letter = DeadLetter::for_address(&self.topology, address);
        let dl_queue = dead_letter.routing_key.clone();

        self.db.declare_exchange(&self.topology.exchange, true).await?;
        self.db
            .declare_exchange(&self.topology.dead_letter_exchange, true)
            .await?;

        self.db.declare_queue(&dl_queue, true, None).await?;
        self.db
            .bind_queue(&self.topology.dead_letter_exchange, &dl_queue, &dl_queue)
            .await?;

        let info = self.db.declare_queue(address, true, Some(&dead_letter)).await?;
        self.db
            .bind_queue(&self.topology.exchange, address, address)
            .await?;

        debug!(%address, pgmq = %info.pgmq_name, "declared topology");
        self.queues.insert(address.clone(), info);
        Ok(())
    }

    async fn set_fair_dispatch(&mut self, prefetch: u16) -> Result<()> {
        self.ensure_open()?;
        self.in_flight.set_prefetch(prefetch)
    }

    async fn publish(&mut self, address: &Address, body: &[u8], persistent: bool) -> Result<()> {
        self.ensure_open()?;
        let targets = self.db.route(&self.topology.exchange, address).await?;
        if targets.is_empty() {
            warn!(%address, "message unroutable, dropped");
            metrics::unroutable().add(1, &[KeyValue::new("address", address.to_string())]);
            return Ok(());
        }
        let envelope = serde_json::to_value(Envelope::wrap(body, persistent))?;
        for target in &targets {
            self.db.send_to_queue(target, &envelope).await?;
        }
        record_operation(address, "publish");
        Ok(())
    }

    async fn receive(&mut self, address: &Address) -> Result<Option<Delivery>> {
        self.ensure_open()?;
        self.in_flight.check_capacity()?;
        let queue = self.queue(address).await?;

        let Some(msg) = self
            .db
            .read_from_queue(&queue.pgmq_name, self.visibility_timeout)
            .await?
        else {
            record_operation(address, "receive_empty");
            return Ok(None);
        };

        let body = match Envelope::from_value(msg.message.clone()).and_then(|e| e.unwrap_body()) {
            Ok(body) => body,
            // Not ours: hand the raw JSON to the consumer, which will
            // quarantine it if it cannot be mapped.
            Err(_) => serde_json::to_vec(&msg.message)?,
        };

        debug!(
            %address,
            msg_id = msg.msg_id,
            read_ct = msg.read_ct,
            enqueued_at = %msg.enqueued_at,
            visible_at = %msg.vt,
            "read message"
        );
        let tag = self.in_flight.track(Pending {
            queue,
            msg_id: msg.msg_id,
            envelope: msg.message,
        });
        record_operation(address, "receive");
        Ok(Some(Delivery {
            tag,
            address: address.clone(),
            body,
            redelivered: msg.read_ct > 1,
        }))
    }

    async fn accept(&mut self, delivery: &Delivery) -> Result<()> {
        self.ensure_open()?;
        let pending = self.in_flight.settle(delivery.tag)?;
        self.db
            .archive_message(&pending.queue.pgmq_name, pending.msg_id)
            .await?;
        record_operation(&delivery.address, "accept");
        Ok(())
    }

    async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        let pending = self.in_flight.settle(delivery.tag)?;

        if requeue {
            self.db
                .set_visibility(&pending.queue.pgmq_name, pending.msg_id, 0)
                .await?;
            record_operation(&delivery.address, "requeue");
            return Ok(());
        }

        let targets = match &pending.queue.dead_letter {
            Some(dl) => self.db.route(&dl.exchange, &dl.routing_key).await?,
            None => Vec::new(),
        };
        if targets.is_empty() {
            debug!(address = %delivery.address, "no dead-letter queue, message discarded");
        }
        self.db
            .move_message(
                &pending.queue.pgmq_name,
                pending.msg_id,
                &targets,
                &pending.envelope,
            )
            .await?;
        record_operation(&delivery.address, "reject");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let mut first_error = None;
        for pending in self.in_flight.drain() {
            if let Err(e) = self
                .db
                .set_visibility(&pending.queue.pgmq_name, pending.msg_id, 0)
                .await
            {
                warn!(msg_id = pending.msg_id, "could not release delivery on close: {e}");
                first_error.get_or_insert(e);
            }
        }
        debug!("channel closed");
        first_error.map_or(Ok(()), Err)
    }
}
