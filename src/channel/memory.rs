//! In-memory broker with the same topology and delivery semantics as the
//! Postgres broker. Used by tests and local demos.

use super::{
    Address, Channel, DeadLetter, Delivery, InFlight, Topology, record_operation,
};
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    persistent: bool,
    redelivered: bool,
}

#[derive(Debug)]
struct ExchangeState {
    durable: bool,
    bindings: HashMap<Address, BTreeSet<String>>,
}

#[derive(Debug)]
struct QueueState {
    durable: bool,
    dead_letter: Option<DeadLetter>,
    ready: VecDeque<Message>,
    unacked: usize,
    stats: QueueStats,
}

/// Counters kept per queue for inspection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub published: u64,
    pub receive_calls: u64,
    pub delivered: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub requeued: u64,
}

#[derive(Debug, Default)]
struct BrokerState {
    unreachable: bool,
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, QueueState>,
    next_channel: u64,
    peak_in_flight: usize,
}

impl BrokerState {
    fn ensure_reachable(&self) -> Result<()> {
        if self.unreachable {
            Err(Error::Connection("memory broker is unreachable".to_string()))
        } else {
            Ok(())
        }
    }

    fn declare_exchange(&mut self, name: &str, durable: bool) -> Result<()> {
        match self.exchanges.get(name) {
            Some(existing) if existing.durable != durable => Err(Error::Topology(format!(
                "exchange {name} already declared with durable={}",
                existing.durable
            ))),
            Some(_) => Ok(()),
            None => {
                self.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        durable,
                        bindings: HashMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    fn declare_queue(
        &mut self,
        name: &str,
        durable: bool,
        dead_letter: Option<DeadLetter>,
    ) -> Result<()> {
        match self.queues.get(name) {
            Some(existing) if existing.durable != durable || existing.dead_letter != dead_letter => {
                Err(Error::Topology(format!(
                    "queue {name} already declared with different arguments"
                )))
            }
            Some(_) => Ok(()),
            None => {
                self.queues.insert(
                    name.to_string(),
                    QueueState {
                        durable,
                        dead_letter,
                        ready: VecDeque::new(),
                        unacked: 0,
                        stats: QueueStats::default(),
                    },
                );
                Ok(())
            }
        }
    }

    fn bind(&mut self, exchange: &str, routing_key: &Address, queue: &str) -> Result<()> {
        if !self.queues.contains_key(queue) {
            return Err(Error::Topology(format!("queue {queue} is not declared")));
        }
        let exchange = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| Error::Topology(format!("exchange {exchange} is not declared")))?;
        exchange
            .bindings
            .entry(routing_key.clone())
            .or_default()
            .insert(queue.to_string());
        Ok(())
    }

    /// Deliver a copy to every queue bound under `routing_key`. Returns the
    /// number of queues reached.
    fn route(&mut self, exchange: &str, routing_key: &Address, message: Message) -> Result<usize> {
        let targets: Vec<String> = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| Error::Topology(format!("exchange {exchange} is not declared")))?
            .bindings
            .get(routing_key)
            .map(|queues| queues.iter().cloned().collect())
            .unwrap_or_default();

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
                queue.stats.published += 1;
            }
        }
        Ok(targets.len())
    }

    fn queue_mut(&mut self, name: &str) -> Result<&mut QueueState> {
        self.queues
            .get_mut(name)
            .ok_or_else(|| Error::Topology(format!("queue {name} is not declared")))
    }

    /// Put an unacknowledged message back at the head of its queue.
    fn release(&mut self, pending: Pending) {
        if let Some(queue) = self.queues.get_mut(pending.queue.as_str()) {
            queue.unacked = queue.unacked.saturating_sub(1);
            let mut message = pending.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }
    }
}

/// Handle to a shared in-memory broker. Cheap to clone.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    topology: Topology,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_topology(Topology::default())
    }

    pub fn with_topology(topology: Topology) -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            topology,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Open a session without declaring anything.
    pub fn connect(&self) -> Result<MemoryChannel> {
        let mut state = self.state.lock();
        state.ensure_reachable()?;
        state.next_channel += 1;
        Ok(MemoryChannel {
            id: state.next_channel,
            broker: self.clone(),
            in_flight: InFlight::new(),
            declared: HashSet::new(),
            closed: false,
        })
    }

    /// Open a session and declare the topology for `address`.
    pub async fn open(&self, address: &Address) -> Result<MemoryChannel> {
        let mut channel = self.connect()?;
        channel.declare(address).await?;
        Ok(channel)
    }

    /// Simulate the broker going away (or coming back).
    pub fn set_reachable(&self, reachable: bool) {
        self.state.lock().unreachable = !reachable;
    }

    /// Declare a queue directly, bypassing the channel contract.
    pub fn declare_queue(
        &self,
        name: &str,
        durable: bool,
        dead_letter: Option<DeadLetter>,
    ) -> Result<()> {
        self.state.lock().declare_queue(name, durable, dead_letter)
    }

    /// Declare an exchange directly, bypassing the channel contract.
    pub fn declare_exchange(&self, name: &str, durable: bool) -> Result<()> {
        self.state.lock().declare_exchange(name, durable)
    }

    /// Messages ready for delivery on `address`.
    pub fn depth(&self, address: &Address) -> usize {
        self.state
            .lock()
            .queues
            .get(address.as_str())
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered on `address` and not yet settled.
    pub fn unacked(&self, address: &Address) -> usize {
        self.state
            .lock()
            .queues
            .get(address.as_str())
            .map_or(0, |q| q.unacked)
    }

    /// Bodies currently queued on `address`, oldest first.
    pub fn peek(&self, address: &Address) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .queues
            .get(address.as_str())
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self, address: &Address) -> QueueStats {
        self.state
            .lock()
            .queues
            .get(address.as_str())
            .map(|q| q.stats.clone())
            .unwrap_or_default()
    }

    /// Highest number of unacknowledged deliveries any single channel held.
    pub fn peak_in_flight(&self) -> usize {
        self.state.lock().peak_in_flight
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct Pending {
    queue: Address,
    message: Message,
}

/// A session on a [`MemoryBroker`].
#[derive(Debug)]
pub struct MemoryChannel {
    id: u64,
    broker: MemoryBroker,
    in_flight: InFlight<Pending>,
    declared: HashSet<Address>,
    closed: bool,
}

impl MemoryChannel {
    pub fn id(&self) -> u64 {
        self.id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::Connection(format!("channel {} is closed", self.id)))
        } else {
            Ok(())
        }
    }

    fn release_all(&mut self) {
        let pending = self.in_flight.drain();
        if pending.is_empty() {
            return;
        }
        let mut state = self.broker.state.lock();
        for p in pending {
            state.release(p);
        }
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare(&mut self, address: &Address) -> Result<()> {
        self.ensure_open()?;
        if self.declared.contains(address) {
            return Ok(());
        }
        let topology = self.broker.topology.clone();
        let dead_letter = DeadLetter::for_address(&topology, address);
        let dl_queue = dead_letter.routing_key.clone();
        {
            let mut state = self.broker.state.lock();
            state.ensure_reachable()?;
            state.declare_exchange(&topology.exchange, true)?;
            state.declare_queue(address.as_str(), true, Some(dead_letter))?;
            state.bind(&topology.exchange, address, address.as_str())?;
            state.declare_exchange(&topology.dead_letter_exchange, true)?;
            state.declare_queue(dl_queue.as_str(), true, None)?;
            state.bind(&topology.dead_letter_exchange, &dl_queue, dl_queue.as_str())?;
        }
        debug!(channel = self.id, %address, "declared topology");
        self.declared.insert(address.clone());
        Ok(())
    }

    async fn set_fair_dispatch(&mut self, prefetch: u16) -> Result<()> {
        self.ensure_open()?;
        self.in_flight.set_prefetch(prefetch)
    }

    async fn publish(&mut self, address: &Address, body: &[u8], persistent: bool) -> Result<()> {
        self.ensure_open()?;
        let message = Message {
            body: body.to_vec(),
            persistent,
            redelivered: false,
        };
        let routed = {
            let mut state = self.broker.state.lock();
            state.ensure_reachable()?;
            state.route(&self.broker.topology.exchange, address, message)?
        };
        if routed == 0 {
            warn!(%address, "message unroutable, dropped");
            metrics::unroutable().add(1, &[KeyValue::new("address", address.to_string())]);
        }
        record_operation(address, "publish");
        Ok(())
    }

    async fn receive(&mut self, address: &Address) -> Result<Option<Delivery>> {
        self.ensure_open()?;
        self.in_flight.check_capacity()?;
        let message = {
            let mut state = self.broker.state.lock();
            state.ensure_reachable()?;
            let queue = state.queue_mut(address.as_str())?;
            queue.stats.receive_calls += 1;
            let message = queue.ready.pop_front();
            if message.is_some() {
                queue.unacked += 1;
                queue.stats.delivered += 1;
            }
            message
        };

        let Some(message) = message else {
            record_operation(address, "receive_empty");
            return Ok(None);
        };

        let delivery_body = message.body.clone();
        let redelivered = message.redelivered;
        let tag = self.in_flight.track(Pending {
            queue: address.clone(),
            message,
        });
        {
            let mut state = self.broker.state.lock();
            state.peak_in_flight = state.peak_in_flight.max(self.in_flight.len());
        }
        record_operation(address, "receive");
        Ok(Some(Delivery {
            tag,
            address: address.clone(),
            body: delivery_body,
            redelivered,
        }))
    }

    async fn accept(&mut self, delivery: &Delivery) -> Result<()> {
        self.ensure_open()?;
        self.broker.state.lock().ensure_reachable()?;
        let pending = self.in_flight.settle(delivery.tag)?;
        let mut state = self.broker.state.lock();
        if let Ok(queue) = state.queue_mut(pending.queue.as_str()) {
            queue.unacked = queue.unacked.saturating_sub(1);
            queue.stats.accepted += 1;
        }
        drop(state);
        record_operation(&delivery.address, "accept");
        Ok(())
    }

    async fn reject(&mut self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.ensure_open()?;
        self.broker.state.lock().ensure_reachable()?;
        let pending = self.in_flight.settle(delivery.tag)?;
        let mut state = self.broker.state.lock();

        if requeue {
            if let Ok(queue) = state.queue_mut(pending.queue.as_str()) {
                queue.stats.requeued += 1;
            }
            state.release(pending);
            drop(state);
            record_operation(&delivery.address, "requeue");
            return Ok(());
        }

        let queue = state.queue_mut(pending.queue.as_str())?;
        queue.unacked = queue.unacked.saturating_sub(1);
        queue.stats.rejected += 1;
        let dead_letter = queue.dead_letter.clone();

        match dead_letter {
            Some(dl) => {
                let message = Message {
                    body: pending.message.body,
                    persistent: pending.message.persistent,
                    redelivered: false,
                };
                let routed = state.route(&dl.exchange, &dl.routing_key, message)?;
                if routed == 0 {
                    warn!(address = %delivery.address, "dead-letter route has no queue, message discarded");
                }
            }
            None => {
                debug!(address = %delivery.address, "queue has no dead-letter path, message discarded");
            }
        }
        drop(state);
        record_operation(&delivery.address, "reject");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.release_all();
        self.closed = true;
        debug!(channel = self.id, "channel closed");
        Ok(())
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if !self.closed {
            self.release_all();
        }
    }
}
