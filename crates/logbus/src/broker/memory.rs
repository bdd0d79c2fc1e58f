// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process broker with AMQP topic-exchange semantics.
//!
//! Queues are unbounded channels shared by every consumer of the queue, so consumers
//! compete for messages the way they do on a real broker. A delivery that is rejected
//! with `requeue` or dropped unsettled goes back on its queue marked as redelivered.

use super::{Acker, Broker, Delivery, DeliveryStream, PublishProperties};
use crate::errors::BrokerError;
use crate::routing::topic_matches;
use crate::topology::{ExchangeKind, ExchangeSpec, QueueName, QueueSpec};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
struct Message {
    body: Vec<u8>,
    routing_key: String,
    redelivered: bool,
}

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    requeued: AtomicU64,
}

/// Point-in-time counters of one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    /// Messages routed to the queue by publishes.
    pub enqueued: u64,
    /// Deliveries handed to consumers, redeliveries included.
    pub delivered: u64,
    pub acked: u64,
    /// Rejected without requeue.
    pub rejected: u64,
    /// Returned to the queue by a requeueing reject or an unsettled drop.
    pub requeued: u64,
}

impl QueueStats {
    /// Messages waiting in the queue.
    #[must_use]
    pub fn ready(&self) -> u64 {
        (self.enqueued + self.requeued).saturating_sub(self.delivered)
    }

    /// Deliveries handed out and not yet settled.
    #[must_use]
    pub fn unacked(&self) -> u64 {
        self.delivered
            .saturating_sub(self.acked + self.rejected + self.requeued)
    }
}

struct MemoryQueue {
    spec: QueueSpec,
    tx: mpsc::UnboundedSender<Message>,
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
    counters: Arc<QueueCounters>,
}

/// A publish as the broker saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub properties: PublishProperties,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, MemoryQueue>,
    // (exchange, queue, pattern) in declaration order
    bindings: Vec<(String, String, String)>,
    consumers: HashMap<String, CancellationToken>,
    published: Vec<PublishedMessage>,
    next_queue_id: u64,
}

#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
    next_delivery_tag: Arc<AtomicU64>,
    connection: CancellationToken,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            next_delivery_tag: Arc::new(AtomicU64::new(0)),
            connection: CancellationToken::new(),
        }
    }

    /// Patterns bound to `queue`, in binding order.
    #[must_use]
    pub fn bindings(&self, queue: &str) -> Vec<String> {
        self.lock()
            .map(|state| {
                state
                    .bindings
                    .iter()
                    .filter(|(_, bound_queue, _)| bound_queue == queue)
                    .map(|(_, _, pattern)| pattern.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn queue_stats(&self, queue: &str) -> Option<QueueStats> {
        let state = self.lock().ok()?;
        let counters = &state.queues.get(queue)?.counters;
        Some(QueueStats {
            enqueued: counters.enqueued.load(Ordering::SeqCst),
            delivered: counters.delivered.load(Ordering::SeqCst),
            acked: counters.acked.load(Ordering::SeqCst),
            rejected: counters.rejected.load(Ordering::SeqCst),
            requeued: counters.requeued.load(Ordering::SeqCst),
        })
    }

    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.lock()
            .map(|state| state.published.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.connection.is_cancelled()
    }

    /// Places raw bytes on a queue, bypassing exchanges. Lets tests inject payloads no
    /// publisher would produce.
    pub fn inject(&self, queue: &str, routing_key: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let state = self.lock()?;
        let target = state
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue {queue}")))?;
        enqueue(target, routing_key, body);
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        if self.connection.is_cancelled() {
            return Err(BrokerError::Connection("connection closed".to_string()));
        }
        self.state
            .lock()
            .map_err(|_| BrokerError::Connection("broker state poisoned".to_string()))
    }
}

fn enqueue(queue: &MemoryQueue, routing_key: &str, body: Vec<u8>) {
    let message = Message {
        body,
        routing_key: routing_key.to_string(),
        redelivered: false,
    };
    // The receiver lives as long as the queue entry that owns `tx`.
    if queue.tx.send(message).is_ok() {
        queue.counters.enqueued.fetch_add(1, Ordering::SeqCst);
    }
}

fn routes(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Fanout => true,
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        match state.exchanges.get(&spec.name) {
            Some(existing) if existing != spec => Err(BrokerError::TopologyConflict(format!(
                "exchange {} exists as {} (durable: {}), requested {} (durable: {})",
                spec.name,
                existing.kind.as_str(),
                existing.durable,
                spec.kind.as_str(),
                spec.durable
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError> {
        let mut state = self.lock()?;
        let name = match &spec.name {
            QueueName::Named(name) => name.clone(),
            QueueName::Anonymous => {
                state.next_queue_id += 1;
                format!("amq.gen-{}", state.next_queue_id)
            }
        };

        if let Some(existing) = state.queues.get(&name) {
            let compatible = existing.spec.durable == spec.durable
                && existing.spec.exclusive == spec.exclusive
                && existing.spec.auto_delete == spec.auto_delete;
            if !compatible {
                return Err(BrokerError::TopologyConflict(format!(
                    "queue {name} exists with durable: {}, requested durable: {}",
                    existing.spec.durable, spec.durable
                )));
            }
            return Ok(name);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        state.queues.insert(
            name.clone(),
            MemoryQueue {
                spec: spec.clone(),
                tx,
                rx: Arc::new(tokio::sync::Mutex::new(rx)),
                counters: Arc::new(QueueCounters::default()),
            },
        );
        Ok(name)
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::NotFound(format!("exchange {exchange}")));
        }
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::NotFound(format!("queue {queue}")));
        }

        let binding = (exchange.to_string(), queue.to_string(), pattern.to_string());
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: &PublishProperties,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        let kind = state
            .exchanges
            .get(exchange)
            .map(|spec| spec.kind)
            .ok_or_else(|| BrokerError::NotFound(format!("exchange {exchange}")))?;

        let mut targets: Vec<&str> = state
            .bindings
            .iter()
            .filter(|(bound_exchange, _, pattern)| {
                bound_exchange == exchange && routes(kind, pattern, routing_key)
            })
            .map(|(_, queue, _)| queue.as_str())
            .collect();
        targets.sort_unstable();
        targets.dedup();

        if targets.is_empty() {
            debug!("No queue bound to {exchange} matches {routing_key}, message dropped");
        }
        for name in &targets {
            if let Some(queue) = state.queues.get(*name) {
                enqueue(queue, routing_key, payload.clone());
            }
        }

        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            properties: properties.clone(),
            body: payload,
        });
        Ok(())
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        _prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError> {
        let mut state = self.lock()?;
        let target = state
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::NotFound(format!("queue {queue}")))?;

        let consumer = ConsumerState {
            rx: Arc::clone(&target.rx),
            requeue_tx: target.tx.clone(),
            counters: Arc::clone(&target.counters),
            next_delivery_tag: Arc::clone(&self.next_delivery_tag),
            cancelled: CancellationToken::new(),
            connection: self.connection.clone(),
            finished: false,
        };
        state
            .consumers
            .insert(consumer_tag.to_string(), consumer.cancelled.clone());

        Ok(Box::pin(futures::stream::unfold(consumer, next_delivery)))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let mut state = self.lock()?;
        match state.consumers.remove(consumer_tag) {
            Some(cancelled) => {
                cancelled.cancel();
                Ok(())
            }
            None => Err(BrokerError::NotFound(format!("consumer {consumer_tag}"))),
        }
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.connection.cancel();
        Ok(())
    }
}

struct ConsumerState {
    rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Message>>>,
    requeue_tx: mpsc::UnboundedSender<Message>,
    counters: Arc<QueueCounters>,
    next_delivery_tag: Arc<AtomicU64>,
    cancelled: CancellationToken,
    connection: CancellationToken,
    finished: bool,
}

async fn next_delivery(
    mut consumer: ConsumerState,
) -> Option<(Result<Delivery, BrokerError>, ConsumerState)> {
    if consumer.finished {
        return None;
    }

    let received = {
        let mut rx = consumer.rx.lock().await;
        tokio::select! {
            biased;
            _ = consumer.cancelled.cancelled() => return None,
            _ = consumer.connection.cancelled() => None,
            message = rx.recv() => message,
        }
    };

    let Some(message) = received else {
        consumer.finished = true;
        return Some((
            Err(BrokerError::Connection("connection closed".to_string())),
            consumer,
        ));
    };

    consumer.counters.delivered.fetch_add(1, Ordering::SeqCst);
    let tag = consumer.next_delivery_tag.fetch_add(1, Ordering::SeqCst) + 1;
    let acker = MemoryAcker {
        message: message.clone(),
        requeue_tx: consumer.requeue_tx.clone(),
        counters: Arc::clone(&consumer.counters),
        settled: AtomicBool::new(false),
    };
    let delivery = Delivery::new(
        message.body,
        message.routing_key,
        tag,
        message.redelivered,
        Box::new(acker),
    );
    Some((Ok(delivery), consumer))
}

struct MemoryAcker {
    message: Message,
    requeue_tx: mpsc::UnboundedSender<Message>,
    counters: Arc<QueueCounters>,
    settled: AtomicBool,
}

impl MemoryAcker {
    fn settle(&self) -> Result<(), BrokerError> {
        if self.settled.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Settle {
                tag: 0,
                reason: "delivery settled twice".to_string(),
            });
        }
        Ok(())
    }

    fn requeue(&self) {
        let mut message = self.message.clone();
        message.redelivered = true;
        if self.requeue_tx.send(message).is_ok() {
            self.counters.requeued.fetch_add(1, Ordering::SeqCst);
        } else {
            warn!("Queue for {} is gone, message lost", self.message.routing_key);
        }
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.settle()?;
        self.counters.acked.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.settle()?;
        if requeue {
            self.requeue();
        } else {
            self.counters.rejected.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        if !self.settled.load(Ordering::SeqCst) {
            self.requeue();
        }
    }
}
