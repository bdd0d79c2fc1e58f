// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transport seam between the routing engine and a message broker.
//!
//! [`amqp::AmqpBroker`] talks to a real broker over the network;
//! [`memory::MemoryBroker`] implements the same topic semantics in process.

use crate::constants::{CONTENT_TYPE, PERSISTENT_DELIVERY_MODE};
use crate::errors::BrokerError;
use crate::topology::{ExchangeSpec, QueueSpec};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use std::time::Duration;
use tracing::debug;

pub mod amqp;
pub mod memory;

/// Stream of deliveries for one consumer. Ends when the consumer is cancelled or the
/// connection is lost; a lost connection yields one `Err` before the end.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Message properties attached to a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishProperties {
    pub delivery_mode: u8,
    pub content_type: String,
}

impl Default for PublishProperties {
    fn default() -> Self {
        Self {
            delivery_mode: PERSISTENT_DELIVERY_MODE,
            content_type: CONTENT_TYPE.to_string(),
        }
    }
}

impl PublishProperties {
    #[must_use]
    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == PERSISTENT_DELIVERY_MODE
    }
}

#[async_trait]
pub trait Broker: Send + Sync + 'static {
    /// Declares an exchange. Redeclaring with identical parameters is a no-op.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError>;

    /// Declares a queue and returns its name, which the broker generates for anonymous
    /// queues.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError>;

    /// Binds a queue to an exchange with a topic pattern. Binding twice is a no-op.
    async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str)
        -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: &PublishProperties,
    ) -> Result<(), BrokerError>;

    /// Starts consuming `queue` with manual acknowledgment. `prefetch` caps the number
    /// of unacknowledged deliveries the broker pushes to this consumer.
    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError>;

    /// Stops a consumer. Deliveries it has not settled become eligible for redelivery.
    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

/// Exponential backoff between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts before giving up. `0` retries until cancelled.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Growth factor applied per failed attempt.
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 0,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the `attempt`-th failure, counting from 1.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let delay = self.base_delay.as_secs_f64() * self.factor.powi(exponent);
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }

    #[must_use]
    pub fn exhausted(&self, attempt: u32) -> bool {
        self.max_attempts != 0 && attempt >= self.max_attempts
    }
}

/// Broker-specific acknowledgment of a single delivery.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<(), BrokerError>;

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError>;
}

/// A message handed to a consumer together with its acknowledgment obligation.
///
/// [`Delivery::ack`] and [`Delivery::reject`] take the delivery by value, so a delivery
/// is settled at most once. Dropping it unsettled leaves it with the broker, which
/// redelivers it once the consumer goes away.
pub struct Delivery {
    body: Vec<u8>,
    routing_key: String,
    delivery_tag: u64,
    redelivered: bool,
    acker: Option<Box<dyn Acker>>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        routing_key: impl Into<String>,
        delivery_tag: u64,
        redelivered: bool,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            body,
            routing_key: routing_key.into(),
            delivery_tag,
            redelivered,
            acker: Some(acker),
        }
    }

    #[must_use]
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    #[must_use]
    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    #[must_use]
    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    #[must_use]
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub async fn ack(mut self) -> Result<(), BrokerError> {
        match self.acker.take() {
            Some(acker) => acker.ack().await,
            None => Err(self.already_settled()),
        }
    }

    pub async fn reject(mut self, requeue: bool) -> Result<(), BrokerError> {
        match self.acker.take() {
            Some(acker) => acker.reject(requeue).await,
            None => Err(self.already_settled()),
        }
    }

    fn already_settled(&self) -> BrokerError {
        BrokerError::Settle {
            tag: self.delivery_tag,
            reason: "already settled".to_string(),
        }
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if self.acker.is_some() {
            debug!(
                "Delivery {} on {} dropped unsettled, left to the broker for redelivery",
                self.delivery_tag, self.routing_key
            );
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("routing_key", &self.routing_key)
            .field("delivery_tag", &self.delivery_tag)
            .field("redelivered", &self.redelivered)
            .field("len", &self.body.len())
            .field("settled", &self.acker.is_none())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct CountingAcker {
        acks: Arc<AtomicUsize>,
        rejects: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Acker for CountingAcker {
        async fn ack(&self) -> Result<(), BrokerError> {
            self.acks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reject(&self, _requeue: bool) -> Result<(), BrokerError> {
            self.rejects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_ack_settles_once() {
        let acker = CountingAcker::default();
        let acks = Arc::clone(&acker.acks);
        let rejects = Arc::clone(&acker.rejects);

        let delivery = Delivery::new(b"{}".to_vec(), "err", 7, false, Box::new(acker));
        assert_eq!(delivery.delivery_tag(), 7);
        assert_eq!(delivery.routing_key(), "err");
        delivery.ack().await.unwrap();

        assert_eq!(acks.load(Ordering::SeqCst), 1);
        assert_eq!(rejects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reject_settles_once() {
        let acker = CountingAcker::default();
        let acks = Arc::clone(&acker.acks);
        let rejects = Arc::clone(&acker.rejects);

        let delivery = Delivery::new(b"garbage".to_vec(), "wrn", 1, true, Box::new(acker));
        assert!(delivery.redelivered());
        delivery.reject(false).await.unwrap();

        assert_eq!(acks.load(Ordering::SeqCst), 0);
        assert_eq!(rejects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retry_delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_millis(125),
            max_delay: Duration::from_millis(375),
            factor: 2.0,
        };

        assert_eq!(policy.delay(1), Duration::from_millis(125));
        assert_eq!(policy.delay(2), Duration::from_millis(250));
        assert_eq!(policy.delay(3), Duration::from_millis(375));
        assert_eq!(policy.delay(60), Duration::from_millis(375));
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
        assert!(!RetryPolicy::default().exhausted(u32::MAX));
    }

    #[test]
    fn test_default_properties_are_persistent_plain_text() {
        let properties = PublishProperties::default();
        assert!(properties.is_persistent());
        assert_eq!(properties.content_type, "text/plain");
    }
}
