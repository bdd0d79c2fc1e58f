// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Exchange, queue and binding declarations.
//!
//! Every declaration is idempotent, so publishers and collectors can both declare the
//! topology they rely on without coordinating. Declaring an existing name with
//! different parameters is a [`BrokerError::TopologyConflict`] and is fatal.

use crate::broker::Broker;
use crate::constants::EXCHANGE_NAME;
use crate::errors::BrokerError;
use crate::routing::{RoutingKey, RoutingKeyResolver};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

impl ExchangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Direct => "direct",
            Self::Fanout => "fanout",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// A durable topic exchange, the only kind this crate publishes to.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durable: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueueName {
    Named(String),
    /// The broker picks the name; the queue is exclusive to its declaring connection.
    Anonymous,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: QueueName,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A shared queue that survives consumers coming and going.
    pub fn named(name: impl Into<String>, durable: bool) -> Self {
        Self {
            name: QueueName::Named(name.into()),
            durable,
            exclusive: false,
            auto_delete: false,
        }
    }

    /// A server-named queue private to one consumer and deleted with it.
    #[must_use]
    pub fn anonymous() -> Self {
        Self {
            name: QueueName::Anonymous,
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// The name to send to the broker: empty for anonymous queues.
    #[must_use]
    pub fn wire_name(&self) -> &str {
        match &self.name {
            QueueName::Named(name) => name,
            QueueName::Anonymous => "",
        }
    }
}

/// A declared exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exchange {
    pub name: String,
}

/// A declared queue, with the name the broker confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    pub name: String,
    pub durable: bool,
}

/// How a collector lays out its queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionPlan {
    /// One queue bound to every pattern.
    SharedQueue {
        queue: QueueSpec,
        patterns: Vec<RoutingKey>,
    },
    /// One durable queue per level, named after the level and bound to its resolved key.
    PerLevel { levels: Vec<String> },
}

pub struct TopologyManager {
    broker: Arc<dyn Broker>,
    resolver: RoutingKeyResolver,
    bound: Mutex<HashSet<(String, String, String)>>,
}

impl TopologyManager {
    pub fn new(broker: Arc<dyn Broker>, resolver: RoutingKeyResolver) -> Self {
        Self {
            broker,
            resolver,
            bound: Mutex::new(HashSet::new()),
        }
    }

    /// Declares the durable topic exchange `name`.
    pub async fn declare_exchange(&self, name: &str) -> Result<Exchange, BrokerError> {
        let spec = ExchangeSpec::topic(name);
        self.broker.declare_exchange(&spec).await?;
        debug!("Declared {} exchange {}", spec.kind.as_str(), name);
        Ok(Exchange {
            name: name.to_string(),
        })
    }

    /// Declares the exchange every producer publishes to.
    pub async fn declare_logs_exchange(&self) -> Result<Exchange, BrokerError> {
        self.declare_exchange(EXCHANGE_NAME).await
    }

    pub async fn declare_queue(&self, spec: &QueueSpec) -> Result<Queue, BrokerError> {
        let name = self.broker.declare_queue(spec).await?;
        debug!("Declared queue {} (durable: {})", name, spec.durable);
        Ok(Queue {
            name,
            durable: spec.durable,
        })
    }

    pub async fn bind(
        &self,
        queue: &Queue,
        exchange: &Exchange,
        pattern: &RoutingKey,
    ) -> Result<(), BrokerError> {
        let binding = (
            queue.name.clone(),
            exchange.name.clone(),
            pattern.as_str().to_string(),
        );
        if self.is_bound(&binding) {
            debug!(
                "Queue {} already bound to {} with {}",
                queue.name, exchange.name, pattern
            );
            return Ok(());
        }

        self.broker
            .bind_queue(&queue.name, &exchange.name, pattern.as_str())
            .await?;
        self.remember(binding);
        debug!(
            "Bound queue {} to {} with {}",
            queue.name, exchange.name, pattern
        );
        Ok(())
    }

    /// Declares the queues and bindings described by `plan` on `exchange`.
    pub async fn declare_subscriptions(
        &self,
        exchange: &Exchange,
        plan: &SubscriptionPlan,
    ) -> Result<Vec<Queue>, BrokerError> {
        let queues = match plan {
            SubscriptionPlan::SharedQueue { queue, patterns } => {
                let queue = self.declare_queue(queue).await?;
                for pattern in patterns {
                    self.bind(&queue, exchange, pattern).await?;
                }
                vec![queue]
            }
            SubscriptionPlan::PerLevel { levels } => {
                let mut queues = Vec::with_capacity(levels.len());
                for level in levels {
                    let queue = self.declare_queue(&QueueSpec::named(level, true)).await?;
                    self.bind(&queue, exchange, &self.resolver.resolve(level))
                        .await?;
                    queues.push(queue);
                }
                queues
            }
        };
        info!(
            "Subscribed {} queue(s) to exchange {}",
            queues.len(),
            exchange.name
        );
        Ok(queues)
    }

    // A poisoned set only loses the memo; the broker-side bind is idempotent anyway.
    fn is_bound(&self, binding: &(String, String, String)) -> bool {
        self.bound
            .lock()
            .map(|bound| bound.contains(binding))
            .unwrap_or(false)
    }

    fn remember(&self, binding: (String, String, String)) {
        if let Ok(mut bound) = self.bound.lock() {
            bound.insert(binding);
        }
    }
}
