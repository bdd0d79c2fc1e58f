// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Producer side: builds events, tags them with a routing key and publishes them.

use crate::broker::{Broker, PublishProperties};
use crate::constants::EXCHANGE_NAME;
use crate::errors::{BrokerError, PublishError};
use crate::event::{LogEvent, MessagePayload};
use crate::hostname::get_hostname;
use crate::routing::{level, RoutingKeyResolver};
use std::error::Error as StdError;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Who produced an event. Rendered into the `Host` field as `{server}-{hostname}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerIdentity {
    pub server: String,
    pub hostname: String,
}

impl ProducerIdentity {
    pub fn new(server: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            hostname: hostname.into(),
        }
    }

    /// Identity for `server` on this machine.
    pub fn detect(server: impl Into<String>) -> Self {
        Self::new(server, get_hostname())
    }
}

impl fmt::Display for ProducerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.server, self.hostname)
    }
}

/// Publishes log events to the topic exchange.
///
/// Cheap to share behind an `Arc`; concurrent publishes are serialized by the broker
/// transport.
pub struct Publisher {
    broker: Arc<dyn Broker>,
    resolver: RoutingKeyResolver,
    host: String,
    exchange: String,
    properties: PublishProperties,
    last_timestamp: AtomicI64,
    echo_locally: AtomicBool,
}

impl Publisher {
    pub fn new(
        broker: Arc<dyn Broker>,
        identity: &ProducerIdentity,
        resolver: RoutingKeyResolver,
    ) -> Self {
        Self {
            broker,
            resolver,
            host: identity.to_string(),
            exchange: EXCHANGE_NAME.to_string(),
            properties: PublishProperties::default(),
            last_timestamp: AtomicI64::new(i64::MIN),
            echo_locally: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    /// Mirrors every published event to the local tracing output.
    pub fn echo_locally(&self, enabled: bool) {
        self.echo_locally.store(enabled, Ordering::Relaxed);
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    pub async fn publish(
        &self,
        level: &str,
        message: impl Into<MessagePayload>,
        id: Option<&str>,
    ) -> Result<(), PublishError> {
        let event = LogEvent::new(
            level,
            self.host.as_str(),
            message,
            self.next_timestamp(),
            id.map(str::to_string),
        );
        let routing_key = self.resolver.resolve(level);

        let payload = match event.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Dropping {level} event that could not be encoded: {e}");
                return Err(e.into());
            }
        };

        if let Err(e) = self
            .broker
            .publish(&self.exchange, routing_key.as_str(), payload, &self.properties)
            .await
        {
            error!(
                "Failed to publish {level} event to {} with key {routing_key}: {e}",
                self.exchange
            );
            return Err(e.into());
        }

        if self.echo_locally.load(Ordering::Relaxed) {
            echo(&event);
        }
        Ok(())
    }

    pub async fn warn(&self, message: impl Into<MessagePayload>) -> Result<(), PublishError> {
        self.publish(level::WARNING, message, None).await
    }

    pub async fn print(&self, message: impl Into<MessagePayload>) -> Result<(), PublishError> {
        self.publish(level::FYI, message, None).await
    }

    pub async fn debug(&self, message: impl Into<MessagePayload>) -> Result<(), PublishError> {
        self.publish(level::DEBUG, message, None).await
    }

    pub async fn print_with_id(
        &self,
        id: &str,
        message: impl Into<MessagePayload>,
    ) -> Result<(), PublishError> {
        self.publish(level::FYI, message, Some(id)).await
    }

    pub async fn print_level(
        &self,
        level: &str,
        message: impl Into<MessagePayload>,
    ) -> Result<(), PublishError> {
        self.publish(level, message, None).await
    }

    /// Publishes an `err` event carrying `message` followed by `err` and its source
    /// chain, one cause per line. An empty `message` is replaced by the error itself.
    pub async fn error(
        &self,
        err: &(dyn StdError + 'static),
        message: &str,
    ) -> Result<(), PublishError> {
        self.publish(level::ERROR, describe_error(err, message), None)
            .await
    }

    /// Marks a unit of work as finished.
    pub async fn success(&self, message: impl Into<MessagePayload>) -> Result<(), PublishError> {
        self.publish(level::SUCCESS, message, None).await
    }

    /// Marks a unit of work as failed.
    pub async fn failure(&self, message: impl Into<MessagePayload>) -> Result<(), PublishError> {
        self.publish(level::FAILURE, message, None).await
    }

    pub async fn close(&self) -> Result<(), BrokerError> {
        debug!("Closing publisher for {}", self.host);
        self.broker.close().await
    }

    fn next_timestamp(&self) -> i64 {
        self.stamp(chrono::Utc::now().timestamp_millis())
    }

    // Never hands out a timestamp older than the last one, even if the wall clock
    // steps back.
    fn stamp(&self, now: i64) -> i64 {
        let previous = self.last_timestamp.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }
}

fn describe_error(err: &(dyn StdError + 'static), message: &str) -> String {
    let mut text = if message.is_empty() {
        err.to_string()
    } else {
        format!("{message}\n{err}")
    };
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str("\ncaused by: ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}

fn echo(event: &LogEvent) {
    let message = event.message.joined();
    match event.level.as_str() {
        level::ERROR | level::PANIC | level::FAILURE => {
            error!("[{}] {} - {}", event.host, event.timestamp, message);
        }
        level::WARNING => warn!("[{}] {} - {}", event.host, event.timestamp, message),
        level::DEBUG | level::DUMP => debug!("[{}] {} - {}", event.host, event.timestamp, message),
        _ => info!("[{}] {} - {}", event.host, event.timestamp, message),
    }
}
