// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! AMQP 0-9-1 transport backed by `lapin`.

use super::{Acker, Broker, Delivery, DeliveryStream, PublishProperties, RetryPolicy};
use crate::errors::BrokerError;
use crate::topology::{ExchangeKind, ExchangeSpec, QueueSpec};
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::protocol::{AMQPErrorKind, AMQPSoftError};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REPLY_SUCCESS: u16 = 200;

pub struct AmqpBroker {
    connection: Connection,
    // Declarations and publishes share one channel; callers take turns.
    control: Mutex<Channel>,
    consumers: Mutex<HashMap<String, Channel>>,
}

impl AmqpBroker {
    /// Opens one connection and its control channel.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let connection = Connection::connect(url, ConnectionProperties::default())
            .await
            .map_err(|e| map_error("connect", e))?;
        let control = connection
            .create_channel()
            .await
            .map_err(|e| map_error("open control channel", e))?;
        info!("Connected to AMQP broker");
        Ok(Self {
            connection,
            control: Mutex::new(control),
            consumers: Mutex::new(HashMap::new()),
        })
    }

    /// Connects, retrying with backoff while `policy` allows and `cancel` is not
    /// triggered. Every failed attempt is logged.
    pub async fn connect_with_retry(
        url: &str,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<Self, BrokerError> {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let error = match Self::connect(url).await {
                Ok(broker) => return Ok(broker),
                Err(e) => e,
            };

            if policy.exhausted(attempt) {
                error!("Giving up connecting to the broker after {attempt} attempt(s): {error}");
                return Err(error);
            }
            let delay = policy.delay(attempt);
            error!(
                "Connection attempt {attempt} failed: {error}. Retrying in {}ms",
                delay.as_millis()
            );

            tokio::select! {
                () = cancel.cancelled() => {
                    return Err(BrokerError::Connection("connect cancelled".to_string()));
                }
                () = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Whether the underlying connection is still usable.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    // The server closes a channel on any channel-level error, so a failed declaration or
    // publish would otherwise poison every later call.
    async fn control_channel(&self) -> Result<tokio::sync::MutexGuard<'_, Channel>, BrokerError> {
        let mut channel = self.control.lock().await;
        if !channel.status().connected() {
            debug!("Control channel closed, reopening");
            *channel = self
                .connection
                .create_channel()
                .await
                .map_err(|e| map_error("reopen control channel", e))?;
        }
        Ok(channel)
    }
}

fn map_error(context: &str, error: lapin::Error) -> BrokerError {
    if let lapin::Error::ProtocolError(amqp) = &error {
        match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED) => {
                return BrokerError::TopologyConflict(format!("{context}: {amqp}"));
            }
            AMQPErrorKind::Soft(AMQPSoftError::NOTFOUND) => {
                return BrokerError::NotFound(format!("{context}: {amqp}"));
            }
            _ => {}
        }
    }
    BrokerError::Connection(format!("{context}: {error}"))
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        let channel = self.control_channel().await?;
        channel
            .exchange_declare(
                &spec.name,
                lapin_kind(spec.kind),
                ExchangeDeclareOptions {
                    durable: spec.durable,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(&format!("declare exchange {}", spec.name), e))
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError> {
        let channel = self.control_channel().await?;
        let queue = channel
            .queue_declare(
                spec.wire_name(),
                QueueDeclareOptions {
                    durable: spec.durable,
                    exclusive: spec.exclusive,
                    auto_delete: spec.auto_delete,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(&format!("declare queue {:?}", spec.name), e))?;
        Ok(queue.name().as_str().to_string())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        pattern: &str,
    ) -> Result<(), BrokerError> {
        let channel = self.control_channel().await?;
        channel
            .queue_bind(
                queue,
                exchange,
                pattern,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(&format!("bind {queue} to {exchange} with {pattern}"), e))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: Vec<u8>,
        properties: &PublishProperties,
    ) -> Result<(), BrokerError> {
        let amqp_properties = BasicProperties::default()
            .with_delivery_mode(properties.delivery_mode)
            .with_content_type(properties.content_type.as_str().into());

        let channel = self.control_channel().await?;
        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &payload,
                amqp_properties,
            )
            .await
            .map_err(|e| map_error(&format!("publish to {exchange}"), e))?;
        drop(channel);

        confirm
            .await
            .map(|_| ())
            .map_err(|e| map_error(&format!("confirm publish to {exchange}"), e))
    }

    async fn consume(
        &self,
        queue: &str,
        consumer_tag: &str,
        prefetch: u16,
    ) -> Result<DeliveryStream, BrokerError> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| map_error("open consumer channel", e))?;
        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| map_error("set prefetch", e))?;
        let consumer = channel
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| map_error(&format!("consume {queue}"), e))?;

        self.consumers
            .lock()
            .await
            .insert(consumer_tag.to_string(), channel);
        debug!("Consumer {consumer_tag} attached to {queue} with prefetch {prefetch}");

        let stream = consumer.map(|item| match item {
            Ok(delivery) => {
                let lapin::message::Delivery {
                    delivery_tag,
                    routing_key,
                    redelivered,
                    data,
                    acker,
                    ..
                } = delivery;
                Ok(Delivery::new(
                    data,
                    routing_key.as_str(),
                    delivery_tag,
                    redelivered,
                    Box::new(AmqpAcker { acker, delivery_tag }),
                ))
            }
            Err(e) => Err(map_error("receive delivery", e)),
        });
        Ok(stream.boxed())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError> {
        let Some(channel) = self.consumers.lock().await.remove(consumer_tag) else {
            return Err(BrokerError::NotFound(format!("consumer {consumer_tag}")));
        };
        channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await
            .map_err(|e| map_error(&format!("cancel consumer {consumer_tag}"), e))?;
        if let Err(e) = channel.close(REPLY_SUCCESS, "consumer cancelled").await {
            warn!("Failed to close channel of consumer {consumer_tag}: {e}");
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.connection.status().connected() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "shutting down")
            .await
            .map_err(|e| map_error("close connection", e))
    }
}

struct AmqpAcker {
    acker: lapin::acker::Acker,
    delivery_tag: u64,
}

#[async_trait]
impl Acker for AmqpAcker {
    async fn ack(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| BrokerError::Settle {
                tag: self.delivery_tag,
                reason: e.to_string(),
            })
    }

    async fn reject(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map_err(|e| BrokerError::Settle {
                tag: self.delivery_tag,
                reason: e.to_string(),
            })
    }
}
