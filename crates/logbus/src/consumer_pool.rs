// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded-concurrency consumption of log deliveries.
//!
//! A single dispatcher task acquires a semaphore permit, pulls the next delivery and
//! hands both to a handler task. The permit is released when the handler finishes, so
//! at most `max_concurrency` deliveries are ever being handled at once. Handlers run
//! concurrently, so events may be rendered in a different order than they arrived.
//!
//! Every delivery is settled exactly once: acknowledged after a successful decode, or
//! rejected without requeue when the payload is not a valid event.

use crate::broker::{Broker, Delivery, DeliveryStream};
use crate::constants::DEFAULT_MAX_CONCURRENCY;
use crate::errors::{BrokerError, PoolError};
use crate::event::LogEvent;
use crate::render::Renderer;
use crate::topology::Queue;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Deliveries handled at once. Also the broker prefetch per consumer.
    pub max_concurrency: usize,
    /// Prefix of the consumer tags registered with the broker.
    pub consumer_tag: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            consumer_tag: "logbus-collector".to_string(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    acked: AtomicU64,
    rejected: AtomicU64,
    rendered: AtomicU64,
    ack_failures: AtomicU64,
    in_flight: AtomicU64,
    peak_in_flight: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PoolStats {
        PoolStats {
            received: self.received.load(Ordering::SeqCst),
            acked: self.acked.load(Ordering::SeqCst),
            rejected: self.rejected.load(Ordering::SeqCst),
            rendered: self.rendered.load(Ordering::SeqCst),
            ack_failures: self.ack_failures.load(Ordering::SeqCst),
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub received: u64,
    pub acked: u64,
    /// Malformed deliveries rejected without requeue.
    pub rejected: u64,
    pub rendered: u64,
    /// Acks or rejects the broker refused.
    pub ack_failures: u64,
    pub in_flight: u64,
    pub peak_in_flight: u64,
}

impl PoolStats {
    /// Deliveries that were settled with the broker.
    #[must_use]
    pub fn settled(&self) -> u64 {
        self.acked + self.rejected
    }
}

pub struct ConsumerPool;

impl ConsumerPool {
    /// Starts draining `queue`.
    pub async fn start(
        broker: Arc<dyn Broker>,
        queue: &Queue,
        config: &PoolConfig,
        renderer: Arc<dyn Renderer>,
        cancel: &CancellationToken,
    ) -> Result<ConsumerPoolHandle, PoolError> {
        Self::start_many(broker, std::slice::from_ref(queue), config, renderer, cancel).await
    }

    /// Starts draining every queue in `queues` through one shared set of worker slots.
    pub async fn start_many(
        broker: Arc<dyn Broker>,
        queues: &[Queue],
        config: &PoolConfig,
        renderer: Arc<dyn Renderer>,
        cancel: &CancellationToken,
    ) -> Result<ConsumerPoolHandle, PoolError> {
        if config.max_concurrency == 0 {
            return Err(PoolError::ZeroConcurrency);
        }
        if queues.is_empty() {
            return Err(PoolError::NoQueues);
        }

        let prefetch = u16::try_from(config.max_concurrency).unwrap_or(u16::MAX);
        let mut consumer_tags = Vec::with_capacity(queues.len());
        let mut streams: Vec<DeliveryStream> = Vec::with_capacity(queues.len());
        for queue in queues {
            let tag = format!("{}-{}", config.consumer_tag, queue.name);
            match broker.consume(&queue.name, &tag, prefetch).await {
                Ok(stream) => {
                    streams.push(stream);
                    consumer_tags.push(tag);
                }
                Err(e) => {
                    error!("Failed to consume {}: {e}", queue.name);
                    cancel_consumers(broker.as_ref(), &consumer_tags).await;
                    return Err(e.into());
                }
            }
        }

        let semaphore = Arc::new(Semaphore::new(config.max_concurrency));
        let counters = Arc::new(Counters::default());
        let cancel = cancel.child_token();
        let finished = CancellationToken::new();
        let outcome = Arc::new(Mutex::new(Ok(())));

        let dispatcher = Dispatcher {
            deliveries: futures::stream::select_all(streams),
            semaphore: Arc::clone(&semaphore),
            renderer,
            counters: Arc::clone(&counters),
            cancel: cancel.clone(),
        };
        let task = {
            let finished = finished.clone();
            let outcome = Arc::clone(&outcome);
            tokio::spawn(async move {
                let result = dispatcher.run().await;
                if let Ok(mut slot) = outcome.lock() {
                    *slot = result;
                }
                finished.cancel();
            })
        };

        info!(
            "Consumer pool started on {} queue(s) with max_concurrency {}",
            queues.len(),
            config.max_concurrency
        );
        Ok(ConsumerPoolHandle {
            broker,
            consumer_tags,
            semaphore,
            cancel,
            finished,
            outcome,
            task,
            counters,
        })
    }
}

/// A running pool.
pub struct ConsumerPoolHandle {
    broker: Arc<dyn Broker>,
    consumer_tags: Vec<String>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    finished: CancellationToken,
    outcome: Arc<Mutex<Result<(), BrokerError>>>,
    task: JoinHandle<()>,
    counters: Arc<Counters>,
}

impl ConsumerPoolHandle {
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }

    /// Resolves once the pool stops pulling deliveries. Returns the connection error if
    /// the delivery stream failed, so the owner can reconnect.
    ///
    /// Cancel safe.
    pub async fn wait(&self) -> Result<(), BrokerError> {
        self.finished.cancelled().await;
        match self.outcome.lock() {
            Ok(outcome) => outcome.clone(),
            Err(_) => Ok(()),
        }
    }

    /// Stops pulling deliveries, lets every in-flight handler settle its delivery and
    /// returns the final counters. Consumers are cancelled only after the last handler
    /// finished, since some brokers refuse acknowledgments for a cancelled consumer.
    /// Deliveries the broker prefetched but the pool never pulled stay unacknowledged
    /// and are redelivered once the consumers are gone.
    pub async fn stop(self) -> PoolStats {
        self.cancel.cancel();
        self.semaphore.close();

        if let Err(e) = self.task.await {
            error!("Consumer pool dispatcher failed: {e}");
        }
        cancel_consumers(self.broker.as_ref(), &self.consumer_tags).await;

        let stats = self.counters.snapshot();
        info!(
            "Consumer pool stopped: received {}, acked {}, rejected {}, rendered {}",
            stats.received, stats.acked, stats.rejected, stats.rendered
        );
        stats
    }
}

async fn cancel_consumers(broker: &dyn Broker, consumer_tags: &[String]) {
    for tag in consumer_tags {
        if let Err(e) = broker.cancel(tag).await {
            debug!("Could not cancel consumer {tag}: {e}");
        }
    }
}

struct Dispatcher {
    deliveries: futures::stream::SelectAll<DeliveryStream>,
    semaphore: Arc<Semaphore>,
    renderer: Arc<dyn Renderer>,
    counters: Arc<Counters>,
    cancel: CancellationToken,
}

impl Dispatcher {
    async fn run(mut self) -> Result<(), BrokerError> {
        let mut handlers = JoinSet::new();

        let outcome = loop {
            let permit = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break Ok(()),
                Some(finished) = handlers.join_next() => {
                    report(finished);
                    continue;
                }
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => break Ok(()),
                next = self.deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.counters.received.fetch_add(1, Ordering::SeqCst);
                    handlers.spawn(handle(
                        delivery,
                        Arc::clone(&self.renderer),
                        Arc::clone(&self.counters),
                        permit,
                    ));
                }
                Some(Err(e)) => {
                    error!("Delivery stream failed: {e}");
                    break Err(e);
                }
                None => {
                    info!("Delivery stream ended");
                    break Ok(());
                }
            }
        };

        while let Some(finished) = handlers.join_next().await {
            report(finished);
        }
        outcome
    }
}

fn report(finished: Result<(), JoinError>) {
    if let Err(e) = finished {
        error!("Delivery handler failed: {e}");
    }
}

// Tracks one handler in the in-flight gauge, including handlers that panic.
struct InFlight(Arc<Counters>);

impl InFlight {
    fn enter(counters: &Arc<Counters>) -> Self {
        let now = counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        Self(Arc::clone(counters))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn handle(
    delivery: Delivery,
    renderer: Arc<dyn Renderer>,
    counters: Arc<Counters>,
    _permit: OwnedSemaphorePermit,
) {
    let _in_flight = InFlight::enter(&counters);
    let tag = delivery.delivery_tag();

    match LogEvent::decode(delivery.body()) {
        Ok(event) => match delivery.ack().await {
            Ok(()) => {
                counters.acked.fetch_add(1, Ordering::SeqCst);
                renderer.on_decoded(event);
                counters.rendered.fetch_add(1, Ordering::SeqCst);
            }
            Err(e) => {
                counters.ack_failures.fetch_add(1, Ordering::SeqCst);
                error!("Failed to acknowledge delivery {tag}: {e}");
            }
        },
        Err(e) => {
            warn!(
                "Dropping malformed delivery {tag} on {}: {e}",
                delivery.routing_key()
            );
            match delivery.reject(false).await {
                Ok(()) => {
                    counters.rejected.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => {
                    counters.ack_failures.fetch_add(1, Ordering::SeqCst);
                    error!("Failed to reject delivery {tag}: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::broker::{Acker, PublishProperties};
    use crate::routing::{RoutingKey, RoutingKeyResolver};
    use crate::topology::{ExchangeSpec, QueueSpec, TopologyManager};
    use async_trait::async_trait;
    use futures::stream;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<LogEvent>>,
        delay: Option<Duration>,
    }

    impl Recorder {
        fn count(&self) -> usize {
            self.events.lock().unwrap().len()
        }
    }

    impl Renderer for Recorder {
        fn on_decoded(&self, event: LogEvent) {
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            self.events.lock().unwrap().push(event);
        }
    }

    async fn queue(broker: &MemoryBroker, name: &str, pattern: &str) -> Queue {
        let manager = TopologyManager::new(Arc::new(broker.clone()), RoutingKeyResolver::default());
        let exchange = manager.declare_logs_exchange().await.unwrap();
        let queue = manager
            .declare_queue(&QueueSpec::named(name, true))
            .await
            .unwrap();
        manager
            .bind(&queue, &exchange, &RoutingKey::from(pattern))
            .await
            .unwrap();
        queue
    }

    async fn publish(broker: &MemoryBroker, level: &str, message: &str) {
        let event = LogEvent::new(level, "worker-1", message, 1, None);
        broker
            .publish(
                "logs",
                level,
                event.encode().unwrap(),
                &PublishProperties::default(),
            )
            .await
            .unwrap();
    }

    async fn until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(10), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn config(max_concurrency: usize) -> PoolConfig {
        PoolConfig {
            max_concurrency,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_rejects_invalid_configuration() {
        let broker = MemoryBroker::new();
        let errors = queue(&broker, "errors", "err").await;
        let renderer: Arc<dyn Renderer> = Arc::new(Recorder::default());
        let cancel = CancellationToken::new();

        let zero = ConsumerPool::start(
            Arc::new(broker.clone()),
            &errors,
            &config(0),
            Arc::clone(&renderer),
            &cancel,
        )
        .await;
        assert!(matches!(zero, Err(PoolError::ZeroConcurrency)));

        let none = ConsumerPool::start_many(Arc::new(broker), &[], &config(1), renderer, &cancel).await;
        assert!(matches!(none, Err(PoolError::NoQueues)));
    }

    #[tokio::test]
    async fn test_missing_queue_is_reported() {
        let broker = MemoryBroker::new();
        let missing = Queue {
            name: "missing".to_string(),
            durable: true,
        };

        let result = ConsumerPool::start(
            Arc::new(broker),
            &missing,
            &PoolConfig::default(),
            Arc::new(Recorder::default()),
            &CancellationToken::new(),
        )
        .await;

        assert!(matches!(
            result,
            Err(PoolError::Broker(BrokerError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_decodes_acks_and_renders() {
        let broker = MemoryBroker::new();
        let errors = queue(&broker, "errors", "err").await;
        let recorder = Arc::new(Recorder::default());

        let pool = ConsumerPool::start(
            Arc::new(broker.clone()),
            &errors,
            &PoolConfig::default(),
            recorder.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        publish(&broker, "err", "disk full").await;
        publish(&broker, "err", "disk still full").await;
        until(|| recorder.count() == 2).await;
        let stats = pool.stop().await;

        assert_eq!(stats.received, 2);
        assert_eq!(stats.acked, 2);
        assert_eq!(stats.rendered, 2);
        assert_eq!(stats.in_flight, 0);
        assert_eq!(broker.queue_stats("errors").unwrap().acked, 2);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_malformed_delivery_is_rejected_once() {
        let broker = MemoryBroker::new();
        let errors = queue(&broker, "errors", "err").await;
        let recorder = Arc::new(Recorder::default());

        let pool = ConsumerPool::start(
            Arc::new(broker.clone()),
            &errors,
            &config(1),
            recorder.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        broker.inject("errors", "err", b"not json".to_vec()).unwrap();
        publish(&broker, "err", "valid").await;
        until(|| recorder.count() == 1).await;
        let stats = pool.stop().await;

        assert_eq!(stats.rejected, 1);
        assert_eq!(stats.acked, 1);
        let queue_stats = broker.queue_stats("errors").unwrap();
        assert_eq!(queue_stats.rejected, 1);
        assert_eq!(queue_stats.requeued, 0);
        assert_eq!(queue_stats.unacked(), 0);
        assert!(logs_contain("Dropping malformed delivery"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_never_exceeds_max_concurrency() {
        let broker = MemoryBroker::new();
        let all = queue(&broker, "all", "#").await;
        let recorder = Arc::new(Recorder {
            delay: Some(Duration::from_millis(2)),
            ..Recorder::default()
        });
        for i in 0..60 {
            publish(&broker, "fyi", &format!("burst {i}")).await;
        }

        let pool = ConsumerPool::start(
            Arc::new(broker.clone()),
            &all,
            &config(3),
            recorder.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        until(|| recorder.count() == 60).await;
        let stats = pool.stop().await;

        assert!(stats.peak_in_flight >= 1);
        assert!(stats.peak_in_flight <= 3, "peak {}", stats.peak_in_flight);
        assert_eq!(stats.settled(), 60);
    }

    #[tokio::test]
    async fn test_no_rendering_after_stop() {
        let broker = MemoryBroker::new();
        let errors = queue(&broker, "errors", "err").await;
        let recorder = Arc::new(Recorder::default());

        let pool = ConsumerPool::start(
            Arc::new(broker.clone()),
            &errors,
            &PoolConfig::default(),
            recorder.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        publish(&broker, "err", "before").await;
        until(|| recorder.count() == 1).await;
        pool.stop().await;

        publish(&broker, "err", "after").await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(recorder.count(), 1);
        assert_eq!(broker.queue_stats("errors").unwrap().ready(), 1);
    }

    #[tokio::test]
    async fn test_wait_reports_lost_connection() {
        let broker = MemoryBroker::new();
        let errors = queue(&broker, "errors", "err").await;

        let pool = ConsumerPool::start(
            Arc::new(broker.clone()),
            &errors,
            &PoolConfig::default(),
            Arc::new(Recorder::default()),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        broker.close().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), pool.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(BrokerError::Connection(_))));
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_cancellation_token_stops_pulling() {
        let broker = MemoryBroker::new();
        let errors = queue(&broker, "errors", "err").await;
        let cancel = CancellationToken::new();

        let pool = ConsumerPool::start(
            Arc::new(broker.clone()),
            &errors,
            &PoolConfig::default(),
            Arc::new(Recorder::default()),
            &cancel,
        )
        .await
        .unwrap();
        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), pool.wait())
            .await
            .unwrap();
        assert!(result.is_ok());
        pool.stop().await;
    }

    #[tokio::test]
    async fn test_drains_several_queues() {
        let broker = MemoryBroker::new();
        let errors = queue(&broker, "errors", "err").await;
        let warnings = queue(&broker, "warnings", "wrn").await;
        let recorder = Arc::new(Recorder::default());

        let pool = ConsumerPool::start_many(
            Arc::new(broker.clone()),
            &[errors, warnings],
            &PoolConfig::default(),
            recorder.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        publish(&broker, "err", "e").await;
        publish(&broker, "wrn", "w").await;
        until(|| recorder.count() == 2).await;
        pool.stop().await;

        let mut levels: Vec<String> = recorder
            .events
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.level.clone())
            .collect();
        levels.sort();
        assert_eq!(levels, vec!["err", "wrn"]);
    }

    // Acknowledgments sent through a cancelled consumer fail.
    struct CancellableAcker {
        cancelled: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Acker for CancellableAcker {
        async fn ack(&self) -> Result<(), BrokerError> {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if self.cancelled.load(Ordering::SeqCst) {
                return Err(BrokerError::Settle {
                    tag: 1,
                    reason: "consumer cancelled".to_string(),
                });
            }
            Ok(())
        }

        async fn reject(&self, _requeue: bool) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct CancellableBroker {
        cancelled: Arc<AtomicBool>,
    }

    #[async_trait]
    impl Broker for CancellableBroker {
        async fn declare_exchange(&self, _spec: &ExchangeSpec) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn declare_queue(&self, _spec: &QueueSpec) -> Result<String, BrokerError> {
            Ok("errors".to_string())
        }

        async fn bind_queue(
            &self,
            _queue: &str,
            _exchange: &str,
            _pattern: &str,
        ) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn publish(
            &self,
            _exchange: &str,
            _routing_key: &str,
            _payload: Vec<u8>,
            _properties: &PublishProperties,
        ) -> Result<(), BrokerError> {
            Ok(())
        }

        async fn consume(
            &self,
            _queue: &str,
            _consumer_tag: &str,
            _prefetch: u16,
        ) -> Result<DeliveryStream, BrokerError> {
            let event = LogEvent::new("err", "worker-1", "slow ack", 1, None);
            let delivery = Delivery::new(
                event.encode().unwrap(),
                "err",
                1,
                false,
                Box::new(CancellableAcker {
                    cancelled: Arc::clone(&self.cancelled),
                }),
            );
            Ok(stream::iter(vec![Ok(delivery)])
                .chain(stream::pending())
                .boxed())
        }

        async fn cancel(&self, _consumer_tag: &str) -> Result<(), BrokerError> {
            self.cancelled.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn close(&self) -> Result<(), BrokerError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stop_settles_in_flight_before_cancelling_consumers() {
        let broker = Arc::new(CancellableBroker::default());
        let recorder = Arc::new(Recorder::default());
        let errors = Queue {
            name: "errors".to_string(),
            durable: true,
        };

        let pool = ConsumerPool::start(
            broker.clone(),
            &errors,
            &config(4),
            recorder.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        until(|| pool.stats().in_flight == 1).await;
        let stats = pool.stop().await;

        assert_eq!(stats.acked, 1);
        assert_eq!(stats.ack_failures, 0);
        assert_eq!(recorder.count(), 1);
        assert!(broker.cancelled.load(Ordering::SeqCst));
    }
}
