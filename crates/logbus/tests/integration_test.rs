// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use logbus::broker::memory::MemoryBroker;
use logbus::broker::Broker;
use logbus::consumer_pool::{ConsumerPool, PoolConfig};
use logbus::event::LogEvent;
use logbus::publisher::{ProducerIdentity, Publisher};
use logbus::render::{LineFormatter, Renderer, SinkRenderer};
use logbus::rotation::{FileSinkConfig, RotatingFile, RotationScheduler, TriggerSources};
use logbus::routing::{RoutingKey, RoutingKeyResolver};
use logbus::topology::{Exchange, Queue, QueueSpec, TopologyManager};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct Collected {
    events: Mutex<Vec<LogEvent>>,
}

impl Collected {
    fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }
}

impl Renderer for Collected {
    fn on_decoded(&self, event: LogEvent) {
        self.events.lock().unwrap().push(event);
    }
}

async fn bound_queue(manager: &TopologyManager, exchange: &Exchange, name: &str, pattern: &str) -> Queue {
    let queue = manager
        .declare_queue(&QueueSpec::named(name, true))
        .await
        .expect("declare queue");
    manager
        .bind(&queue, exchange, &RoutingKey::from(pattern))
        .await
        .expect("bind queue");
    queue
}

async fn eventually(condition: impl Fn() -> bool) {
    timeout(Duration::from_secs(20), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn error_event_reaches_the_error_queue_unchanged() {
    let broker = MemoryBroker::new();
    let manager = TopologyManager::new(Arc::new(broker.clone()), RoutingKeyResolver::default());
    let exchange = manager.declare_logs_exchange().await.unwrap();
    let errors = bound_queue(&manager, &exchange, "errors", "err").await;
    bound_queue(&manager, &exchange, "warnings", "wrn").await;

    let sent = LogEvent::new("err", "worker-1", "disk full", 1_700_000_000_000, None);
    let key = RoutingKeyResolver::default().resolve(&sent.level);
    assert_eq!(key.as_str(), "err");
    broker
        .publish("logs", key.as_str(), sent.encode().unwrap(), &Default::default())
        .await
        .unwrap();

    let collected = Arc::new(Collected::default());
    let pool = ConsumerPool::start(
        Arc::new(broker.clone()),
        &errors,
        &PoolConfig::default(),
        collected.clone(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    eventually(|| collected.len() == 1).await;
    let stats = pool.stop().await;

    assert_eq!(collected.events.lock().unwrap()[0], sent);
    assert_eq!(stats.acked, 1);
    assert_eq!(broker.queue_stats("errors").unwrap().delivered, 1);
    assert_eq!(broker.queue_stats("warnings").unwrap().enqueued, 0);
}

#[tokio::test]
async fn unknown_level_only_reaches_catch_all_queues() {
    let broker = MemoryBroker::new();
    let manager = TopologyManager::new(Arc::new(broker.clone()), RoutingKeyResolver::default());
    let exchange = manager.declare_logs_exchange().await.unwrap();
    bound_queue(&manager, &exchange, "everything", "#").await;
    bound_queue(&manager, &exchange, "errors", "err").await;
    bound_queue(&manager, &exchange, "debug", "dbg").await;

    let publisher = Publisher::new(
        Arc::new(broker.clone()),
        &ProducerIdentity::new("api", "host-1"),
        RoutingKeyResolver::default(),
    );
    publisher.publish("xyz", "something odd", None).await.unwrap();

    assert_eq!(broker.published()[0].routing_key, "#");
    assert_eq!(broker.queue_stats("everything").unwrap().enqueued, 1);
    assert_eq!(broker.queue_stats("errors").unwrap().enqueued, 0);
    assert_eq!(broker.queue_stats("debug").unwrap().enqueued, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_producers_are_drained_exactly_once() {
    const PRODUCERS: usize = 10;
    const EVENTS_PER_PRODUCER: usize = 100;
    const TOTAL: usize = PRODUCERS * EVENTS_PER_PRODUCER;

    let broker = MemoryBroker::new();
    let manager = TopologyManager::new(Arc::new(broker.clone()), RoutingKeyResolver::default());
    let exchange = manager.declare_logs_exchange().await.unwrap();
    let queue = bound_queue(&manager, &exchange, "central", "#").await;
    manager
        .bind(&queue, &exchange, &RoutingKey::from("err"))
        .await
        .unwrap();

    let collected = Arc::new(Collected::default());
    let pool = ConsumerPool::start(
        Arc::new(broker.clone()),
        &queue,
        &PoolConfig {
            max_concurrency: 50,
            ..PoolConfig::default()
        },
        collected.clone(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut producers = Vec::with_capacity(PRODUCERS);
    for producer in 0..PRODUCERS {
        let publisher = Publisher::new(
            Arc::new(broker.clone()),
            &ProducerIdentity::new("worker", producer.to_string()),
            RoutingKeyResolver::default(),
        );
        producers.push(tokio::spawn(async move {
            for n in 0..EVENTS_PER_PRODUCER {
                let level = if n % 2 == 0 { "err" } else { "fyi" };
                let id = format!("{producer}-{n}");
                publisher
                    .publish(level, format!("event {n}"), Some(&id))
                    .await
                    .unwrap();
            }
        }));
    }
    for producer in producers {
        producer.await.unwrap();
    }

    eventually(|| collected.len() == TOTAL).await;
    let stats = pool.stop().await;

    let ids: HashSet<String> = collected
        .events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|event| event.id.clone())
        .collect();
    assert_eq!(ids.len(), TOTAL);
    assert_eq!(stats.acked, TOTAL as u64);
    assert_eq!(stats.rejected, 0);
    assert!(stats.peak_in_flight <= 50, "peak {}", stats.peak_in_flight);

    let queue_stats = broker.queue_stats("central").unwrap();
    assert_eq!(queue_stats.enqueued, TOTAL as u64);
    assert_eq!(queue_stats.acked, TOTAL as u64);
    assert_eq!(queue_stats.unacked(), 0);
    assert_eq!(queue_stats.ready(), 0);
}

#[tokio::test]
async fn malformed_payload_is_settled_and_skipped() {
    let broker = MemoryBroker::new();
    let manager = TopologyManager::new(Arc::new(broker.clone()), RoutingKeyResolver::default());
    let exchange = manager.declare_logs_exchange().await.unwrap();
    let queue = bound_queue(&manager, &exchange, "errors", "err").await;

    let collected = Arc::new(Collected::default());
    let pool = ConsumerPool::start(
        Arc::new(broker.clone()),
        &queue,
        &PoolConfig::default(),
        collected.clone(),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    broker
        .inject("errors", "err", br#"{"Level": 42}"#.to_vec())
        .unwrap();
    let publisher = Publisher::new(
        Arc::new(broker.clone()),
        &ProducerIdentity::new("api", "host-1"),
        RoutingKeyResolver::default(),
    );
    publisher.publish("err", "after the bad one", None).await.unwrap();

    eventually(|| collected.len() == 1).await;
    let stats = pool.stop().await;

    assert_eq!(collected.events.lock().unwrap()[0].message.joined(), "after the bad one");
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.settled(), 2);
    assert_eq!(broker.queue_stats("errors").unwrap().unacked(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rapid_rotations_keep_every_line() {
    const EVENTS: usize = 200;

    let dir = tempfile::tempdir().unwrap();
    let file = Arc::new(
        RotatingFile::open(FileSinkConfig {
            path: dir.path().join("logbus.log"),
            max_size_mb: 0,
            max_backups: 2,
            max_age_days: 0,
        })
        .unwrap(),
    );
    let scheduler = RotationScheduler::spawn_with(
        Arc::clone(&file),
        CancellationToken::new(),
        TriggerSources {
            daily: false,
            hangup: false,
        },
    );

    let broker = MemoryBroker::new();
    let manager = TopologyManager::new(Arc::new(broker.clone()), RoutingKeyResolver::default());
    let exchange = manager.declare_logs_exchange().await.unwrap();
    let queue = bound_queue(&manager, &exchange, "all", "#").await;
    let renderer = Arc::new(SinkRenderer::new(
        LineFormatter::default(),
        Some(Arc::clone(&file)),
        false,
    ));
    let pool = ConsumerPool::start(
        Arc::new(broker.clone()),
        &queue,
        &PoolConfig {
            max_concurrency: 8,
            ..PoolConfig::default()
        },
        renderer,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let publisher = Publisher::new(
        Arc::new(broker.clone()),
        &ProducerIdentity::new("api", "host-1"),
        RoutingKeyResolver::default(),
    );
    for n in 0..EVENTS {
        publisher.print(format!("line {n}")).await.unwrap();
        if n == EVENTS / 2 {
            scheduler.trigger().await.unwrap();
            scheduler.trigger().await.unwrap();
        }
    }

    eventually(|| broker.queue_stats("all").unwrap().acked == EVENTS as u64).await;
    pool.stop().await;
    scheduler.stop().await;

    assert_eq!(file.rotations(), 2);
    let backups = file.backups().unwrap();
    assert!(backups.len() <= 2);

    let mut lines = std::fs::read_to_string(file.path()).unwrap();
    for backup in &backups {
        lines.push_str(&std::fs::read_to_string(backup).unwrap());
    }
    let written: Vec<&str> = lines.lines().collect();
    assert_eq!(written.len(), EVENTS);
    assert!(written.iter().all(|line| line.contains("|fyi|")));
}
