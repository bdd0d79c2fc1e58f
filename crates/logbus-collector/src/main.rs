// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use logbus::{
    broker::{amqp::AmqpBroker, Broker, RetryPolicy},
    config::CollectorConfig,
    consumer_pool::ConsumerPool,
    errors::{BrokerError, PoolError},
    logger::{plain_fields, Formatter},
    render::{LineFormatter, Renderer, SinkRenderer},
    rotation::{RotatingFile, RotationScheduler},
    topology::TopologyManager,
};

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let config = CollectorConfig::load();
    let log_level = config
        .as_ref()
        .map(|config| config.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_tracing(&log_level);

    let config = config.context("invalid collector configuration")?;
    debug!("Starting logbus collector");

    let shutdown = CancellationToken::new();
    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let formatter = LineFormatter::new(config.host_tags.clone());
    let sink = config.file_sink();
    let (renderer, scheduler) = match RotatingFile::open(sink.clone()) {
        Ok(file) => {
            let file = Arc::new(file);
            info!("Writing log lines to {}", file.path().display());
            let scheduler = RotationScheduler::spawn(Arc::clone(&file), shutdown.child_token());
            let renderer: Arc<dyn Renderer> =
                Arc::new(SinkRenderer::new(formatter, Some(file), config.echo_stdout));
            (renderer, Some(scheduler))
        }
        Err(e) => {
            error!(
                "Failed to open log file {}: {e}. Rendering to stdout only",
                sink.path.display()
            );
            let renderer: Arc<dyn Renderer> = Arc::new(SinkRenderer::console(formatter));
            (renderer, None)
        }
    };

    let result = run(&config, renderer, &shutdown).await;

    if let Some(scheduler) = scheduler {
        scheduler.stop().await;
    }
    match &result {
        Ok(()) => info!("Logbus collector stopped"),
        Err(e) => error!("Logbus collector failed: {e:#}"),
    }
    result
}

fn init_tracing(log_level: &str) {
    let env_filter = format!("lapin=warn,pinky_swear=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .fmt_fields(plain_fields())
        .event_format(Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");
}

async fn cancel_on_signal(shutdown: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                wait_for_ctrl_c().await;
                shutdown.cancel();
                return;
            }
        };
        tokio::select! {
            () = wait_for_ctrl_c() => {}
            _ = terminate.recv() => info!("Received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    wait_for_ctrl_c().await;

    info!("Shutting down");
    shutdown.cancel();
}

async fn wait_for_ctrl_c() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl-C"),
        Err(e) => {
            error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    }
}

/// Connects, declares the topology and consumes until shutdown. A lost connection
/// starts the cycle again; any other broker error is fatal.
async fn run(
    config: &CollectorConfig,
    renderer: Arc<dyn Renderer>,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let policy = RetryPolicy::default();
    let mut reconnects: u32 = 0;

    loop {
        let broker = match AmqpBroker::connect_with_retry(&config.amqp_url, &policy, shutdown).await
        {
            Ok(broker) => Arc::new(broker),
            Err(_) if shutdown.is_cancelled() => return Ok(()),
            Err(e) => return Err(e).context("could not connect to the broker"),
        };

        let connected = Instant::now();
        let outcome = serve(config, broker.clone(), Arc::clone(&renderer), shutdown).await;
        if let Err(e) = broker.close().await {
            debug!("Failed to close broker connection: {e}");
        }

        match outcome {
            Ok(()) => return Ok(()),
            Err(PoolError::Broker(e)) if e.is_retryable() && !shutdown.is_cancelled() => {
                reconnects = next_reconnect(reconnects, connected.elapsed(), &policy);
                let delay = policy.delay(reconnects);
                warn!(
                    "Lost broker connection: {e}. Reconnecting in {}ms",
                    delay.as_millis()
                );
                tokio::select! {
                    () = shutdown.cancelled() => return Ok(()),
                    () = tokio::time::sleep(delay) => {}
                }
            }
            Err(_) if shutdown.is_cancelled() => return Ok(()),
            Err(e) => return Err(e).context("collector cannot continue"),
        }
    }
}

/// Counts a reconnect, starting over at the first backoff step when the lost session
/// stayed up for at least the longest backoff delay.
fn next_reconnect(previous: u32, session: Duration, policy: &RetryPolicy) -> u32 {
    if session >= policy.max_delay {
        1
    } else {
        previous.saturating_add(1)
    }
}

async fn serve(
    config: &CollectorConfig,
    broker: Arc<AmqpBroker>,
    renderer: Arc<dyn Renderer>,
    shutdown: &CancellationToken,
) -> Result<(), PoolError> {
    let broker: Arc<dyn Broker> = broker;
    let manager = TopologyManager::new(Arc::clone(&broker), config.resolver());
    let exchange = manager.declare_logs_exchange().await?;
    let queues = manager
        .declare_subscriptions(&exchange, &config.subscription_plan())
        .await?;

    let pool =
        ConsumerPool::start_many(broker, &queues, &config.pool_config(), renderer, shutdown)
            .await?;

    let ended = tokio::select! {
        () = shutdown.cancelled() => None,
        result = pool.wait() => Some(result),
    };
    let stats = pool.stop().await;
    debug!("Consumer pool stats: {stats:?}");

    match ended {
        None => Ok(()),
        Some(Err(e)) => Err(e.into()),
        Some(Ok(())) if shutdown.is_cancelled() => Ok(()),
        Some(Ok(())) => Err(BrokerError::Connection("delivery stream ended".to_string()).into()),
    }
}
