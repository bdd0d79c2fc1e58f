// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Publishes one log event to the `logs` exchange.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use logbus::{
    broker::{amqp::AmqpBroker, memory::MemoryBroker, Broker, RetryPolicy},
    config::ProducerConfig,
    logger::{plain_fields, Formatter},
    publisher::{ProducerIdentity, Publisher},
    topology::TopologyManager,
};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// Event level, e.g. err, wrn, fyi, dbg, dmp, good, logDone or logFail
    level: String,

    /// Message words, joined with single spaces
    #[arg(required = true)]
    message: Vec<String>,

    /// Correlation id shown in the id column
    #[arg(long)]
    id: Option<String>,

    /// Server name used as the first half of the Host field
    #[arg(long)]
    server: Option<String>,

    /// Publish to an in-process broker and print the routing key and payload
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut config = ProducerConfig::from_env().context("invalid producer configuration")?;
    if let Some(server) = args.server.clone() {
        config.server = server;
    }
    init_tracing(&config.log_level);

    let dry_run = args.dry_run.then(MemoryBroker::new);
    let broker: Arc<dyn Broker> = if let Some(memory) = &dry_run {
        Arc::new(memory.clone())
    } else {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            ..RetryPolicy::default()
        };
        let broker = AmqpBroker::connect_with_retry(&config.amqp_url, &policy, &CancellationToken::new())
            .await
            .context("could not connect to the broker")?;
        Arc::new(broker)
    };

    // Publishing to an undeclared exchange is a channel error.
    TopologyManager::new(Arc::clone(&broker), config.resolver())
        .declare_logs_exchange()
        .await
        .context("could not declare the logs exchange")?;

    let identity = ProducerIdentity::detect(config.server.as_str());
    let publisher = Publisher::new(Arc::clone(&broker), &identity, config.resolver());
    publisher.echo_locally(config.echo_locally);

    let message = args.message.join(" ");
    publisher
        .publish(&args.level, message, args.id.as_deref())
        .await
        .context("could not publish the event")?;

    if let Some(memory) = &dry_run {
        for published in memory.published() {
            println!("{} {}", published.routing_key, String::from_utf8_lossy(&published.body));
        }
    }
    publisher.close().await.context("could not close the connection")?;
    Ok(())
}

fn init_tracing(log_level: &str) {
    let env_filter = format!("lapin=warn,pinky_swear=off,{log_level}");

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_writer(std::io::stderr)
        .fmt_fields(plain_fields())
        .event_format(Formatter)
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");
}
