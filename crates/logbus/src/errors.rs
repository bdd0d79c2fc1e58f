// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

/// Errors raised by a broker transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    /// The broker cannot be reached or the connection was lost.
    #[error("Connection failure: {0}")]
    Connection(String),

    /// An exchange or queue already exists with incompatible parameters.
    /// Requires operator intervention and is never retried.
    #[error("Topology declaration conflict: {0}")]
    TopologyConflict(String),

    /// A declaration, binding or publish referenced something that does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Acknowledging or rejecting a delivery failed.
    #[error("Failed to settle delivery {tag}: {reason}")]
    Settle { tag: u64, reason: String },
}

impl BrokerError {
    /// Whether the owning component may retry after this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// The event could not be serialized.
#[derive(Debug, thiserror::Error)]
#[error("Failed to encode log event: {0}")]
pub struct EncodeError(#[from] pub serde_json::Error);

/// A delivery payload is not a valid log event.
#[derive(Debug, thiserror::Error)]
#[error("Failed to decode log event: {0}")]
pub struct DecodeError(#[from] pub serde_json::Error);

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("max_concurrency must be greater than 0")]
    ZeroConcurrency,

    #[error("no queues to consume from")]
    NoQueues,

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, thiserror::Error)]
pub enum RotationError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("line of {len} bytes exceeds the maximum file size of {max} bytes")]
    LineTooLarge { len: u64, max: u64 },

    #[error("file sink is unavailable after a failed rotation: {0}")]
    SinkUnavailable(String),

    #[error("rotation scheduler has stopped")]
    SchedulerStopped,
}

impl RotationError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to read configuration file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}
