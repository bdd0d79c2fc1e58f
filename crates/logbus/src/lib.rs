// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Topic-routed distribution of structured log events over a message broker.
//!
//! Producers build [`event::LogEvent`]s and publish them through a
//! [`publisher::Publisher`]; the routing key is derived from the event level by
//! [`routing::RoutingKeyResolver`]. Collectors declare their queues and bindings with
//! [`topology::TopologyManager`], drain them with a bounded
//! [`consumer_pool::ConsumerPool`] and hand every decoded event to a
//! [`render::Renderer`]. Local output goes to a [`rotation::RotatingFile`] that is
//! rotated daily and on SIGHUP by the [`rotation::RotationScheduler`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod broker;
pub mod config;
pub mod constants;
pub mod consumer_pool;
pub mod errors;
pub mod event;
pub mod hostname;
pub mod logger;
pub mod publisher;
pub mod render;
pub mod rotation;
pub mod routing;
pub mod topology;
