// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host-level container monitor.
//!
//! Watches a container runtime for lifecycle events, captures each
//! container's launch environment, follows container logs and forwards every
//! line to a per-container structured log sink and, optionally, to a batched
//! stream-ingestion sink.
//!
//! - [`dispatcher`]: inventory of existing containers and live event dispatch
//! - [`handlers`]: per-event lifecycle handling
//! - [`subscriber`]: resilient per-container log following
//! - [`forwarder`]: periodic batched stream forwarding
//! - [`state`]: container registry and stream buffers

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod cgroups;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod forwarder;
pub mod handlers;
pub mod monitor;
pub mod parser;
pub mod runtime;
pub mod sinks;
pub mod state;
pub mod subscriber;
pub mod supervisor;
