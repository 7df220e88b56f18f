// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregator node for WAVY field sensors.
//!
//! Devices connect over TCP and stream CSV readings using a small line protocol. The node keeps
//! one session per device, buffers each device's lines (mirrored to disk), and once a device's
//! configured volume is reached, transforms the batch and forwards it to the central collector.
//! Buffers are only cleared after the collector acknowledges a batch.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod buffer;
pub mod collector;
pub mod config;
pub mod config_store;
pub mod dispatcher;
pub mod durable_log;
pub mod errors;
pub mod flush_policy;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transform;
pub mod upstream;
pub mod util;

#[cfg(test)]
mod testing;
