// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the aggregator pipeline.
//!
//! Every failure is handled at the session or dispatch boundary; none of these errors is
//! allowed to take down the listener.

use std::time::Duration;

/// Reasons a device session ends without a clean `QUIT`.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("admission denied for device {0}")]
    AdmissionDenied(String),

    #[error("session idle for more than {0:?}")]
    IdleTimeout(Duration),

    #[error("aggregator shutting down")]
    Shutdown,

    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors parsing a single protocol line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,

    #[error("unknown command {0}")]
    UnknownCommand(String),

    #[error("missing field {field} in {command}")]
    MissingField {
        command: &'static str,
        field: &'static str,
    },

    #[error("invalid device id {0:?}")]
    InvalidDeviceId(String),
}

/// Failures of the transform collaborator.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("transform service unreachable: {0}")]
    Unreachable(String),

    #[error("transform service rejected payload with status {0}")]
    Rejected(u16),
}

/// Failures forwarding a batch to the collector.
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("collector connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("collector did not acknowledge: {0:?}")]
    Nack(String),
}

/// Failures of the startup busy-ness probe.
#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("probe connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("unparsable queue length {0:?}")]
    Unparsable(String),
}

/// Outcome of a failed `BatchDispatcher::dispatch` call. The device buffer is untouched.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("transform failed: {0}")]
    Transform(#[from] TransformError),

    #[error("forward failed: {0}")]
    Forward(#[from] ForwardError),

    #[error("{stage} timed out after {timeout:?}")]
    Timeout {
        stage: &'static str,
        timeout: Duration,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DurableLogError {
    #[error("durable log I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigStoreError {
    #[error("unknown device {0}")]
    UnknownDevice(String),

    #[error("device registry I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("device registry is not valid JSON: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Invalid node configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
