// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client side of the central collector.
//!
//! Every request opens a fresh TCP connection, writes one frame, half-closes the write side and
//! reads the reply until EOF or the first newline.

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::debug;

use crate::errors::{ForwardError, ProbeError};
use crate::protocol::{encode_forward, is_collector_ack, DeviceId, QUEUE_LENGTH};

// Longest collector reply we bother reading.
const MAX_REPLY_BYTES: u64 = 1024;

#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Sends one finished batch. `Ok` only once the collector acknowledged it.
    async fn forward(&self, device: &DeviceId, payload: &[u8]) -> Result<(), ForwardError>;
}

#[derive(Debug, Clone)]
pub struct TcpCollector {
    address: String,
}

impl TcpCollector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Asks the collector for its current queue length.
    pub async fn queue_length(&self) -> Result<u64, ProbeError> {
        let reply = self.request(format!("{QUEUE_LENGTH}\n").as_bytes()).await?;
        reply
            .trim()
            .parse::<u64>()
            .map_err(|_| ProbeError::Unparsable(reply))
    }

    async fn request(&self, frame: &[u8]) -> std::io::Result<String> {
        let mut stream = TcpStream::connect(&self.address).await?;
        stream.write_all(frame).await?;
        stream.shutdown().await?;

        let mut reply = String::new();
        BufReader::new(stream)
            .take(MAX_REPLY_BYTES)
            .read_line(&mut reply)
            .await?;
        Ok(reply)
    }
}

#[async_trait]
impl Forwarder for TcpCollector {
    async fn forward(&self, device: &DeviceId, payload: &[u8]) -> Result<(), ForwardError> {
        let frame = encode_forward(device, payload);
        let reply = self.request(&frame).await?;
        if !is_collector_ack(&reply) {
            return Err(ForwardError::Nack(reply.trim_end().to_string()));
        }
        debug!(
            "Collector {} acknowledged {} bytes from {}",
            self.address,
            payload.len(),
            device
        );
        Ok(())
    }
}
