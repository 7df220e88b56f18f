// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::buffer::BufferPool;
use crate::collector::Forwarder;
use crate::errors::DispatchError;
use crate::protocol::DeviceId;
use crate::transform::Transform;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing was buffered for the device.
    Empty,
    /// The batch was acknowledged by the collector and removed from the buffer.
    Forwarded { lines: usize },
}

/// Moves a device's buffered lines through transform and forward, clearing them only once the
/// collector has acknowledged the batch.
pub struct BatchDispatcher {
    buffers: Arc<BufferPool>,
    transform: Arc<dyn Transform>,
    forwarder: Arc<dyn Forwarder>,
    timeout: Duration,
}

impl BatchDispatcher {
    /// `timeout` bounds each collaborator call separately.
    pub fn new(
        buffers: Arc<BufferPool>,
        transform: Arc<dyn Transform>,
        forwarder: Arc<dyn Forwarder>,
        timeout: Duration,
    ) -> Self {
        BatchDispatcher {
            buffers,
            transform,
            forwarder,
            timeout,
        }
    }

    /// Dispatches everything currently buffered for `device`.
    ///
    /// On error the buffer is left exactly as it was; there is no retry here. The inline path
    /// retries naturally on the next append since the buffer stays above its threshold.
    pub async fn dispatch(&self, device: &DeviceId) -> Result<DispatchOutcome, DispatchError> {
        let _permit = self.buffers.flush_permit(device).await;

        let lines = self.buffers.snapshot(device).await;
        if lines.is_empty() {
            return Ok(DispatchOutcome::Empty);
        }
        let n_lines = lines.len();
        debug!("Dispatching {n_lines} lines for {device}");

        if let Err(e) = self.ship(device, lines.join("\n")).await {
            error!(
                "Failed to dispatch {n_lines} lines for {device}, keeping them buffered: {e}"
            );
            return Err(e);
        }

        self.buffers.commit(device, n_lines).await;
        debug!("Successfully dispatched {n_lines} lines for {device}");
        Ok(DispatchOutcome::Forwarded { lines: n_lines })
    }

    /// Best-effort dispatch of every device with buffered data, used at shutdown. Returns the
    /// number of devices whose dispatch failed.
    pub async fn flush_all(&self) -> usize {
        let mut failed = 0;
        for device in self.buffers.devices() {
            match self.dispatch(&device).await {
                Ok(DispatchOutcome::Forwarded { lines }) => {
                    info!("Shutdown flush forwarded {lines} lines for {device}")
                }
                Ok(DispatchOutcome::Empty) => {}
                Err(_) => failed += 1,
            }
        }
        failed
    }

    async fn ship(&self, device: &DeviceId, payload: String) -> Result<(), DispatchError> {
        let transformed = tokio::time::timeout(
            self.timeout,
            self.transform.transform(payload.as_bytes()),
        )
        .await
        .map_err(|_| DispatchError::Timeout {
            stage: "transform",
            timeout: self.timeout,
        })??;

        tokio::time::timeout(self.timeout, self.forwarder.forward(device, &transformed))
            .await
            .map_err(|_| DispatchError::Timeout {
                stage: "forward",
                timeout: self.timeout,
            })??;
        Ok(())
    }
}
