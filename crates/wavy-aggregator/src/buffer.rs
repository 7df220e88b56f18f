// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-device ingest buffers.
//!
//! Every device gets its own slot, created on first use and kept for the life of the process so a
//! reconnecting device resumes where it left off. A slot holds two locks:
//!
//! - the buffer lock, guarding the in-memory lines. The durable mirror write happens inside the
//!   same critical section as the in-memory append, so an acknowledged line is never only in
//!   memory.
//! - the flush lock, held for the whole duration of a dispatch so two dispatches of the same device
//!   never forward the same snapshot.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};

use tokio::sync::{Mutex, MutexGuard, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use crate::durable_log::DurableLog;
use crate::protocol::DeviceId;

#[derive(Debug, Default)]
struct DeviceBuffer {
    lines: VecDeque<String>,
    // mirror contents have been loaded into `lines`
    recovered: bool,
}

#[derive(Debug, Default)]
struct Slot {
    buffer: Mutex<DeviceBuffer>,
    flush_lock: Arc<Mutex<()>>,
}

pub struct BufferPool {
    slots: StdMutex<HashMap<DeviceId, Arc<Slot>>>,
    log: Arc<dyn DurableLog>,
}

impl BufferPool {
    pub fn new(log: Arc<dyn DurableLog>) -> Self {
        Self {
            slots: StdMutex::new(HashMap::new()),
            log,
        }
    }

    /// Appends `line` to the device's buffer and mirror, returning the buffered line count.
    ///
    /// A mirror failure is logged and the in-memory append still happens.
    pub async fn append(&self, device: &DeviceId, line: &str) -> usize {
        let slot = self.slot(device);
        let mut buffer = self.lock_buffer(device, &slot).await;
        if let Err(e) = self.log.append(device, line).await {
            error!(
                "Durable mirror append failed for {}, line kept in memory only: {}",
                device, e
            );
        }
        buffer.lines.push_back(line.to_string());
        buffer.lines.len()
    }

    /// Copies the buffered lines in insertion order without removing them.
    pub async fn snapshot(&self, device: &DeviceId) -> Vec<String> {
        let slot = self.slot(device);
        let buffer = self.lock_buffer(device, &slot).await;
        buffer.lines.iter().cloned().collect()
    }

    /// Drops the first `flushed` lines after a confirmed forward and rewrites the mirror so it
    /// holds exactly the lines still buffered.
    ///
    /// While the mirror has not been loaded the file is left alone: it may hold lines memory
    /// never saw, and resending already forwarded lines beats losing those.
    pub async fn commit(&self, device: &DeviceId, flushed: usize) {
        let slot = self.slot(device);
        let mut buffer = self.lock_buffer(device, &slot).await;
        let flushed = flushed.min(buffer.lines.len());
        buffer.lines.drain(..flushed);

        if !buffer.recovered {
            warn!(
                "Durable mirror for {} not loaded yet, keeping it untouched after flush",
                device
            );
            return;
        }
        // lines appended while the batch was in flight
        let remaining: Vec<String> = buffer.lines.iter().cloned().collect();
        if let Err(e) = self.log.replace(device, &remaining).await {
            error!("Failed to rewrite durable mirror for {}: {}", device, e);
            return;
        }
        debug!(
            "Committed {} lines for {}, {} still buffered",
            flushed,
            device,
            buffer.lines.len()
        );
    }

    pub async fn len(&self, device: &DeviceId) -> usize {
        let slot = self.slot(device);
        let buffer = self.lock_buffer(device, &slot).await;
        buffer.lines.len()
    }

    /// Serializes dispatches of one device. Hold the returned guard for the whole dispatch.
    pub async fn flush_permit(&self, device: &DeviceId) -> OwnedMutexGuard<()> {
        let slot = self.slot(device);
        Arc::clone(&slot.flush_lock).lock_owned().await
    }

    /// Devices that currently have a slot, in no particular order.
    pub fn devices(&self) -> Vec<DeviceId> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    fn slot(&self, device: &DeviceId) -> Arc<Slot> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(device.clone()).or_default())
    }

    async fn lock_buffer<'a>(
        &self,
        device: &DeviceId,
        slot: &'a Slot,
    ) -> MutexGuard<'a, DeviceBuffer> {
        let mut buffer = slot.buffer.lock().await;
        if !buffer.recovered {
            match self.log.load(device).await {
                Ok(lines) => {
                    if !lines.is_empty() {
                        info!(
                            "Recovered {} unflushed lines for {} from durable mirror",
                            lines.len(),
                            device
                        );
                    }
                    // the mirror holds every line appended so far, including any taken while
                    // earlier loads were failing
                    buffer.lines = lines.into();
                    buffer.recovered = true;
                }
                // retried on the next lock
                Err(e) => error!("Failed to load durable mirror for {}: {}", device, e),
            }
        }
        buffer
    }
}
