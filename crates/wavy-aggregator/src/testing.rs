// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-memory collaborators for unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::collector::Forwarder;
use crate::durable_log::DurableLog;
use crate::errors::{DurableLogError, ForwardError, TransformError};
use crate::protocol::DeviceId;
use crate::transform::Transform;

#[derive(Default)]
pub struct MemoryDurableLog {
    files: Mutex<HashMap<DeviceId, Vec<String>>>,
    fail_appends: AtomicBool,
    failing_loads: AtomicUsize,
}

impl MemoryDurableLog {
    pub fn lines(&self, device: &DeviceId) -> Vec<String> {
        self.files
            .lock()
            .unwrap()
            .get(device)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// The next `n` loads fail.
    pub fn fail_loads(&self, n: usize) {
        self.failing_loads.store(n, Ordering::SeqCst);
    }
}

#[async_trait]
impl DurableLog for MemoryDurableLog {
    async fn append(&self, device: &DeviceId, line: &str) -> Result<(), DurableLogError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(std::io::Error::other("disk full").into());
        }
        self.files
            .lock()
            .unwrap()
            .entry(device.clone())
            .or_default()
            .push(line.to_string());
        Ok(())
    }

    async fn truncate(&self, device: &DeviceId) -> Result<(), DurableLogError> {
        self.files.lock().unwrap().remove(device);
        Ok(())
    }

    async fn replace(&self, device: &DeviceId, lines: &[String]) -> Result<(), DurableLogError> {
        self.files
            .lock()
            .unwrap()
            .insert(device.clone(), lines.to_vec());
        Ok(())
    }

    async fn load(&self, device: &DeviceId) -> Result<Vec<String>, DurableLogError> {
        let failing = self
            .failing_loads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(std::io::Error::other("unreadable mirror").into());
        }
        Ok(self.lines(device))
    }
}

/// Identity transform that records every payload it sees.
#[derive(Default)]
pub struct MockTransform {
    payloads: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl MockTransform {
    pub fn payloads(&self) -> Vec<String> {
        self.payloads.lock().unwrap().clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transform for MockTransform {
    async fn transform(&self, payload: &[u8]) -> Result<Vec<u8>, TransformError> {
        self.payloads
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(payload).into_owned());
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransformError::Unreachable("mock transform down".to_string()));
        }
        Ok(payload.to_vec())
    }
}

/// Forwarder that records acknowledged batches.
#[derive(Default)]
pub struct MockForwarder {
    batches: Mutex<Vec<(DeviceId, String)>>,
    fail: AtomicBool,
    delay_ms: AtomicU64,
}

impl MockForwarder {
    pub fn batches(&self) -> Vec<(DeviceId, String)> {
        self.batches.lock().unwrap().clone()
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn delay(&self, delay: Duration) {
        self.delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl Forwarder for MockForwarder {
    async fn forward(&self, device: &DeviceId, payload: &[u8]) -> Result<(), ForwardError> {
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ForwardError::Nack(String::new()));
        }
        self.batches.lock().unwrap().push((
            device.clone(),
            String::from_utf8_lossy(payload).into_owned(),
        ));
        Ok(())
    }
}
