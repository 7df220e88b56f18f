// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Device registry consulted during the handshake and on every flush decision.
//!
//! The core only depends on the [`ConfigStore`] trait. [`JsonConfigStore`] keeps the registry in
//! memory and, when loaded from a file, writes every mutation back to it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use derive_more::Display;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

use crate::errors::ConfigStoreError;
use crate::protocol::DeviceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    #[display("associated")]
    Associated,
    #[display("operating")]
    Operating,
    #[display("maintenance")]
    Maintenance,
    #[display("deactivated")]
    Deactivated,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub status: DeviceStatus,
    /// Number of buffered lines that triggers a flush. Absent means never auto-flush.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u32>,
    /// Unix timestamp (seconds) of the last accepted data line.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sync: Option<u64>,
}

impl DeviceRecord {
    pub fn new(status: DeviceStatus, volume: Option<u32>) -> Self {
        Self {
            status,
            volume,
            last_sync: None,
        }
    }
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// True when the device exists in the registry.
    async fn is_configured(&self, device: &DeviceId) -> bool;
    async fn get_status(&self, device: &DeviceId) -> Option<DeviceStatus>;
    async fn set_status(
        &self,
        device: &DeviceId,
        status: DeviceStatus,
    ) -> Result<(), ConfigStoreError>;
    /// Flush threshold, read fresh on every call so registry edits apply to the next message.
    async fn get_volume(&self, device: &DeviceId) -> Option<u32>;
    async fn touch_last_sync(&self, device: &DeviceId) -> Result<(), ConfigStoreError>;
}

type Devices = BTreeMap<String, DeviceRecord>;

pub struct JsonConfigStore {
    devices: Mutex<Devices>,
    path: Option<PathBuf>,
}

impl JsonConfigStore {
    /// Store with no backing file.
    pub fn in_memory(devices: impl IntoIterator<Item = (String, DeviceRecord)>) -> Self {
        Self {
            devices: Mutex::new(devices.into_iter().collect()),
            path: None,
        }
    }

    /// Loads the registry from a JSON object mapping device id to record. A missing file yields an
    /// empty registry that is created on the first write.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigStoreError> {
        let path = path.as_ref().to_path_buf();
        let devices: Devices = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Devices::new(),
            Err(e) => return Err(e.into()),
        };
        debug!(
            "Loaded {} devices from registry {}",
            devices.len(),
            path.display()
        );
        Ok(Self {
            devices: Mutex::new(devices),
            path: Some(path),
        })
    }

    /// Adds or replaces a device record.
    pub async fn upsert(
        &self,
        device: &DeviceId,
        record: DeviceRecord,
    ) -> Result<(), ConfigStoreError> {
        let mut devices = self.devices.lock().await;
        devices.insert(device.to_string(), record);
        self.persist(&devices).await
    }

    pub async fn record(&self, device: &DeviceId) -> Option<DeviceRecord> {
        self.devices.lock().await.get(device.as_str()).cloned()
    }

    async fn update(
        &self,
        device: &DeviceId,
        f: impl FnOnce(&mut DeviceRecord),
    ) -> Result<(), ConfigStoreError> {
        let mut devices = self.devices.lock().await;
        let record = devices
            .get_mut(device.as_str())
            .ok_or_else(|| ConfigStoreError::UnknownDevice(device.to_string()))?;
        f(record);
        self.persist(&devices).await
    }

    // Called with the map lock held so concurrent writers cannot reorder file contents.
    async fn persist(&self, devices: &Devices) -> Result<(), ConfigStoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(devices)?;
        tokio::fs::write(path, bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    async fn is_configured(&self, device: &DeviceId) -> bool {
        self.devices.lock().await.contains_key(device.as_str())
    }

    async fn get_status(&self, device: &DeviceId) -> Option<DeviceStatus> {
        self.devices
            .lock()
            .await
            .get(device.as_str())
            .map(|r| r.status)
    }

    async fn set_status(
        &self,
        device: &DeviceId,
        status: DeviceStatus,
    ) -> Result<(), ConfigStoreError> {
        self.update(device, |record| record.status = status).await
    }

    async fn get_volume(&self, device: &DeviceId) -> Option<u32> {
        self.devices
            .lock()
            .await
            .get(device.as_str())
            .and_then(|r| r.volume)
    }

    async fn touch_last_sync(&self, device: &DeviceId) -> Result<(), ConfigStoreError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        self.update(device, |record| record.last_sync = Some(now))
            .await
    }
}
