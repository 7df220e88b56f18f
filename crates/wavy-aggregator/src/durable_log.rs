// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::errors::DurableLogError;
use crate::protocol::DeviceId;
use crate::util::file_stem_for;

/// Per-device append-only mirror of buffered lines.
#[async_trait]
pub trait DurableLog: Send + Sync {
    async fn append(&self, device: &DeviceId, line: &str) -> Result<(), DurableLogError>;
    async fn truncate(&self, device: &DeviceId) -> Result<(), DurableLogError>;
    /// Swaps the whole mirror for `lines` in one step; a crash leaves either the old or the new
    /// contents.
    async fn replace(&self, device: &DeviceId, lines: &[String]) -> Result<(), DurableLogError>;
    /// Lines currently mirrored for `device`, oldest first.
    async fn load(&self, device: &DeviceId) -> Result<Vec<String>, DurableLogError>;
}

/// One `<device>.csv` file per device under a data directory.
#[derive(Debug, Clone)]
pub struct FileDurableLog {
    dir: PathBuf,
}

impl FileDurableLog {
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self, DurableLogError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn path_for(&self, device: &DeviceId) -> PathBuf {
        self.dir
            .join(format!("{}.csv", file_stem_for(device.as_str())))
    }
}

#[async_trait]
impl DurableLog for FileDurableLog {
    async fn append(&self, device: &DeviceId, line: &str) -> Result<(), DurableLogError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(device))
            .await?;
        let mut record = Vec::with_capacity(line.len() + 1);
        record.extend_from_slice(line.as_bytes());
        record.push(b'\n');
        file.write_all(&record).await?;
        file.flush().await?;
        Ok(())
    }

    async fn truncate(&self, device: &DeviceId) -> Result<(), DurableLogError> {
        match tokio::fs::OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(self.path_for(device))
            .await
        {
            Ok(_) => {
                debug!("Truncated durable mirror for {}", device);
                Ok(())
            }
            // nothing was ever mirrored
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, device: &DeviceId, lines: &[String]) -> Result<(), DurableLogError> {
        if lines.is_empty() {
            return self.truncate(device).await;
        }
        let path = self.path_for(device);
        let staging = path.with_extension("csv.tmp");
        let mut contents = Vec::new();
        for line in lines {
            contents.extend_from_slice(line.as_bytes());
            contents.push(b'\n');
        }
        let mut file = tokio::fs::File::create(&staging).await?;
        file.write_all(&contents).await?;
        file.sync_all().await?;
        tokio::fs::rename(&staging, &path).await?;
        debug!("Rewrote durable mirror for {} with {} lines", device, lines.len());
        Ok(())
    }

    // A torn write can leave invalid UTF-8 behind; only the damaged line is affected.
    async fn load(&self, device: &DeviceId) -> Result<Vec<String>, DurableLogError> {
        match tokio::fs::read(self.path_for(device)).await {
            Ok(contents) => Ok(contents
                .split(|byte| *byte == b'\n')
                .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
                .filter(|line| !line.is_empty())
                .map(|line| String::from_utf8_lossy(line).into_owned())
                .collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}
