// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Transform step applied to a batch before it is forwarded.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, error};

use crate::errors::TransformError;

#[async_trait]
pub trait Transform: Send + Sync {
    /// Converts a newline-joined batch. Any error leaves the batch buffered.
    async fn transform(&self, payload: &[u8]) -> Result<Vec<u8>, TransformError>;
}

/// Local normalization used when no transform service is configured.
///
/// Unifies line endings, trims whitespace around every CSV field and line, and never adds or
/// removes lines.
#[derive(Debug, Default, Clone, Copy)]
pub struct CsvNormalizer;

#[async_trait]
impl Transform for CsvNormalizer {
    async fn transform(&self, payload: &[u8]) -> Result<Vec<u8>, TransformError> {
        let text = String::from_utf8_lossy(payload);
        let normalized = text
            .split('\n')
            .map(|line| {
                line.trim_end_matches('\r')
                    .split(',')
                    .map(str::trim)
                    .collect::<Vec<_>>()
                    .join(",")
            })
            .collect::<Vec<_>>()
            .join("\n");
        Ok(normalized.into_bytes())
    }
}

/// Remote transform service reached over HTTP. The batch is POSTed as `text/csv` and the response
/// body is the transformed batch.
#[derive(Debug, Clone)]
pub struct HttpTransform {
    client: reqwest::Client,
    url: String,
}

impl HttpTransform {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, TransformError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransformError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl Transform for HttpTransform {
    async fn transform(&self, payload: &[u8]) -> Result<Vec<u8>, TransformError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "text/csv")
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| {
                error!("Transform request to {} failed: {}", self.url, e);
                TransformError::Unreachable(e.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransformError::Rejected(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| TransformError::Unreachable(e.to_string()))?;
        debug!(
            "Transformed {} bytes into {} bytes",
            payload.len(),
            body.len()
        );
        Ok(body.to_vec())
    }
}
