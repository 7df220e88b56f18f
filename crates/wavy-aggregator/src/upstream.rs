// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tracing::{info, warn};

use crate::collector::TcpCollector;
use crate::errors::ProbeError;

/// Probes every candidate collector and returns the one reporting the shortest queue.
///
/// Ties go to the earliest candidate. A candidate whose probe fails or times out counts as
/// maximally busy, so a choice is still made when every probe fails. Returns `None` only for an
/// empty candidate list.
pub async fn select_upstream(candidates: &[String], timeout: Duration) -> Option<String> {
    let mut loads = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let load = match probe(candidate, timeout).await {
            Ok(load) => load,
            Err(e) => {
                warn!("Upstream probe of {} failed: {}", candidate, e);
                u64::MAX
            }
        };
        loads.push(load);
    }

    let (index, load) = loads
        .iter()
        .enumerate()
        .min_by_key(|(_, load)| **load)?;
    let chosen = candidates[index].clone();
    info!("Selected upstream collector {} (queue length {})", chosen, load);
    Some(chosen)
}

async fn probe(candidate: &str, timeout: Duration) -> Result<u64, ProbeError> {
    tokio::time::timeout(timeout, TcpCollector::new(candidate).queue_length())
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}
