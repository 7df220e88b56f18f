// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use wavy_aggregator::{
    collector::TcpCollector,
    config::AggregatorConfig,
    config_store::JsonConfigStore,
    durable_log::FileDurableLog,
    node::{AggregatorNode, Collaborators},
    transform::{CsvNormalizer, HttpTransform, Transform},
    upstream::select_upstream,
};

#[tokio::main]
pub async fn main() {
    let config = match AggregatorConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error reading aggregator configuration: {e}");
            return;
        }
    };

    let env_filter = format!("h2=off,hyper=off,reqwest=off,rustls=off,{}", config.log_level);

    #[allow(clippy::expect_used)]
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).expect("could not parse log level in configuration"),
        )
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    #[allow(clippy::expect_used)]
    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    debug!("Logging subsystem enabled");

    let collaborators = match build_collaborators(&config).await {
        Ok(c) => c,
        Err(e) => {
            error!("Error creating aggregator collaborators on startup: {e}");
            return;
        }
    };

    let cancel_token = CancellationToken::new();
    let node_config = config.node_config();
    let node = match AggregatorNode::bind(&node_config, collaborators, cancel_token.clone()).await {
        Ok(node) => node,
        Err(e) => {
            error!("Failed to bind aggregator listeners: {e}");
            return;
        }
    };
    for addr in node.local_addrs() {
        info!("aggregator: starting to listen on {addr}");
    }

    let node_handle = tokio::spawn(node.spin());

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutdown requested, flushing buffered data");
    cancel_token.cancel();

    if let Err(e) = node_handle.await {
        error!("Aggregator node task failed: {e}");
    }
}

async fn build_collaborators(
    config: &AggregatorConfig,
) -> Result<Collaborators, Box<dyn std::error::Error>> {
    let config_store = JsonConfigStore::load(&config.device_registry).await?;
    let durable_log = FileDurableLog::new(&config.data_dir).await?;

    let transform: Arc<dyn Transform> = match &config.transform_url {
        Some(url) => {
            info!("Using transform service at {url}");
            Arc::new(HttpTransform::new(url.clone(), config.collaborator_timeout)?)
        }
        None => {
            info!("No transform service configured, using local CSV normalizer");
            Arc::new(CsvNormalizer)
        }
    };

    let upstream = select_upstream(&config.upstreams, config.collaborator_timeout)
        .await
        .ok_or("no upstream collector configured")?;

    Ok(Collaborators {
        config_store: Arc::new(config_store),
        durable_log: Arc::new(durable_log),
        transform,
        forwarder: Arc::new(TcpCollector::new(upstream)),
    })
}
