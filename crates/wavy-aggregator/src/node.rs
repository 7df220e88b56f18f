// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Aggregator node: TCP listeners that accept WAVY device connections.
//!
//! Each configured port gets its own accept loop, and each accepted connection its own
//! [`DeviceSession`] task. All listeners share one [`SessionContext`], so a device cannot hold two
//! live sessions even across ports. Cancelling the node's token stops every accept loop, ends the
//! live sessions (each running its disconnect flush) and finally flushes whatever is still
//! buffered.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer::BufferPool;
use crate::collector::Forwarder;
use crate::config_store::ConfigStore;
use crate::dispatcher::BatchDispatcher;
use crate::durable_log::DurableLog;
use crate::registry::SessionRegistry;
use crate::session::{DeviceSession, SessionContext};
use crate::transform::Transform;

// Pause after a failed accept so a persistent error (e.g. fd exhaustion) does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for the aggregator listeners
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Host to bind every listener to (e.g., "0.0.0.0")
    pub host: String,
    /// One listener per port. Port 0 picks an ephemeral port.
    pub ports: Vec<u16>,
    /// Address sent to devices in `ACK:<address>`; defaults to the first listener's address
    pub advertise_address: Option<String>,
    /// Sessions silent for longer than this are closed
    pub idle_timeout: Duration,
    /// Bound on each transform and forward call
    pub collaborator_timeout: Duration,
}

/// External services the node depends on.
pub struct Collaborators {
    pub config_store: Arc<dyn ConfigStore>,
    pub durable_log: Arc<dyn DurableLog>,
    pub transform: Arc<dyn Transform>,
    pub forwarder: Arc<dyn Forwarder>,
}

pub struct AggregatorNode {
    cancel_token: CancellationToken,
    ctx: Arc<SessionContext>,
    listeners: Vec<TcpListener>,
}

impl AggregatorNode {
    /// Binds every configured port. Fails if any port cannot be bound.
    pub async fn bind(
        config: &NodeConfig,
        collaborators: Collaborators,
        cancel_token: CancellationToken,
    ) -> std::io::Result<AggregatorNode> {
        let mut listeners = Vec::with_capacity(config.ports.len());
        for port in &config.ports {
            let addr = format!("{}:{}", config.host, port);
            let listener = TcpListener::bind(&addr).await?;
            debug!("Bound aggregator listener on {}", listener.local_addr()?);
            listeners.push(listener);
        }

        let advertise_address = match (&config.advertise_address, listeners.first()) {
            (Some(address), _) => address.clone(),
            (None, Some(listener)) => listener.local_addr()?.to_string(),
            (None, None) => format!("{}:0", config.host),
        };

        let buffers = Arc::new(BufferPool::new(collaborators.durable_log));
        let dispatcher = Arc::new(BatchDispatcher::new(
            Arc::clone(&buffers),
            collaborators.transform,
            collaborators.forwarder,
            config.collaborator_timeout,
        ));
        let ctx = Arc::new(SessionContext {
            registry: Arc::new(SessionRegistry::new()),
            config_store: collaborators.config_store,
            buffers,
            dispatcher,
            advertise_address,
            idle_timeout: config.idle_timeout,
        });

        Ok(AggregatorNode {
            cancel_token,
            ctx,
            listeners,
        })
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.listeners
            .iter()
            .filter_map(|listener| listener.local_addr().ok())
            .collect()
    }

    pub fn context(&self) -> Arc<SessionContext> {
        Arc::clone(&self.ctx)
    }

    /// Runs every accept loop until the cancel token fires, then flushes all buffers.
    pub async fn spin(self) {
        let mut accept_loops = JoinSet::new();
        for listener in self.listeners {
            accept_loops.spawn(accept_loop(
                listener,
                Arc::clone(&self.ctx),
                self.cancel_token.clone(),
            ));
        }
        info!(
            "Aggregator listening on {} port(s), advertising {}",
            accept_loops.len(),
            self.ctx.advertise_address
        );

        while let Some(result) = accept_loops.join_next().await {
            if let Err(e) = result {
                error!("Accept loop panicked: {}", e);
            }
        }

        let failed = self.ctx.dispatcher.flush_all().await;
        if failed > 0 {
            warn!(
                "Shutdown flush failed for {} device(s); data kept in durable mirror",
                failed
            );
        }
        info!("Aggregator stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: Arc<SessionContext>,
    cancel_token: CancellationToken,
) {
    let local = listener
        .local_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_default();
    let mut sessions = JoinSet::new();

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!("Accepted connection from {} on {}", peer, local);
                    let session = DeviceSession::new(
                        stream,
                        peer.to_string(),
                        Arc::clone(&ctx),
                        cancel_token.child_token(),
                    );
                    sessions.spawn(session.run());
                }
                // one failed accept must not stop the listener
                Err(e) => accept_failed(&local, e).await,
            },
            Some(finished) = sessions.join_next(), if !sessions.is_empty() => {
                if let Err(e) = finished {
                    error!("Session task on {} panicked: {}", local, e);
                }
            }
        }
    }

    debug!("Listener {} stopping, waiting for {} session(s)", local, sessions.len());
    while let Some(finished) = sessions.join_next().await {
        if let Err(e) = finished {
            error!("Session task on {} panicked: {}", local, e);
        }
    }
}

async fn accept_failed(local: &str, e: std::io::Error) {
    error!(
        "Failed to accept connection on {}, retrying in {:?}: {}",
        local, ACCEPT_ERROR_BACKOFF, e
    );
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}
