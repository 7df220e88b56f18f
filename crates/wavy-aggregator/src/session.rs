// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Protocol state machine for one device connection.
//!
//! A session starts `Unauthenticated`, becomes `Active` after an admitted `HELLO` and ends
//! `Closed`. Any malformed or out-of-place message is answered with `DENIED` and ends the session.
//! Leaving `Active` by any path (`QUIT`, I/O error, idle timeout, shutdown) runs the same close
//! sequence: best-effort flush, status `deactivated`, unregister.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadHalf,
    WriteHalf,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::buffer::BufferPool;
use crate::config_store::{ConfigStore, DeviceStatus};
use crate::dispatcher::{BatchDispatcher, DispatchOutcome};
use crate::errors::SessionError;
use crate::flush_policy::should_flush;
use crate::protocol::{DeviceId, DeviceMessage, Reply};
use crate::registry::SessionRegistry;

// Longest line accepted from a device, terminator included.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Handles shared by every session of a node.
pub struct SessionContext {
    pub registry: Arc<SessionRegistry>,
    pub config_store: Arc<dyn ConfigStore>,
    pub buffers: Arc<BufferPool>,
    pub dispatcher: Arc<BatchDispatcher>,
    /// Address returned to devices in the handshake acknowledgment.
    pub advertise_address: String,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unauthenticated,
    Active,
    Closed,
}

pub struct DeviceSession<S> {
    ctx: Arc<SessionContext>,
    reader: BufReader<ReadHalf<S>>,
    writer: WriteHalf<S>,
    peer: String,
    state: SessionState,
    // set once, by an admitted HELLO
    identity: Option<DeviceId>,
    cancel_token: CancellationToken,
}

impl<S> DeviceSession<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    pub fn new(
        stream: S,
        peer: impl Into<String>,
        ctx: Arc<SessionContext>,
        cancel_token: CancellationToken,
    ) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        DeviceSession {
            ctx,
            reader: BufReader::new(reader),
            writer,
            peer: peer.into(),
            state: SessionState::Unauthenticated,
            identity: None,
            cancel_token,
        }
    }

    /// Drives the session to completion. The connection is released and the device deregistered
    /// on every exit path.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = self.serve().await;
        match &result {
            Ok(()) => debug!("Session from {} ended with QUIT", self.peer),
            Err(e @ (SessionError::ProtocolViolation(_) | SessionError::AdmissionDenied(_))) => {
                warn!("Closing session from {}: {}", self.peer, e)
            }
            Err(e) => info!("Closing session from {}: {}", self.peer, e),
        }
        self.close().await;
        result
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    async fn serve(&mut self) -> Result<(), SessionError> {
        loop {
            let line = self.next_line().await?;
            let message = match DeviceMessage::decode(&line) {
                Ok(message) => message,
                Err(e) => return self.deny(SessionError::ProtocolViolation(e.to_string())).await,
            };

            match (self.state, message) {
                (SessionState::Unauthenticated, DeviceMessage::Hello(device)) => {
                    self.handshake(device).await?
                }
                (SessionState::Unauthenticated, _) => {
                    return self
                        .deny(SessionError::ProtocolViolation(
                            "message before HELLO".to_string(),
                        ))
                        .await
                }
                (SessionState::Active, DeviceMessage::StatusRequest(device)) => {
                    self.report_status(device).await?
                }
                (SessionState::Active, DeviceMessage::Data { device, payload }) => {
                    self.ingest(device, payload).await?
                }
                (SessionState::Active, DeviceMessage::Quit) => {
                    self.reply(Reply::Bye).await?;
                    return Ok(());
                }
                (SessionState::Active, DeviceMessage::Hello(_)) => {
                    return self
                        .deny(SessionError::ProtocolViolation(
                            "repeated HELLO".to_string(),
                        ))
                        .await
                }
                (SessionState::Closed, _) => return Ok(()),
            }
        }
    }

    async fn next_line(&mut self) -> Result<String, SessionError> {
        let idle_timeout = self.ctx.idle_timeout;
        let mut line = Vec::new();
        let mut limited = (&mut self.reader).take(MAX_LINE_BYTES as u64);
        let read = tokio::select! {
            _ = self.cancel_token.cancelled() => return Err(SessionError::Shutdown),
            read = tokio::time::timeout(
                idle_timeout,
                limited.read_until(b'\n', &mut line),
            ) => read.map_err(|_| SessionError::IdleTimeout(idle_timeout))??,
        };

        if read == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "device disconnected without QUIT",
            )
            .into());
        }
        if line.last() != Some(&b'\n') && line.len() >= MAX_LINE_BYTES {
            return self
                .deny(SessionError::ProtocolViolation(format!(
                    "line longer than {MAX_LINE_BYTES} bytes"
                )))
                .await;
        }
        match String::from_utf8(line) {
            Ok(line) => Ok(line),
            Err(_) => self
                .deny(SessionError::ProtocolViolation(
                    "line is not valid UTF-8".to_string(),
                ))
                .await,
        }
    }

    async fn handshake(&mut self, device: DeviceId) -> Result<(), SessionError> {
        if self.ctx.registry.is_registered(&device)
            || !self.ctx.config_store.is_configured(&device).await
            || !self.ctx.registry.try_register(&device)
        {
            return self
                .deny(SessionError::AdmissionDenied(device.to_string()))
                .await;
        }

        if let Err(e) = self
            .ctx
            .config_store
            .set_status(&device, DeviceStatus::Operating)
            .await
        {
            warn!("Failed to mark {} as operating: {}", device, e);
        }
        info!("Device {} connected from {}", device, self.peer);
        self.identity = Some(device);
        self.state = SessionState::Active;
        self.reply(Reply::Welcome(self.ctx.advertise_address.clone()))
            .await
    }

    async fn report_status(&mut self, device: DeviceId) -> Result<(), SessionError> {
        let reply = match self.ctx.config_store.get_status(&device).await {
            Some(status) => Reply::CurrentStatus {
                device,
                status: status.to_string(),
            },
            None => Reply::Denied,
        };
        self.reply(reply).await
    }

    async fn ingest(&mut self, device: DeviceId, payload: String) -> Result<(), SessionError> {
        if self.identity.as_ref() != Some(&device) {
            return self
                .deny(SessionError::ProtocolViolation(format!(
                    "data for {device} on another device's session"
                )))
                .await;
        }

        let buffered = self.ctx.buffers.append(&device, &payload).await;
        if let Err(e) = self.ctx.config_store.touch_last_sync(&device).await {
            warn!("Failed to update last sync of {}: {}", device, e);
        }

        let volume = self.ctx.config_store.get_volume(&device).await;
        if should_flush(buffered, volume) {
            // failures are logged by the dispatcher and retried on the next append
            let _ = self.ctx.dispatcher.dispatch(&device).await;
        }
        self.reply(Reply::Ack).await
    }

    async fn close(&mut self) {
        self.state = SessionState::Closed;
        if let Some(device) = self.identity.take() {
            match self.ctx.dispatcher.dispatch(&device).await {
                Ok(DispatchOutcome::Forwarded { lines }) => {
                    info!("Disconnect flush forwarded {} lines for {}", lines, device)
                }
                Ok(DispatchOutcome::Empty) => {}
                Err(e) => warn!(
                    "Disconnect flush for {} failed, data kept in durable mirror: {}",
                    device, e
                ),
            }
            if let Err(e) = self
                .ctx
                .config_store
                .set_status(&device, DeviceStatus::Deactivated)
                .await
            {
                warn!("Failed to mark {} as deactivated: {}", device, e);
            }
            self.ctx.registry.unregister(&device);
            info!("Device {} disconnected", device);
        }
        let _ = self.writer.shutdown().await;
    }

    // Replies DENIED, then ends the session with `error`.
    async fn deny<T>(&mut self, error: SessionError) -> Result<T, SessionError> {
        self.reply(Reply::Denied).await?;
        Err(error)
    }

    async fn reply(&mut self, reply: Reply) -> Result<(), SessionError> {
        let mut frame = reply.to_string();
        frame.push('\n');
        self.writer.write_all(frame.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }
}
