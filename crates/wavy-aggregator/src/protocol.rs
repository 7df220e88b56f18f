// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Line-oriented, colon-delimited wire protocol spoken by WAVY devices.
//!
//! Raw lines are decoded once into a [`DeviceMessage`]; the session state machine never looks at
//! strings. Replies are rendered through [`Reply`]'s `Display` impl.

use std::fmt;

use derive_more::{Display, Into};

use crate::errors::DecodeError;

pub const HELLO: &str = "HELLO";
pub const STATUS_REQUEST: &str = "STATUS_REQUEST";
pub const DATA_CSV: &str = "DATA_CSV";
pub const QUIT: &str = "QUIT";

pub const ACK: &str = "ACK";
pub const DENIED: &str = "DENIED";
pub const CURRENT_STATUS: &str = "CURRENT_STATUS";
pub const BYE: &str = "BYE";

/// Request token for the collector busy-ness probe.
pub const QUEUE_LENGTH: &str = "QUEUE_LENGTH";

/// Opaque device identity. Never empty and never contains the field separator or whitespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display, Into)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: &str) -> Result<Self, DecodeError> {
        if id.is_empty() || id.chars().any(|c| c == ':' || c.is_whitespace() || c.is_control()) {
            return Err(DecodeError::InvalidDeviceId(id.to_string()));
        }
        Ok(Self(id.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A decoded device→aggregator message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    Hello(DeviceId),
    StatusRequest(DeviceId),
    Data { device: DeviceId, payload: String },
    Quit,
}

impl DeviceMessage {
    /// Decodes one line. Trailing `\r`/`\n` are ignored; the CSV payload of `DATA_CSV` may itself
    /// contain `:` since the line is split into at most three fields.
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Err(DecodeError::Empty);
        }

        let mut fields = line.splitn(3, ':');
        let command = fields.next().unwrap_or_default();
        match command {
            HELLO => Ok(Self::Hello(single_id(HELLO, line)?)),
            STATUS_REQUEST => Ok(Self::StatusRequest(single_id(STATUS_REQUEST, line)?)),
            DATA_CSV => {
                let id = fields.next().ok_or(DecodeError::MissingField {
                    command: DATA_CSV,
                    field: "device id",
                })?;
                let device = DeviceId::new(id)?;
                let payload = match fields.next() {
                    Some(payload) if !payload.is_empty() => payload.to_string(),
                    _ => {
                        return Err(DecodeError::MissingField {
                            command: DATA_CSV,
                            field: "payload",
                        })
                    }
                };
                Ok(Self::Data { device, payload })
            }
            QUIT if line == QUIT => Ok(Self::Quit),
            other => Err(DecodeError::UnknownCommand(other.to_string())),
        }
    }
}

// `HELLO:<id>` and `STATUS_REQUEST:<id>` carry exactly one field after the command.
fn single_id(command: &'static str, line: &str) -> Result<DeviceId, DecodeError> {
    match line.split_once(':') {
        Some((_, id)) if !id.is_empty() => DeviceId::new(id),
        _ => Err(DecodeError::MissingField {
            command,
            field: "device id",
        }),
    }
}

/// Aggregator→device replies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Handshake acknowledgment carrying the aggregator's advertised address.
    Welcome(String),
    Ack,
    Denied,
    CurrentStatus { device: DeviceId, status: String },
    /// Terminal acknowledgment of `QUIT`.
    Bye,
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Welcome(address) => write!(f, "{ACK}:{address}"),
            Self::Ack => f.write_str(ACK),
            Self::Denied => f.write_str(DENIED),
            Self::CurrentStatus { device, status } => {
                write!(f, "{CURRENT_STATUS}:{device}:{status}")
            }
            Self::Bye => f.write_str(BYE),
        }
    }
}

/// Frame sent to the central collector for one finished batch. The payload bytes are copied
/// as-is.
pub fn encode_forward(device: &DeviceId, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(DATA_CSV.len() + device.as_str().len() + payload.len() + 2);
    frame.extend_from_slice(DATA_CSV.as_bytes());
    frame.push(b':');
    frame.extend_from_slice(device.as_str().as_bytes());
    frame.push(b':');
    frame.extend_from_slice(payload);
    frame
}

/// True when a collector response confirms receipt.
pub fn is_collector_ack(response: &str) -> bool {
    response.trim_start().starts_with(ACK)
}
