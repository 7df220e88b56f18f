// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::errors::ConfigError;
use crate::node::NodeConfig;
use crate::util::parse_list;

const DEFAULT_LISTEN_HOST: &str = "0.0.0.0";
const DEFAULT_LISTEN_PORT: u16 = 5001;
const DEFAULT_UPSTREAM: &str = "127.0.0.1:6000";
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_COLLABORATOR_TIMEOUT_SECS: u64 = 5;

/// Configuration for an aggregator node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorConfig {
    /// Host every listener binds to
    pub listen_host: String,
    /// One device listener per port
    pub listen_ports: Vec<u16>,
    /// Address returned to devices on handshake; first listener address when unset
    pub advertise_address: Option<String>,
    /// Candidate collectors, probed once at startup
    pub upstreams: Vec<String>,
    /// HTTP transform service; the local CSV normalizer is used when unset
    pub transform_url: Option<String>,
    /// JSON device registry
    pub device_registry: PathBuf,
    /// Directory holding the per-device durable mirrors
    pub data_dir: PathBuf,
    pub idle_timeout: Duration,
    /// Bound on every transform, forward and probe call
    pub collaborator_timeout: Duration,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            listen_host: DEFAULT_LISTEN_HOST.to_string(),
            listen_ports: vec![DEFAULT_LISTEN_PORT],
            advertise_address: None,
            upstreams: vec![DEFAULT_UPSTREAM.to_string()],
            transform_url: None,
            device_registry: PathBuf::from("devices.json"),
            data_dir: PathBuf::from("data"),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            collaborator_timeout: Duration::from_secs(DEFAULT_COLLABORATOR_TIMEOUT_SECS),
            log_level: "info".to_string(),
        }
    }
}

impl AggregatorConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup, falling back to defaults for missing
    /// keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let listen_ports = match lookup("WAVY_LISTEN_PORTS") {
            Some(ports) => parse_list(&ports)
                .iter()
                .map(|port| {
                    port.parse::<u16>().map_err(|_| {
                        ConfigError::InvalidConfig(format!("Invalid listen port '{port}'"))
                    })
                })
                .collect::<Result<Vec<_>, _>>()?,
            None => defaults.listen_ports,
        };
        let upstreams = lookup("WAVY_UPSTREAMS")
            .map(|value| parse_list(&value))
            .unwrap_or(defaults.upstreams);

        let config = Self {
            listen_host: lookup("WAVY_LISTEN_HOST").unwrap_or(defaults.listen_host),
            listen_ports,
            advertise_address: lookup("WAVY_ADVERTISE_ADDRESS").filter(|a| !a.trim().is_empty()),
            upstreams,
            transform_url: lookup("WAVY_TRANSFORM_URL").filter(|u| !u.trim().is_empty()),
            device_registry: lookup("WAVY_DEVICE_REGISTRY")
                .map(PathBuf::from)
                .unwrap_or(defaults.device_registry),
            data_dir: lookup("WAVY_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            idle_timeout: secs(&lookup, "WAVY_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            collaborator_timeout: secs(
                &lookup,
                "WAVY_COLLABORATOR_TIMEOUT_SECS",
                defaults.collaborator_timeout,
            )?,
            log_level: lookup("WAVY_LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or(defaults.log_level),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.listen_host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "WAVY_LISTEN_HOST cannot be empty".to_string(),
            ));
        }

        if self.listen_ports.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "At least one listen port is required".to_string(),
            ));
        }
        if self.listen_ports.contains(&0) {
            return Err(ConfigError::InvalidConfig(
                "Listen ports must be greater than 0".to_string(),
            ));
        }

        if self.upstreams.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "At least one upstream collector is required".to_string(),
            ));
        }

        if self.idle_timeout.is_zero() || self.collaborator_timeout.is_zero() {
            return Err(ConfigError::InvalidConfig(
                "Timeouts must be greater than 0".to_string(),
            ));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            host: self.listen_host.clone(),
            ports: self.listen_ports.clone(),
            advertise_address: self.advertise_address.clone(),
            idle_timeout: self.idle_timeout,
            collaborator_timeout: self.collaborator_timeout,
        }
    }
}

fn secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    match lookup(key) {
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidConfig(format!("Invalid {key} '{value}'"))),
        None => Ok(default),
    }
}
