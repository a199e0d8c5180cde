// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use faultline_protocol::{DEFAULT_PORT, TcpServerConfig};

use crate::registry::DEFAULT_PICK_WINDOW;

/// Faultline coordinator configuration
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Listener settings (bind address, backlog, session limit)
    pub server: TcpServerConfig,
    /// Run identifier minions must present
    pub build_id: u64,
    /// Dispatches a job may lose before it is marked failed (0 = retry forever)
    pub max_attempts: u32,
    /// Depth of the in-flight registry's diagnostic pick window
    pub pick_window: usize,
    /// Progress report period (zero disables reporting)
    pub progress_interval: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            server: TcpServerConfig::default(),
            build_id: default_build_id(),
            max_attempts: 0,
            pick_window: DEFAULT_PICK_WINDOW,
            progress_interval: Duration::from_millis(500),
        }
    }
}

/// Start time of this coordinator in unix seconds.
fn default_build_id() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

impl CoordinatorConfig {
    /// Load configuration from environment variables.
    ///
    /// Optional (with defaults):
    /// - `FAULTLINE_BIND_ADDR`: Listen IP address (default: 0.0.0.0)
    /// - `FAULTLINE_PORT`: Listen port (default: 1111)
    /// - `FAULTLINE_BUILD_ID`: Run identifier (default: coordinator start time, unix seconds)
    /// - `FAULTLINE_MAX_ATTEMPTS`: Lost dispatches before a job fails, 0 for unlimited (default: 0)
    /// - `FAULTLINE_PICK_WINDOW`: In-flight pick window (default: 50000)
    /// - `FAULTLINE_PROGRESS_INTERVAL_MS`: Progress report period, 0 to disable (default: 500)
    ///
    /// Listener tuning (`FAULTLINE_BACKLOG`, `FAULTLINE_MAX_SESSIONS`,
    /// `FAULTLINE_TCP_NODELAY`) is read by [`TcpServerConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_ip: IpAddr = std::env::var("FAULTLINE_BIND_ADDR")
            .unwrap_or_else(|_| Ipv4Addr::UNSPECIFIED.to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("FAULTLINE_BIND_ADDR", "must be an IP address"))?;

        let port: u16 = std::env::var("FAULTLINE_PORT")
            .unwrap_or_else(|_| DEFAULT_PORT.to_string())
            .parse()
            .map_err(|_| ConfigError::Invalid("FAULTLINE_PORT", "must be a valid port number"))?;

        let build_id: u64 = match std::env::var("FAULTLINE_BUILD_ID") {
            Ok(value) => value.parse().map_err(|_| {
                ConfigError::Invalid("FAULTLINE_BUILD_ID", "must be a non-negative integer")
            })?,
            Err(_) => default_build_id(),
        };

        let max_attempts: u32 = std::env::var("FAULTLINE_MAX_ATTEMPTS")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("FAULTLINE_MAX_ATTEMPTS", "must be a non-negative integer")
            })?;

        let pick_window = std::env::var("FAULTLINE_PICK_WINDOW")
            .unwrap_or_else(|_| DEFAULT_PICK_WINDOW.to_string())
            .parse::<usize>()
            .ok()
            .filter(|w| *w > 0)
            .ok_or(ConfigError::Invalid(
                "FAULTLINE_PICK_WINDOW",
                "must be a positive integer",
            ))?;

        let progress_ms: u64 = std::env::var("FAULTLINE_PROGRESS_INTERVAL_MS")
            .unwrap_or_else(|_| "500".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "FAULTLINE_PROGRESS_INTERVAL_MS",
                    "must be a non-negative integer",
                )
            })?;

        let mut server = TcpServerConfig::from_env();
        server.bind_addr = SocketAddr::new(bind_ip, port);

        Ok(Self {
            server,
            build_id,
            max_attempts,
            pick_window,
            progress_interval: Duration::from_millis(progress_ms),
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
