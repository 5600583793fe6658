//! Proxy configuration.
//!
//! Process settings come from the environment. Routes live in a separate
//! file, see [`crate::route_file`].

use std::{net::SocketAddr, path::PathBuf, time::Duration};

use anyhow::{Context, Result};

use crate::proxy::{ForwarderConfig, DEFAULT_FORWARD_TIMEOUT, DEFAULT_MAX_BODY_BYTES};

/// Proxy configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP listener binds to.
    pub listen_addr: SocketAddr,

    /// Route file (YAML, or JSON by extension).
    pub routes_file: PathBuf,

    /// Forward deadline for rules without their own timeout.
    pub forward_timeout: Duration,

    /// Largest request body buffered for forwarding.
    pub max_body_bytes: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let listen_addr: SocketAddr = var("HOSTGATE_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse()
            .context("HOSTGATE_LISTEN_ADDR must be a socket address (example: 0.0.0.0:8080).")?;

        let routes_file = var("HOSTGATE_ROUTES_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("routes.yaml"));

        let forward_timeout = var("HOSTGATE_FORWARD_TIMEOUT_MS")
            .map(|v| v.parse())
            .transpose()
            .context("HOSTGATE_FORWARD_TIMEOUT_MS must be an integer (milliseconds).")?
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_FORWARD_TIMEOUT);

        let max_body_bytes: usize = var("HOSTGATE_MAX_BODY_BYTES")
            .map(|v| v.parse())
            .transpose()
            .context("HOSTGATE_MAX_BODY_BYTES must be an integer (bytes).")?
            .unwrap_or(DEFAULT_MAX_BODY_BYTES);

        let log_level = var("HOSTGATE_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            routes_file,
            forward_timeout,
            max_body_bytes,
            log_level,
        })
    }

    /// Forwarder settings derived from this configuration.
    pub fn forwarder_config(&self) -> ForwarderConfig {
        ForwarderConfig {
            default_timeout: self.forward_timeout,
            max_body_bytes: self.max_body_bytes,
        }
    }
}
