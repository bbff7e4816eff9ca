//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::proxy::connector::DEFAULT_ENCRYPTED_PORTS;
use crate::proxy::socks5;

/// Default SOCKS listen port
pub const DEFAULT_LISTEN_PORT: u16 = 1080;
/// Default number of session slots
pub const DEFAULT_MAX_SESSIONS: usize = 5;
/// Default client → target buffer size
pub const DEFAULT_INBOUND_BUFFER: usize = 512;
/// Default target → client buffer size
pub const DEFAULT_OUTBOUND_BUFFER: usize = 2048;

/// Server configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    /// Listen address
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u16,
    /// Number of session slots
    pub max_sessions: usize,
    /// Client → target relay buffer capacity
    pub inbound_buffer_size: usize,
    /// Target → client relay buffer capacity
    pub outbound_buffer_size: usize,
    /// Destination ports dialed over TLS
    pub encrypted_ports: Vec<u16>,
    /// Upper bound on connect + TLS handshake
    pub dial_timeout: Duration,
    /// Delay between scheduler passes
    pub tick_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0".to_string(),
            listen_port: DEFAULT_LISTEN_PORT,
            max_sessions: DEFAULT_MAX_SESSIONS,
            inbound_buffer_size: DEFAULT_INBOUND_BUFFER,
            outbound_buffer_size: DEFAULT_OUTBOUND_BUFFER,
            encrypted_ports: DEFAULT_ENCRYPTED_PORTS.to_vec(),
            dial_timeout: Duration::from_secs(10),
            tick_interval: Duration::from_millis(5),
        }
    }
}

impl ServerConfig {
    /// Default configuration listening on the given address and port.
    pub fn new(listen_addr: impl Into<String>, listen_port: u16) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            listen_port,
            ..Self::default()
        }
    }

    /// `addr:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.listen_addr, self.listen_port)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(Error::config("listen_addr cannot be empty"));
        }
        if self.max_sessions == 0 {
            return Err(Error::config("max_sessions must be at least 1"));
        }
        if self.inbound_buffer_size < socks5::MAX_REQUEST_LEN {
            return Err(Error::config(format!(
                "inbound_buffer_size must be at least {} bytes",
                socks5::MAX_REQUEST_LEN
            )));
        }
        if self.outbound_buffer_size == 0 {
            return Err(Error::config("outbound_buffer_size cannot be zero"));
        }
        if self.dial_timeout.is_zero() {
            return Err(Error::config("dial_timeout cannot be zero"));
        }
        if self.tick_interval.is_zero() {
            return Err(Error::config("tick_interval cannot be zero"));
        }
        Ok(())
    }
}

/// Configuration file format for serialization.
#[derive(Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfigFile {
    /// Listen address
    pub listen_addr: String,
    /// Listen port
    pub listen_port: u16,
    /// Number of session slots
    pub max_sessions: usize,
    /// Client → target buffer (bytes)
    pub inbound_buffer_size: usize,
    /// Target → client buffer (bytes)
    pub outbound_buffer_size: usize,
    /// Ports dialed over TLS
    pub encrypted_ports: Vec<u16>,
    /// Dial timeout (seconds)
    pub dial_timeout_secs: u64,
    /// Scheduler pass interval (milliseconds)
    pub tick_interval_ms: u64,
}

impl Default for ServerConfigFile {
    fn default() -> Self {
        Self::from_config(&ServerConfig::default())
    }
}

impl ServerConfigFile {
    /// Parse a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("invalid config file: {}", e)))
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::config(e.to_string()))
    }

    /// Convert to runtime configuration.
    pub fn to_config(&self) -> Result<ServerConfig> {
        let config = ServerConfig {
            listen_addr: self.listen_addr.clone(),
            listen_port: self.listen_port,
            max_sessions: self.max_sessions,
            inbound_buffer_size: self.inbound_buffer_size,
            outbound_buffer_size: self.outbound_buffer_size,
            encrypted_ports: self.encrypted_ports.clone(),
            dial_timeout: Duration::from_secs(self.dial_timeout_secs),
            tick_interval: Duration::from_millis(self.tick_interval_ms),
        };
        config.validate()?;
        Ok(config)
    }

    /// Create from runtime configuration.
    pub fn from_config(config: &ServerConfig) -> Self {
        Self {
            listen_addr: config.listen_addr.clone(),
            listen_port: config.listen_port,
            max_sessions: config.max_sessions,
            inbound_buffer_size: config.inbound_buffer_size,
            outbound_buffer_size: config.outbound_buffer_size,
            encrypted_ports: config.encrypted_ports.clone(),
            dial_timeout_secs: config.dial_timeout.as_secs(),
            tick_interval_ms: config.tick_interval.as_millis() as u64,
        }
    }
}
