//! UDP gateway configuration

use crate::socks::TargetAddr;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default maximum number of concurrent UDP flows
fn default_max_connections() -> usize {
    256
}

/// Default per-flow queue depth in datagrams
fn default_connection_buffer_size() -> usize {
    8
}

/// Default flow idle timeout in seconds
fn default_idle_timeout() -> u64 {
    60
}

fn default_connect_eagerly() -> bool {
    true
}

/// UDP gateway client configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct UdpGwConfig {
    /// Gateway address, as reached through the SOCKS server
    pub remote_server_addr: String,

    /// Maximum number of concurrent UDP flows
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Per-flow queue depth in datagrams
    #[serde(default = "default_connection_buffer_size")]
    pub connection_buffer_size: usize,

    /// Tag DNS traffic (destination port 53) so the gateway resolves it
    #[serde(default)]
    pub transparent_dns: bool,

    /// Connect at startup instead of on the first datagram
    #[serde(default = "default_connect_eagerly")]
    pub connect_eagerly: bool,

    /// Seconds without traffic before an empty flow is retired (0 disables)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
}

impl UdpGwConfig {
    /// Create a configuration for the given gateway with default limits
    pub fn new(remote_server_addr: impl Into<String>) -> Self {
        UdpGwConfig {
            remote_server_addr: remote_server_addr.into(),
            max_connections: default_max_connections(),
            connection_buffer_size: default_connection_buffer_size(),
            transparent_dns: false,
            connect_eagerly: default_connect_eagerly(),
            idle_timeout: default_idle_timeout(),
        }
    }

    /// Parse the gateway address
    pub fn remote_target(&self) -> Result<TargetAddr, String> {
        self.remote_server_addr.parse()
    }

    /// Flow idle timeout, if enabled
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout > 0).then(|| Duration::from_secs(self.idle_timeout))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.remote_target()?;
        if self.max_connections == 0 || self.max_connections > 65536 {
            return Err(format!(
                "udpgw max_connections must be within 1..=65536, got {}",
                self.max_connections
            ));
        }
        if self.connection_buffer_size == 0 {
            return Err("udpgw connection_buffer_size must be positive".to_string());
        }
        Ok(())
    }
}
