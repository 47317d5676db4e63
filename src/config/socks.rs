//! SOCKS upstream configuration
//!
//! Defines where intercepted TCP connections are proxied to and how the
//! client authenticates.

use crate::socks::{Credentials, TargetAddr};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Default maximum number of concurrent TCP relays
fn default_max_connections() -> usize {
    1024
}

/// Default SOCKS connect timeout in seconds
fn default_connect_timeout() -> u64 {
    10
}

fn default_nodelay() -> bool {
    true
}

/// Default keepalive seconds
fn default_keepalive_secs() -> u64 {
    20
}

/// Default keepalive interval
fn default_keepalive_interval() -> u64 {
    8
}

/// SOCKS5 upstream configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SocksConfig {
    /// SOCKS5 server address (e.g., "127.0.0.1:1080")
    #[serde(default)]
    pub server_addr: String,

    /// Username for SOCKS5 auth
    #[serde(default)]
    pub username: Option<String>,

    /// Password for SOCKS5 auth
    #[serde(default)]
    pub password: Option<String>,

    /// File holding the password for SOCKS5 auth
    #[serde(default)]
    pub password_file: Option<PathBuf>,

    /// Append the originating source address to the username
    #[serde(default)]
    pub append_source_to_username: bool,

    /// Ask the SOCKS server for this destination instead of the intercepted one
    #[serde(default)]
    pub override_dest_addr: Option<String>,

    /// Maximum number of concurrent TCP relays
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Timeout for reaching the SOCKS server and completing the handshake, in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,

    /// Socket options for connections to the SOCKS server
    #[serde(default)]
    pub tcp: TcpConfig,
}

impl Default for SocksConfig {
    fn default() -> Self {
        SocksConfig {
            server_addr: String::new(),
            username: None,
            password: None,
            password_file: None,
            append_source_to_username: false,
            override_dest_addr: None,
            max_connections: default_max_connections(),
            connect_timeout: default_connect_timeout(),
            tcp: TcpConfig::default(),
        }
    }
}

/// TCP socket options for outbound connections
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TcpConfig {
    /// Enable TCP_NODELAY
    #[serde(default = "default_nodelay")]
    pub nodelay: bool,

    /// TCP keepalive timeout in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// TCP keepalive interval in seconds
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval: u64,
}

impl Default for TcpConfig {
    fn default() -> Self {
        TcpConfig {
            nodelay: default_nodelay(),
            keepalive_secs: default_keepalive_secs(),
            keepalive_interval: default_keepalive_interval(),
        }
    }
}

impl SocksConfig {
    /// Parse the SOCKS server address
    pub fn server_socket_addr(&self) -> Result<SocketAddr, String> {
        self.server_addr
            .parse()
            .map_err(|_| format!("Invalid SOCKS server address: {:?}", self.server_addr))
    }

    /// Parse the override destination, if any
    pub fn override_target(&self) -> Result<Option<TargetAddr>, String> {
        self.override_dest_addr
            .as_deref()
            .map(str::parse)
            .transpose()
    }

    /// Build the credentials, reading the password file when configured
    pub fn credentials(&self) -> Result<Option<Credentials>> {
        let Some(username) = &self.username else {
            return Ok(None);
        };

        let password = match (&self.password, &self.password_file) {
            (Some(password), _) => password.clone(),
            (None, Some(path)) => read_password_file(path)?,
            (None, None) => String::new(),
        };

        Ok(Some(Credentials::new(username.clone(), password)))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.server_socket_addr()?;
        self.override_target()?;

        match (&self.username, &self.password, &self.password_file) {
            (Some(_), None, None) => {
                return Err("Username given but neither password nor password file".to_string())
            }
            (Some(_), Some(_), Some(_)) => {
                return Err("Password and password file are mutually exclusive".to_string())
            }
            (None, Some(_), _) | (None, _, Some(_)) => {
                return Err("Password given without a username".to_string())
            }
            _ => {}
        }

        if self.append_source_to_username && self.username.is_none() {
            return Err("Appending the source address requires a username".to_string());
        }
        if self.max_connections == 0 {
            return Err("SOCKS max_connections must be positive".to_string());
        }
        Ok(())
    }
}

/// Read a password file, dropping the trailing line break
fn read_password_file(path: &PathBuf) -> Result<String> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read password file: {:?}", path))?;
    Ok(content.trim_end_matches(['\r', '\n']).to_string())
}
