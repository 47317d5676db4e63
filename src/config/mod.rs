//! Configuration module for Tunsocks
//!
//! This module provides configuration types and parsing. A configuration
//! can come from a TOML file, from command-line flags, or from both with
//! flags taking precedence.

mod cli;
mod socks;
mod tun;
mod udpgw;

pub use cli::ConfigArgs;
pub use socks::{SocksConfig, TcpConfig};
pub use tun::TunConfig;
pub use udpgw::UdpGwConfig;

use crate::error::TunsocksError;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Root configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct Config {
    /// Virtual interface and embedded stack
    #[serde(default)]
    pub tun: TunConfig,

    /// SOCKS5 upstream
    #[serde(default)]
    pub socks: SocksConfig,

    /// UDP gateway; UDP forwarding is disabled without it
    #[serde(default)]
    pub udpgw: Option<UdpGwConfig>,
}

impl Config {
    /// Validate every section
    pub fn validate(&self) -> Result<(), TunsocksError> {
        self.tun.validate().map_err(TunsocksError::Config)?;
        self.socks.validate().map_err(TunsocksError::Config)?;
        if let Some(udpgw) = &self.udpgw {
            udpgw.validate().map_err(TunsocksError::Config)?;
        }
        Ok(())
    }
}

/// Load configuration from a TOML file
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

    parse_config(&content)
}

/// Parse configuration from a TOML string
pub fn parse_config(content: &str) -> Result<Config> {
    toml::from_str(content).with_context(|| "Failed to parse configuration")
}
