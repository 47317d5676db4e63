//! TUN device and embedded stack configuration
//!
//! Describes the virtual interface and the addresses the embedded
//! stack answers on.

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Default TUN device name
fn default_tun_name() -> String {
    "tun0".to_string()
}

/// Default device MTU
fn default_mtu() -> usize {
    1500
}

/// Default TCP receive window of intercepted connections
fn default_tcp_window() -> usize {
    65535
}

/// Virtual interface configuration
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct TunConfig {
    /// Name of the TUN device to open
    #[serde(default = "default_tun_name")]
    pub name: String,

    /// IPv4 address of the embedded stack's interface
    #[serde(default)]
    pub netif_ipaddr: String,

    /// IPv4 netmask of the embedded stack's interface
    #[serde(default)]
    pub netif_netmask: String,

    /// Optional IPv6 address of the embedded stack's interface
    #[serde(default)]
    pub netif_ip6addr: Option<String>,

    /// Device MTU
    #[serde(default = "default_mtu")]
    pub mtu: usize,

    /// Receive window of intercepted TCP connections, which also caps the
    /// buffer holding bytes on their way to the SOCKS server
    #[serde(default = "default_tcp_window")]
    pub tcp_window: usize,
}

impl Default for TunConfig {
    fn default() -> Self {
        TunConfig {
            name: default_tun_name(),
            netif_ipaddr: String::new(),
            netif_netmask: String::new(),
            netif_ip6addr: None,
            mtu: default_mtu(),
            tcp_window: default_tcp_window(),
        }
    }
}

impl TunConfig {
    /// Parse the interface IPv4 address
    pub fn ipv4(&self) -> Result<Ipv4Addr, String> {
        self.netif_ipaddr
            .parse()
            .map_err(|_| format!("Invalid netif IPv4 address: {:?}", self.netif_ipaddr))
    }

    /// Prefix length derived from the netmask
    pub fn prefix_len(&self) -> Result<u8, String> {
        let mask: Ipv4Addr = self
            .netif_netmask
            .parse()
            .map_err(|_| format!("Invalid netif netmask: {:?}", self.netif_netmask))?;
        let bits = u32::from(mask);
        let prefix = bits.leading_ones();
        if bits.checked_shl(prefix).unwrap_or(0) != 0 {
            return Err(format!("Netmask is not contiguous: {}", mask));
        }
        Ok(prefix as u8)
    }

    /// Parse the optional interface IPv6 address
    pub fn ipv6(&self) -> Result<Option<Ipv6Addr>, String> {
        match &self.netif_ip6addr {
            None => Ok(None),
            Some(s) => s
                .parse()
                .map(Some)
                .map_err(|_| format!("Invalid netif IPv6 address: {:?}", s)),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("TUN device name must not be empty".to_string());
        }
        self.ipv4()?;
        self.prefix_len()?;
        self.ipv6()?;
        if self.mtu < 576 || self.mtu > 65535 {
            return Err(format!("MTU out of range: {}", self.mtu));
        }
        if self.tcp_window == 0 {
            return Err("TCP window must be positive".to_string());
        }
        Ok(())
    }
}
