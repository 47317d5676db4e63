//! Command-line overrides
//!
//! The classic tun2socks flags. Any flag given replaces the value from
//! the configuration file; without a file the flags alone make up the
//! configuration.

use super::{Config, UdpGwConfig};
use crate::error::TunsocksError;
use clap::Args;
use std::path::PathBuf;

/// Configuration flags
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// TUN device name
    #[arg(long)]
    pub tundev: Option<String>,

    /// TUN device MTU
    #[arg(long)]
    pub tunmtu: Option<usize>,

    /// IPv4 address of the virtual router
    #[arg(long)]
    pub netif_ipaddr: Option<String>,

    /// Netmask of the virtual router
    #[arg(long)]
    pub netif_netmask: Option<String>,

    /// IPv6 address of the virtual router
    #[arg(long)]
    pub netif_ip6addr: Option<String>,

    /// SOCKS5 server address
    #[arg(long)]
    pub socks_server_addr: Option<String>,

    /// SOCKS5 username
    #[arg(long)]
    pub username: Option<String>,

    /// SOCKS5 password
    #[arg(long)]
    pub password: Option<String>,

    /// File containing the SOCKS5 password
    #[arg(long)]
    pub password_file: Option<PathBuf>,

    /// Append the connection's source address to the username
    #[arg(long)]
    pub append_source_to_username: bool,

    /// UDP gateway address, reached through the SOCKS server
    #[arg(long)]
    pub udpgw_remote_server_addr: Option<String>,

    /// Maximum number of UDP flows
    #[arg(long)]
    pub udpgw_max_connections: Option<usize>,

    /// Datagrams buffered per UDP flow
    #[arg(long)]
    pub udpgw_connection_buffer_size: Option<usize>,

    /// Let the gateway resolve DNS queries
    #[arg(long)]
    pub udpgw_transparent_dns: bool,
}

impl ConfigArgs {
    /// Overlay the flags onto `config`
    pub fn apply(&self, config: &mut Config) -> Result<(), TunsocksError> {
        if let Some(name) = &self.tundev {
            config.tun.name = name.clone();
        }
        if let Some(mtu) = self.tunmtu {
            config.tun.mtu = mtu;
        }
        if let Some(addr) = &self.netif_ipaddr {
            config.tun.netif_ipaddr = addr.clone();
        }
        if let Some(mask) = &self.netif_netmask {
            config.tun.netif_netmask = mask.clone();
        }
        if let Some(addr) = &self.netif_ip6addr {
            config.tun.netif_ip6addr = Some(addr.clone());
        }

        if let Some(addr) = &self.socks_server_addr {
            config.socks.server_addr = addr.clone();
        }
        if let Some(username) = &self.username {
            config.socks.username = Some(username.clone());
        }
        if let Some(password) = &self.password {
            config.socks.password = Some(password.clone());
            config.socks.password_file = None;
        }
        if let Some(path) = &self.password_file {
            config.socks.password_file = Some(path.clone());
            config.socks.password = None;
        }
        if self.append_source_to_username {
            config.socks.append_source_to_username = true;
        }

        if let Some(addr) = &self.udpgw_remote_server_addr {
            match &mut config.udpgw {
                Some(udpgw) => udpgw.remote_server_addr = addr.clone(),
                None => config.udpgw = Some(UdpGwConfig::new(addr.clone())),
            }
        }

        let tunes_udpgw = self.udpgw_max_connections.is_some()
            || self.udpgw_connection_buffer_size.is_some()
            || self.udpgw_transparent_dns;
        match &mut config.udpgw {
            Some(udpgw) => {
                if let Some(max) = self.udpgw_max_connections {
                    udpgw.max_connections = max;
                }
                if let Some(depth) = self.udpgw_connection_buffer_size {
                    udpgw.connection_buffer_size = depth;
                }
                if self.udpgw_transparent_dns {
                    udpgw.transparent_dns = true;
                }
            }
            None if tunes_udpgw => {
                return Err(TunsocksError::Config(
                    "udpgw options require --udpgw-remote-server-addr".to_string(),
                ))
            }
            None => {}
        }
        Ok(())
    }
}
