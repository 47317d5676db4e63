//! SOCKS5 type definitions
//!
//! Defines the destination and credential types handed to the SOCKS server.

use async_socks5::{AddrKind, Auth};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

/// Target address for SOCKS5 requests
///
/// Represents the destination address in a SOCKS5 CONNECT request.
/// Can be an IP address (v4 or v6) or a domain name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// IP address with port
    Ip(SocketAddr),
    /// Domain name with port
    Domain(String, u16),
}

impl TargetAddr {
    /// Create a new TargetAddr from an IPv4 address and port
    pub fn ipv4(ip: Ipv4Addr, port: u16) -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V4(ip), port))
    }

    /// Create a new TargetAddr from an IPv6 address and port
    pub fn ipv6(ip: Ipv6Addr, port: u16) -> Self {
        TargetAddr::Ip(SocketAddr::new(IpAddr::V6(ip), port))
    }

    /// Get the port number
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::Ip(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    /// Address form understood by the SOCKS5 client handshake
    pub fn to_addr_kind(&self) -> AddrKind {
        match self {
            TargetAddr::Ip(addr) => AddrKind::Ip(*addr),
            TargetAddr::Domain(domain, port) => AddrKind::Domain(domain.clone(), *port),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        TargetAddr::Ip(addr)
    }
}

impl FromStr for TargetAddr {
    type Err = String;

    /// Parse `ip:port`, `[ipv6]:port` or `host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(TargetAddr::Ip(addr));
        }

        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("Missing port in address: {}", s))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| format!("Invalid port in address: {}", s))?;

        if host.is_empty() || host.len() > 255 || host.contains(':') {
            return Err(format!("Invalid host in address: {}", s));
        }

        Ok(TargetAddr::Domain(host.to_string(), port))
    }
}

/// Username/password pair for SOCKS5 authentication
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Username
    pub username: String,
    /// Password
    pub password: String,
}

impl Credentials {
    /// Create a new credential pair
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }

    /// Credentials whose username carries the originating source address,
    /// in the form `user@10.0.0.2`
    pub fn with_source(&self, source: IpAddr) -> Self {
        Credentials {
            username: format!("{}@{}", self.username, source),
            password: self.password.clone(),
        }
    }

    /// Convert into the handshake's authentication form
    pub fn to_auth(&self) -> Auth {
        Auth::new(self.username.clone(), self.password.clone())
    }
}

// Keep passwords out of logs.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
