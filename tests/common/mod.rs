//! Test utilities and mocks for Tunsocks
//!
//! This module provides common test utilities used across integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tunsocks::error::StackError;
use tunsocks::relay::StackBridge;

/// Create a test TCP listener on an available port
pub async fn create_test_listener() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}

/// What the mock SOCKS server saw on one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequestSeen {
    /// Username/password, when the client authenticated
    pub auth: Option<(String, String)>,
    /// Requested destination, rendered as `host:port`
    pub target: String,
}

/// A minimal SOCKS5 server answering CONNECT and echoing the stream back.
pub struct MockSocksServer {
    /// Address the server listens on
    pub addr: SocketAddr,
    /// One entry per completed handshake
    pub requests: mpsc::UnboundedReceiver<SocksRequestSeen>,
}

impl MockSocksServer {
    /// Start a server; with `password` set, username/password auth is
    /// required and the password must match
    pub async fn start(password: Option<&str>) -> Self {
        let (listener, addr) = create_test_listener().await;
        let (tx, requests) = mpsc::unbounded_channel();
        let password = password.map(str::to_string);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let tx = tx.clone();
                let password = password.clone();
                tokio::spawn(async move {
                    let _ = serve(stream, password, tx).await;
                });
            }
        });

        MockSocksServer { addr, requests }
    }
}

async fn serve(
    mut stream: TcpStream,
    password: Option<String>,
    tx: mpsc::UnboundedSender<SocksRequestSeen>,
) -> std::io::Result<()> {
    let auth = socks5_handshake(&mut stream, password.as_deref()).await?;
    let target = read_connect(&mut stream).await?;
    stream
        .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await?;
    let _ = tx.send(SocksRequestSeen { auth, target });

    // Echo until the client half-closes, then close our side too.
    let (mut reader, mut writer) = stream.split();
    tokio::io::copy(&mut reader, &mut writer).await?;
    writer.shutdown().await
}

async fn socks5_handshake<S>(
    stream: &mut S,
    password: Option<&str>,
) -> std::io::Result<Option<(String, String)>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    let Some(expected) = password else {
        stream.write_all(&[0x05, 0x00]).await?;
        return Ok(None);
    };

    if !methods.contains(&0x02) {
        stream.write_all(&[0x05, 0xff]).await?;
        return Err(std::io::ErrorKind::PermissionDenied.into());
    }
    stream.write_all(&[0x05, 0x02]).await?;

    let mut ver_len = [0u8; 2];
    stream.read_exact(&mut ver_len).await?;
    let mut user = vec![0u8; ver_len[1] as usize];
    stream.read_exact(&mut user).await?;
    let mut plen = [0u8; 1];
    stream.read_exact(&mut plen).await?;
    let mut pass = vec![0u8; plen[0] as usize];
    stream.read_exact(&mut pass).await?;

    let user = String::from_utf8_lossy(&user).into_owned();
    let pass = String::from_utf8_lossy(&pass).into_owned();
    if pass != expected {
        stream.write_all(&[0x01, 0x01]).await?;
        return Err(std::io::ErrorKind::PermissionDenied.into());
    }
    stream.write_all(&[0x01, 0x00]).await?;
    Ok(Some((user, pass)))
}

async fn read_connect<S>(stream: &mut S) -> std::io::Result<String>
where
    S: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    let host = match head[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            IpAddr::V4(Ipv4Addr::from(ip)).to_string()
        }
        0x04 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            format!("[{}]", Ipv6Addr::from(ip))
        }
        0x03 => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8_lossy(&name).into_owned()
        }
        _ => return Err(std::io::ErrorKind::InvalidData.into()),
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(format!("{}:{}", host, u16::from_be_bytes(port)))
}

/// Observable state of one connection in [`MockStack`]
#[derive(Debug, Clone, Default)]
pub struct MockConn {
    /// Bytes queued toward the local peer
    pub delivered: Vec<u8>,
    /// Remaining send window; unlimited when `None`
    pub capacity: Option<usize>,
    /// Whether receive is paused
    pub paused: bool,
    /// FIN requested
    pub closed: bool,
    /// Reset requested
    pub aborted: bool,
    /// Handed back by the relay
    pub released: bool,
}

/// In-memory stand-in for the embedded stack
#[derive(Debug, Default)]
pub struct MockStack {
    conns: HashMap<u32, MockConn>,
}

impl MockStack {
    /// Snapshot of one connection
    pub fn conn(&self, handle: u32) -> MockConn {
        self.conns.get(&handle).cloned().unwrap_or_default()
    }

    /// Limit the send window of a connection
    pub fn set_capacity(&mut self, handle: u32, capacity: usize) {
        self.conns.entry(handle).or_default().capacity = Some(capacity);
    }

    /// The local peer acknowledged everything; reopen the window
    pub fn ack_all(&mut self, handle: u32, capacity: usize) {
        self.set_capacity(handle, capacity);
    }
}

impl StackBridge for MockStack {
    type Handle = u32;

    fn send_capacity(&self, handle: u32) -> usize {
        self.conns
            .get(&handle)
            .and_then(|c| c.capacity)
            .unwrap_or(usize::MAX)
    }

    fn send(&mut self, handle: u32, data: &[u8]) -> Result<usize, StackError> {
        let conn = self.conns.entry(handle).or_default();
        let n = data.len().min(conn.capacity.unwrap_or(usize::MAX));
        conn.delivered.extend_from_slice(&data[..n]);
        if let Some(capacity) = conn.capacity.as_mut() {
            *capacity -= n;
        }
        Ok(n)
    }

    fn set_recv_paused(&mut self, handle: u32, paused: bool) {
        self.conns.entry(handle).or_default().paused = paused;
    }

    fn close(&mut self, handle: u32) {
        self.conns.entry(handle).or_default().closed = true;
    }

    fn abort(&mut self, handle: u32) {
        self.conns.entry(handle).or_default().aborted = true;
    }

    fn release(&mut self, handle: u32) {
        self.conns.entry(handle).or_default().released = true;
    }
}

/// Test configuration builder
pub struct TestConfigBuilder {
    socks_addr: String,
    username: Option<String>,
    password: Option<String>,
    udpgw_addr: Option<String>,
}

impl Default for TestConfigBuilder {
    fn default() -> Self {
        TestConfigBuilder {
            socks_addr: "127.0.0.1:1080".to_string(),
            username: None,
            password: None,
            udpgw_addr: None,
        }
    }
}

impl TestConfigBuilder {
    /// Create a new test config builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set SOCKS server address
    pub fn socks_addr(mut self, addr: &str) -> Self {
        self.socks_addr = addr.to_string();
        self
    }

    /// Set SOCKS credentials
    pub fn credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }

    /// Enable the UDP gateway
    pub fn udpgw(mut self, addr: &str) -> Self {
        self.udpgw_addr = Some(addr.to_string());
        self
    }

    /// Build the configuration
    pub fn build(self) -> tunsocks::config::Config {
        let mut config = tunsocks::config::Config::default();
        config.tun.netif_ipaddr = "10.0.0.2".to_string();
        config.tun.netif_netmask = "255.255.255.0".to_string();
        config.socks.server_addr = self.socks_addr;
        config.socks.username = self.username;
        config.socks.password = self.password;
        config.udpgw = self.udpgw_addr.map(tunsocks::config::UdpGwConfig::new);
        config
    }
}

/// Read from a channel with a deadline so a broken test fails instead of hanging
pub async fn recv_timeout<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("channel closed")
}

/// Shorthand for static payloads
pub fn bytes(data: &'static [u8]) -> Bytes {
    Bytes::from_static(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_test_listener() {
        let (listener, addr) = create_test_listener().await;
        assert!(addr.port() > 0);
        drop(listener);
    }

    #[test]
    fn test_config_builder() {
        let config = TestConfigBuilder::new()
            .socks_addr("192.168.1.1:1080")
            .credentials("alice", "secret")
            .udpgw("127.0.0.1:7300")
            .build();

        assert_eq!(config.socks.server_addr, "192.168.1.1:1080");
        assert_eq!(config.socks.username.as_deref(), Some("alice"));
        assert!(config.udpgw.is_some());
        assert!(config.validate().is_ok());
    }
}
