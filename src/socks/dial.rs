//! Outbound connections through the SOCKS5 server.

use super::types::{Credentials, TargetAddr};
use crate::error::{Socks5Error, TunsocksError, TunsocksResult};
use crate::transport::SocketOpts;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Opens TCP streams to targets via the configured SOCKS5 server.
#[derive(Debug, Clone)]
pub struct SocksDialer {
    server: SocketAddr,
    socket_opts: SocketOpts,
    connect_timeout: Duration,
}

impl SocksDialer {
    /// Create a dialer for the given SOCKS server
    pub fn new(server: SocketAddr) -> Self {
        SocksDialer {
            server,
            socket_opts: SocketOpts::default(),
            connect_timeout: Duration::from_secs(10),
        }
    }

    /// Set socket options
    pub fn with_socket_opts(mut self, opts: SocketOpts) -> Self {
        self.socket_opts = opts;
        self
    }

    /// Set the timeout covering TCP connect and handshake
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// SOCKS server address
    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// Connect to the SOCKS server and CONNECT to `target`
    pub async fn connect(
        &self,
        target: &TargetAddr,
        credentials: Option<&Credentials>,
    ) -> TunsocksResult<TcpStream> {
        let handshake = async {
            let mut stream = TcpStream::connect(self.server).await.map_err(|e| {
                Socks5Error::Unreachable(format!("{}: {}", self.server, e))
            })?;

            if let Err(e) = self.socket_opts.apply(&stream) {
                warn!("Failed to apply socket options: {}", e);
            }

            async_socks5::connect(
                &mut stream,
                target.to_addr_kind(),
                credentials.map(Credentials::to_auth),
            )
            .await
            .map_err(|e| Socks5Error::Handshake(e.to_string()))?;

            Ok::<_, TunsocksError>(stream)
        };

        let stream = tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                TunsocksError::Timeout(format!("SOCKS connect to {} via {}", target, self.server))
            })??;

        debug!("SOCKS connection established to {} via {}", target, self.server);
        Ok(stream)
    }
}
