//! Packet I/O of the virtual interface

use crate::config::TunConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::io;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::info;

/// Source and sink of raw IP packets.
#[async_trait]
pub trait PacketIo: Send {
    /// Read one packet into `buf`, returning its length
    async fn recv_packet(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet
    async fn send_packet(&mut self, packet: &[u8]) -> io::Result<()>;
}

#[async_trait]
impl PacketIo for tun::AsyncDevice {
    async fn recv_packet(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.read(buf).await
    }

    async fn send_packet(&mut self, packet: &[u8]) -> io::Result<()> {
        self.write(packet).await.map(|_| ())
    }
}

/// Open the TUN device named in the configuration and bring it up
pub fn open_tun(config: &TunConfig) -> Result<tun::AsyncDevice> {
    let mut tun_config = tun::Configuration::default();
    tun_config.name(&config.name).mtu(config.mtu as i32).up();

    #[cfg(target_os = "linux")]
    tun_config.platform(|platform| {
        platform.packet_information(false);
    });

    let device = tun::create_as_async(&tun_config)
        .with_context(|| format!("Failed to open TUN device {}", config.name))?;
    info!("Opened TUN device {} (mtu {})", config.name, config.mtu);
    Ok(device)
}
