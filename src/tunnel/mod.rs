//! Tunnel module for Tunsocks
//!
//! Opens the TUN device and runs the reactor that relays its traffic
//! through the SOCKS server and the UDP gateway.

mod device;
mod event_loop;

pub use device::{open_tun, PacketIo};
pub use event_loop::Tunnel;

use crate::config::Config;
use anyhow::Result;
use tokio::sync::broadcast;

/// Open the configured TUN device and relay its traffic until shutdown
pub async fn run_tunnel(config: Config, shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
    config.validate()?;
    let device = open_tun(&config.tun)?;
    let tunnel = Tunnel::new(device, &config)?;
    tunnel.run(shutdown_rx).await
}
