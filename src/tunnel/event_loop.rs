//! The reactor wiring the TUN device, the stack, the relays and the
//! UDP gateway client.
//!
//! [`Tunnel::run`] waits for one event at a time (a packet from the
//! device, a SOCKS session completion, a datagram from the gateway, the
//! stack timer or shutdown), handles it, then runs the packet pipeline:
//! poll the stack, hand new connections and socket events to the relays,
//! and write whatever the stack produced back to the device.

use super::device::PacketIo;
use crate::config::Config;
use crate::relay::{
    RelayConfig, RelayId, RelayManager, SocksEvent, StackBridge, SOCKS_RECV_BUF_SIZE,
};
use crate::socks::{SocksDialer, TokioConnector};
use crate::stack::{build_udp, inspect, Accepted, Inspected, NetStack, StackConfig};
use crate::transport::SocketOpts;
use crate::udpgw::{Datagram, GatewayConnector, SocksGatewayConnector, UdpGwHandle};
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use smoltcp::iface::SocketHandle;
use smoltcp::time::Instant as SmolInstant;
use std::collections::HashMap;
use std::future::pending;
use std::io;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, trace, warn};

/// Upper bound on the stack timer.
const MAX_POLL_DELAY: Duration = Duration::from_millis(250);

/// Poll/dispatch rounds per pipeline run.
const MAX_PIPELINE_ROUNDS: usize = 8;

/// Datagrams from the gateway waiting for the reactor.
const UDP_DELIVERY_QUEUE: usize = 1024;

/// Extra room in the device read buffer beyond the MTU.
const READ_SLACK: usize = 64;

type Relays = RelayManager<SocketHandle, TokioConnector>;

/// The running tunnel.
pub struct Tunnel<D> {
    device: D,
    stack: NetStack,
    relays: Relays,
    socks_rx: mpsc::UnboundedReceiver<(RelayId, SocksEvent)>,
    owners: HashMap<SocketHandle, RelayId>,
    udpgw: Option<UdpGwHandle>,
    udp_rx: Option<mpsc::Receiver<Datagram>>,
    mtu: usize,
}

impl<D: PacketIo> Tunnel<D> {
    /// Build the tunnel, reaching the UDP gateway (if configured) through
    /// the SOCKS server
    pub fn new(device: D, config: &Config) -> Result<Self> {
        let gateway = match &config.udpgw {
            Some(udpgw) => Some(SocksGatewayConnector::new(
                socks_dialer(config)?,
                udpgw.remote_target().map_err(|e| anyhow!(e))?,
                config.socks.credentials()?,
            )),
            None => None,
        };
        Self::with_gateway(device, config, gateway)
    }

    /// Build the tunnel with a custom gateway connector. Must be called
    /// inside a tokio runtime.
    pub fn with_gateway<G: GatewayConnector>(
        device: D,
        config: &Config,
        gateway: Option<G>,
    ) -> Result<Self> {
        config.validate()?;

        let stack_config = StackConfig::from_tun(&config.tun)?;
        let stack = NetStack::new(&stack_config, SmolInstant::now())
            .context("Failed to create TCP/IP stack")?;

        let relay_config = RelayConfig {
            max_relays: config.socks.max_connections,
            window: config.tun.tcp_window,
            recv_chunk: SOCKS_RECV_BUF_SIZE,
            credentials: config.socks.credentials()?,
            append_source_to_username: config.socks.append_source_to_username,
            override_dest: config.socks.override_target().map_err(|e| anyhow!(e))?,
        };
        let (socks_tx, socks_rx) = mpsc::unbounded_channel();
        let connector = TokioConnector::new(socks_dialer(config)?, socks_tx);
        let relays = RelayManager::new(relay_config, connector);

        let (udpgw, udp_rx) = match (&config.udpgw, gateway) {
            (Some(udpgw_config), Some(gateway)) => {
                let (tx, rx) = mpsc::channel(UDP_DELIVERY_QUEUE);
                info!("UDP gateway: {}", udpgw_config.remote_server_addr);
                (Some(UdpGwHandle::spawn(udpgw_config, gateway, tx)), Some(rx))
            }
            _ => (None, None),
        };

        Ok(Tunnel {
            device,
            stack,
            relays,
            socks_rx,
            owners: HashMap::new(),
            udpgw,
            udp_rx,
            mtu: config.tun.mtu,
        })
    }

    /// Number of live relays
    pub fn relay_count(&self) -> usize {
        self.relays.len()
    }

    /// Run until shutdown or a device failure
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<bool>) -> Result<()> {
        let mut buf = vec![0u8; self.mtu + READ_SLACK];
        let mut result = Ok(());

        let mut backlog = false;

        info!("Tunnel running");

        loop {
            let delay = timer_delay(self.stack.poll_delay(SmolInstant::now()), backlog);

            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping tunnel");
                    break;
                }

                read = self.device.recv_packet(&mut buf) => match read {
                    Ok(n) => self.handle_packet(&buf[..n]),
                    Err(e) if is_transient(&e) => continue,
                    Err(e) => {
                        error!("TUN read failed: {}", e);
                        result = Err(e).context("TUN device read failed");
                        break;
                    }
                },

                Some((id, event)) = self.socks_rx.recv() => {
                    self.relays.on_socks_event(id, event, &mut self.stack);
                    while let Ok((id, event)) = self.socks_rx.try_recv() {
                        self.relays.on_socks_event(id, event, &mut self.stack);
                    }
                }

                Some(datagram) = recv_datagram(&mut self.udp_rx) => {
                    self.deliver_udp(datagram);
                }

                _ = tokio::time::sleep(delay) => {}
            }

            backlog = self.run_pipeline().await;
        }

        self.close().await;
        result
    }

    fn handle_packet(&mut self, packet: &[u8]) {
        let has_ipv6 = self.stack.has_ipv6();
        match inspect(packet) {
            Inspected::Udp { src, dst, payload } => {
                if src.is_ipv6() && !has_ipv6 {
                    trace!("{} -> {}: IPv6 UDP ignored", src, dst);
                } else if let Some(udpgw) = &self.udpgw {
                    udpgw.send(src, dst, Bytes::copy_from_slice(payload));
                } else {
                    self.stack.inject(packet.to_vec());
                }
            }
            Inspected::TcpSyn { src, dst } => {
                if src.is_ipv6() && !has_ipv6 {
                    trace!("{} -> {}: IPv6 SYN ignored", src, dst);
                    return;
                }
                self.stack.listen(src, dst);
                self.stack.inject(packet.to_vec());
            }
            Inspected::OtherV6 if !has_ipv6 => trace!("IPv6 packet ignored"),
            Inspected::Invalid => trace!("Unparsable packet dropped ({} bytes)", packet.len()),
            Inspected::OtherV4 | Inspected::OtherV6 => self.stack.inject(packet.to_vec()),
        }
    }

    fn deliver_udp(&mut self, datagram: Datagram) {
        let Some(packet) = build_udp(datagram.remote, datagram.local, &datagram.payload) else {
            debug!(
                "{} -> {}: address families differ, datagram dropped",
                datagram.remote, datagram.local
            );
            return;
        };
        if packet.len() > self.mtu {
            debug!(
                "{} -> {}: {} byte packet exceeds MTU, dropped",
                datagram.remote,
                datagram.local,
                packet.len()
            );
            return;
        }
        self.stack.push_tx(packet);
    }

    /// Poll and dispatch until the stack goes quiet or the round limit is
    /// hit. Returns true when the limit cut it short.
    async fn run_pipeline(&mut self) -> bool {
        let mut backlog = true;
        for _ in 0..MAX_PIPELINE_ROUNDS {
            let accepted = self.stack.poll(SmolInstant::now());
            let accepted_any = !accepted.is_empty();
            for conn in accepted {
                self.accept(conn);
            }
            if !self.dispatch_stack_events() && !accepted_any {
                backlog = false;
                break;
            }
        }
        self.flush_device().await;
        backlog
    }

    fn accept(&mut self, conn: Accepted) {
        match self.relays.on_accept(conn.local, conn.remote, conn.handle) {
            Ok(id) => {
                self.owners.insert(conn.handle, id);
            }
            Err(reason) => {
                debug!("{} -> {}: reset ({})", conn.local, conn.remote, reason);
                self.stack.abort(conn.handle);
                self.stack.release(conn.handle);
            }
        }
    }

    /// Hand every socket's events to its relay; returns whether any
    /// event was delivered
    fn dispatch_stack_events(&mut self) -> bool {
        let mut delivered = false;
        let owners: Vec<(SocketHandle, RelayId)> =
            self.owners.iter().map(|(h, id)| (*h, *id)).collect();

        for (handle, id) in owners {
            if self.relays.contains(id) {
                let capacity = self.relays.recv_capacity(id);
                for event in self.stack.events(handle, capacity) {
                    delivered = true;
                    self.relays.on_stack_event(id, event, &mut self.stack);
                }
            }
            if !self.relays.contains(id) {
                self.owners.remove(&handle);
            }
        }
        delivered
    }

    async fn flush_device(&mut self) {
        for packet in self.stack.drain_tx() {
            if let Err(e) = self.device.send_packet(&packet).await {
                warn!("TUN write failed: {}", e);
            }
        }
    }

    async fn close(&mut self) {
        self.relays.abort_all(&mut self.stack);
        self.owners.clear();
        let _ = self.stack.poll(SmolInstant::now());
        self.flush_device().await;

        if let Some(udpgw) = self.udpgw.take() {
            udpgw.shutdown().await;
        }
        info!("Tunnel stopped");
    }
}

impl<D> std::fmt::Debug for Tunnel<D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("stack", &self.stack)
            .field("relays", &self.relays)
            .field("udpgw", &self.udpgw.is_some())
            .finish()
    }
}

fn socks_dialer(config: &Config) -> Result<SocksDialer> {
    let server = config
        .socks
        .server_socket_addr()
        .map_err(|e| anyhow!(e))?;
    Ok(SocksDialer::new(server)
        .with_socket_opts(SocketOpts::from_tcp_config(&config.socks.tcp))
        .with_connect_timeout(Duration::from_secs(config.socks.connect_timeout)))
}

/// How long to wait for an event before polling the stack again. A
/// pipeline cut short by the round limit resumes right away.
fn timer_delay(poll_delay: Option<Duration>, backlog: bool) -> Duration {
    if backlog {
        return Duration::ZERO;
    }
    poll_delay.map_or(MAX_POLL_DELAY, |delay| delay.min(MAX_POLL_DELAY))
}

async fn recv_datagram(rx: &mut Option<mpsc::Receiver<Datagram>>) -> Option<Datagram> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}
