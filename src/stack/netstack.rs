//! smoltcp stack terminating every intercepted TCP connection.
//!
//! [`NetStack`] accepts connections to any destination: before a SYN is
//! handed to smoltcp, [`NetStack::listen`] opens a socket listening on the
//! SYN's destination. Once the handshake completes the connection is
//! reported from [`NetStack::poll`] and the relay drives it through the
//! [`StackBridge`] methods. Relay events are derived from socket state by
//! [`NetStack::events`].

use super::device::TunDevice;
use crate::config::TunConfig;
use crate::error::StackError;
use crate::relay::{StackBridge, StackEvent};
use anyhow::{anyhow, Result};
use bytes::Bytes;
use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::socket::tcp;
use smoltcp::time::{Duration as SmolDuration, Instant};
use smoltcp::wire::{HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tracing::{debug, trace};

/// How long a released socket may linger before it is dropped.
const RELEASE_GRACE: SmolDuration = SmolDuration::from_secs(60);

/// How long a listening socket waits for its handshake.
const HANDSHAKE_TIMEOUT: SmolDuration = SmolDuration::from_secs(60);

const IPV6_PREFIX_LEN: u8 = 64;

/// Addressing and sizing of the stack
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Address of the stack on the virtual interface
    pub ipv4: Ipv4Addr,
    /// Prefix length of `ipv4`
    pub prefix_len: u8,
    /// Optional IPv6 address; IPv6 is ignored without it
    pub ipv6: Option<Ipv6Addr>,
    /// Device MTU
    pub mtu: usize,
    /// Receive and send buffer size of each TCP socket
    pub tcp_window: usize,
}

impl StackConfig {
    /// Derive the stack settings from the interface configuration
    pub fn from_tun(config: &TunConfig) -> Result<Self> {
        Ok(StackConfig {
            ipv4: config.ipv4().map_err(|e| anyhow!(e))?,
            prefix_len: config.prefix_len().map_err(|e| anyhow!(e))?,
            ipv6: config.ipv6().map_err(|e| anyhow!(e))?,
            mtu: config.mtu,
            tcp_window: config.tcp_window,
        })
    }
}

/// A connection whose handshake just completed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    /// Stack handle
    pub handle: SocketHandle,
    /// Address of the local peer
    pub local: SocketAddr,
    /// Address the peer connected to
    pub remote: SocketAddr,
}

type FlowKey = (SocketAddr, SocketAddr);

struct Pending {
    key: FlowKey,
    since: Instant,
}

struct Conn {
    key: FlowKey,
    paused: bool,
    send_queued: usize,
    closing: bool,
    fin_seen: bool,
    error_seen: bool,
    released_at: Option<Instant>,
}

/// The embedded TCP/IP stack.
pub struct NetStack {
    iface: Interface,
    sockets: SocketSet<'static>,
    device: TunDevice,
    window: usize,
    has_ipv6: bool,
    pending: HashMap<SocketHandle, Pending>,
    conns: HashMap<SocketHandle, Conn>,
    flows: HashSet<FlowKey>,
    now: Instant,
}

impl NetStack {
    /// Create a stack with its interface addresses and default routes
    pub fn new(config: &StackConfig, now: Instant) -> Result<Self> {
        let mut device = TunDevice::new(config.mtu);
        let mut iface = Interface::new(Config::new(HardwareAddress::Ip), &mut device, now);
        iface.set_any_ip(true);

        let ipv4 = IpCidr::new(IpAddress::Ipv4(config.ipv4), config.prefix_len);
        let ipv6 = config
            .ipv6
            .map(|addr| IpCidr::new(IpAddress::Ipv6(addr), IPV6_PREFIX_LEN));
        iface.update_ip_addrs(|addrs| {
            addrs.push(ipv4).ok();
            if let Some(ipv6) = ipv6 {
                addrs.push(ipv6).ok();
            }
        });

        iface
            .routes_mut()
            .add_default_ipv4_route(config.ipv4)
            .map_err(|_| anyhow!("route table full"))?;
        if let Some(addr) = config.ipv6 {
            iface
                .routes_mut()
                .add_default_ipv6_route(addr)
                .map_err(|_| anyhow!("route table full"))?;
        }

        debug!(
            "Stack created: ip={}/{}, ip6={:?}, mtu={}, window={}",
            config.ipv4, config.prefix_len, config.ipv6, config.mtu, config.tcp_window
        );

        Ok(NetStack {
            iface,
            sockets: SocketSet::new(Vec::new()),
            device,
            window: config.tcp_window,
            has_ipv6: config.ipv6.is_some(),
            pending: HashMap::new(),
            conns: HashMap::new(),
            flows: HashSet::new(),
            now,
        })
    }

    /// Whether an IPv6 address is configured
    pub fn has_ipv6(&self) -> bool {
        self.has_ipv6
    }

    /// Number of accepted connections not yet reaped
    pub fn connection_count(&self) -> usize {
        self.conns.len()
    }

    /// Number of sockets waiting for a handshake
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Open a listening socket for a SYN from `src` to `dst`, unless one
    /// already handles that pair
    pub fn listen(&mut self, src: SocketAddr, dst: SocketAddr) {
        if self.flows.contains(&(src, dst)) {
            trace!("{} -> {}: SYN for a known connection", src, dst);
            return;
        }

        let rx = tcp::SocketBuffer::new(vec![0u8; self.window]);
        let tx = tcp::SocketBuffer::new(vec![0u8; self.window]);
        let mut socket = tcp::Socket::new(rx, tx);
        socket.set_nagle_enabled(false);

        let endpoint = IpListenEndpoint {
            addr: Some(ip_address(dst.ip())),
            port: dst.port(),
        };
        if let Err(e) = socket.listen(endpoint) {
            debug!("{} -> {}: cannot listen: {}", src, dst, e);
            return;
        }

        let handle = self.sockets.add(socket);
        self.pending.insert(
            handle,
            Pending {
                key: (src, dst),
                since: self.now,
            },
        );
        self.flows.insert((src, dst));
        trace!("{} -> {}: listening ({:?})", src, dst, handle);
    }

    /// Queue a packet from the TUN device
    pub fn inject(&mut self, packet: Vec<u8>) {
        self.device.inject_rx(packet);
    }

    /// Queue a packet for the TUN device that bypasses smoltcp
    pub fn push_tx(&mut self, packet: Vec<u8>) {
        self.device.push_tx(packet);
    }

    /// Take every packet bound for the TUN device
    pub fn drain_tx(&mut self) -> Vec<Vec<u8>> {
        self.device.drain_tx().collect()
    }

    /// Run smoltcp, then report completed handshakes and reap dead sockets
    pub fn poll(&mut self, now: Instant) -> Vec<Accepted> {
        self.now = now;
        let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);

        let accepted = self.promote_pending(now);
        self.reap(now);
        accepted
    }

    /// Time until smoltcp wants to be polled again
    pub fn poll_delay(&mut self, now: Instant) -> Option<Duration> {
        self.iface
            .poll_delay(now, &self.sockets)
            .map(|delay| Duration::from_micros(delay.total_micros()))
    }

    /// Relay events for one connection. At most `capacity` received bytes
    /// are taken.
    pub fn events(&mut self, handle: SocketHandle, capacity: usize) -> Vec<StackEvent> {
        let mut events = Vec::new();
        let Some(conn) = self.conns.get_mut(&handle) else {
            return events;
        };
        if conn.released_at.is_some() || conn.error_seen {
            return events;
        }
        let socket = self.sockets.get_mut::<tcp::Socket<'static>>(handle);

        let queued = socket.send_queue();
        if queued < conn.send_queued {
            events.push(StackEvent::Sent(conn.send_queued - queued));
        }
        conn.send_queued = queued;

        let state = socket.state();
        if state == tcp::State::Closed && !(conn.fin_seen && conn.closing) {
            conn.error_seen = true;
            events.push(StackEvent::Error);
            return events;
        }

        if !conn.paused && capacity > 0 && socket.can_recv() {
            let mut buf = vec![0u8; capacity.min(socket.recv_queue())];
            if let Ok(n) = socket.recv_slice(&mut buf) {
                if n > 0 {
                    buf.truncate(n);
                    events.push(StackEvent::Data(Bytes::from(buf)));
                }
            }
        }

        let peer_closed = matches!(
            state,
            tcp::State::CloseWait | tcp::State::LastAck | tcp::State::Closing | tcp::State::TimeWait
        );
        if !conn.fin_seen && peer_closed && socket.recv_queue() == 0 {
            conn.fin_seen = true;
            events.push(StackEvent::Fin);
        }
        events
    }

    fn promote_pending(&mut self, now: Instant) -> Vec<Accepted> {
        let mut accepted = Vec::new();
        let mut dropped = Vec::new();

        for (&handle, pending) in &self.pending {
            let socket = self.sockets.get::<tcp::Socket<'static>>(handle);
            match socket.state() {
                tcp::State::Listen | tcp::State::SynReceived
                    if pending.since + HANDSHAKE_TIMEOUT > now => {}
                tcp::State::Listen | tcp::State::SynReceived | tcp::State::Closed => {
                    dropped.push(handle)
                }
                _ => match (socket.remote_endpoint(), socket.local_endpoint()) {
                    (Some(peer), Some(ours)) => accepted.push(Accepted {
                        handle,
                        local: socket_addr(peer),
                        remote: socket_addr(ours),
                    }),
                    _ => dropped.push(handle),
                },
            }
        }

        for handle in dropped {
            if let Some(pending) = self.pending.remove(&handle) {
                trace!("{} -> {}: handshake abandoned", pending.key.0, pending.key.1);
                self.flows.remove(&pending.key);
            }
            self.sockets.remove(handle);
        }

        for conn in &accepted {
            self.pending.remove(&conn.handle);
            let key = (conn.local, conn.remote);
            self.flows.insert(key);
            self.conns.insert(
                conn.handle,
                Conn {
                    key,
                    paused: false,
                    send_queued: 0,
                    closing: false,
                    fin_seen: false,
                    error_seen: false,
                    released_at: None,
                },
            );
            debug!("{} -> {}: handshake complete", conn.local, conn.remote);
        }
        accepted
    }

    fn reap(&mut self, now: Instant) {
        let sockets = &self.sockets;
        let dead: Vec<SocketHandle> = self
            .conns
            .iter()
            .filter_map(|(&handle, conn)| {
                let released_at = conn.released_at?;
                let state = sockets.get::<tcp::Socket<'static>>(handle).state();
                let done = matches!(state, tcp::State::Closed | tcp::State::TimeWait)
                    || released_at + RELEASE_GRACE <= now;
                done.then_some(handle)
            })
            .collect();

        for handle in dead {
            if let Some(conn) = self.conns.remove(&handle) {
                trace!("{} -> {}: socket reaped", conn.key.0, conn.key.1);
                self.flows.remove(&conn.key);
            }
            self.sockets.remove(handle);
        }
    }

    fn live_conn(&self, handle: SocketHandle) -> Option<&Conn> {
        self.conns
            .get(&handle)
            .filter(|conn| conn.released_at.is_none())
    }
}

impl StackBridge for NetStack {
    type Handle = SocketHandle;

    fn send_capacity(&self, handle: SocketHandle) -> usize {
        if self.live_conn(handle).is_none() {
            return 0;
        }
        let socket = self.sockets.get::<tcp::Socket<'static>>(handle);
        if socket.may_send() {
            socket.send_capacity() - socket.send_queue()
        } else {
            0
        }
    }

    fn send(&mut self, handle: SocketHandle, data: &[u8]) -> Result<usize, StackError> {
        let conn = self
            .conns
            .get_mut(&handle)
            .filter(|conn| conn.released_at.is_none())
            .ok_or(StackError::UnknownHandle)?;
        let socket = self.sockets.get_mut::<tcp::Socket<'static>>(handle);
        if !socket.may_send() {
            return Err(StackError::NotWritable(state_name(socket.state())));
        }
        let n = socket
            .send_slice(data)
            .map_err(|_| StackError::NotWritable(state_name(socket.state())))?;
        conn.send_queued += n;
        trace!("{:?}: queued {} bytes", handle, n);
        Ok(n)
    }

    fn set_recv_paused(&mut self, handle: SocketHandle, paused: bool) {
        if let Some(conn) = self.conns.get_mut(&handle) {
            conn.paused = paused;
        }
    }

    fn close(&mut self, handle: SocketHandle) {
        let Some(conn) = self.conns.get_mut(&handle) else {
            return;
        };
        conn.closing = true;
        let socket = self.sockets.get_mut::<tcp::Socket<'static>>(handle);
        trace!("{:?}: close (state={})", handle, state_name(socket.state()));
        socket.close();
    }

    fn abort(&mut self, handle: SocketHandle) {
        if !self.conns.contains_key(&handle) {
            return;
        }
        let socket = self.sockets.get_mut::<tcp::Socket<'static>>(handle);
        trace!("{:?}: abort (state={})", handle, state_name(socket.state()));
        socket.abort();
    }

    fn release(&mut self, handle: SocketHandle) {
        if let Some(conn) = self.conns.get_mut(&handle) {
            if conn.released_at.is_none() {
                conn.released_at = Some(self.now);
            }
        }
    }
}

impl std::fmt::Debug for NetStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetStack")
            .field("device", &self.device)
            .field("pending", &self.pending.len())
            .field("connections", &self.conns.len())
            .finish()
    }
}

fn ip_address(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => IpAddress::Ipv4(v4),
        IpAddr::V6(v6) => IpAddress::Ipv6(v6),
    }
}

fn socket_addr(endpoint: IpEndpoint) -> SocketAddr {
    let ip = match endpoint.addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(v4),
        IpAddress::Ipv6(v6) => IpAddr::V6(v6),
    };
    SocketAddr::new(ip, endpoint.port)
}

fn state_name(state: tcp::State) -> &'static str {
    match state {
        tcp::State::Closed => "Closed",
        tcp::State::Listen => "Listen",
        tcp::State::SynSent => "SynSent",
        tcp::State::SynReceived => "SynReceived",
        tcp::State::Established => "Established",
        tcp::State::FinWait1 => "FinWait1",
        tcp::State::FinWait2 => "FinWait2",
        tcp::State::CloseWait => "CloseWait",
        tcp::State::Closing => "Closing",
        tcp::State::LastAck => "LastAck",
        tcp::State::TimeWait => "TimeWait",
    }
}
