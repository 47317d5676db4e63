//! Sans-IO UDP gateway client
//!
//! [`UdpGwClient`] owns the flow table, the connection state and both
//! timers. It never touches a socket: the caller feeds it datagrams,
//! frames and connection outcomes, asks it what to write next, and wakes
//! it at [`UdpGwClient::poll_timeout`].

use super::flows::{DropReason, FlowKey, FlowTable};
use super::proto::{self, FLAG_DNS, FLAG_REBIND};
use crate::config::UdpGwConfig;
use bytes::Bytes;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

/// Delay before retrying a failed or lost gateway connection
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

/// Send-side silence after which a keepalive is written
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_millis(10000);

const DNS_PORT: u16 = 53;

/// A datagram crossing the gateway, in either direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Local application address
    pub local: SocketAddr,
    /// Remote peer address
    pub remote: SocketAddr,
    /// Payload
    pub payload: Bytes,
}

/// Result of [`UdpGwClient::send`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Queued on the flow with this connection id
    Queued(u16),
    /// Dropped
    Dropped(DropReason),
}

/// Gateway connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// No connection and none in progress
    Disconnected,
    /// Connect in progress
    Connecting,
    /// Frames may be written
    Connected,
}

/// Protocol state of the gateway client.
#[derive(Debug)]
pub struct UdpGwClient {
    flows: FlowTable,
    transparent_dns: bool,
    idle_timeout: Option<Duration>,

    state: ConnState,
    want_connect: bool,
    reconnect_at: Option<Instant>,
    keepalive_at: Option<Instant>,
    keepalive_due: bool,
}

impl UdpGwClient {
    /// Create a client from its configuration
    pub fn new(config: &UdpGwConfig) -> Self {
        UdpGwClient {
            flows: FlowTable::new(config.max_connections, config.connection_buffer_size),
            transparent_dns: config.transparent_dns,
            idle_timeout: config.idle_timeout(),
            state: ConnState::Disconnected,
            want_connect: config.connect_eagerly,
            reconnect_at: None,
            keepalive_at: None,
            keepalive_due: false,
        }
    }

    /// Connection state
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Live flow table
    pub fn flows(&self) -> &FlowTable {
        &self.flows
    }

    /// Queue a datagram for `(local, remote)`; never blocks
    pub fn send(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        payload: Bytes,
        now: Instant,
    ) -> SendOutcome {
        let key = FlowKey::new(local, remote);
        if payload.len() > proto::max_payload(&remote) {
            debug!("udpgw {}: dropping {} byte datagram, too large", key, payload.len());
            return SendOutcome::Dropped(DropReason::TooLarge);
        }

        let len = payload.len();
        let known = self.flows.conid(&key).is_some();
        match self.flows.enqueue(key, payload, now) {
            Ok(conid) => {
                if !known {
                    debug!("udpgw [{}] {}: new flow", conid, key);
                }
                trace!("udpgw [{}] {}: queued {} bytes", conid, key, len);
                if self.state == ConnState::Disconnected && self.reconnect_at.is_none() {
                    self.want_connect = true;
                }
                SendOutcome::Queued(conid)
            }
            Err(reason) => {
                debug!("udpgw {}: dropping datagram: {}", key, reason);
                SendOutcome::Dropped(reason)
            }
        }
    }

    /// Whether a connect should start now; moves to `Connecting` if so
    pub fn poll_connect(&mut self, now: Instant) -> bool {
        if self.state != ConnState::Disconnected {
            return false;
        }
        let retry_due = self.reconnect_at.map_or(false, |at| at <= now);
        if !(self.want_connect || retry_due) {
            return false;
        }
        self.want_connect = false;
        self.reconnect_at = None;
        self.state = ConnState::Connecting;
        true
    }

    /// The gateway connection is established
    pub fn on_connected(&mut self, now: Instant) {
        info!("udpgw connected, {} flows", self.flows.len());
        self.state = ConnState::Connected;
        self.keepalive_at = Some(now + KEEPALIVE_INTERVAL);
        self.keepalive_due = false;
        self.flows.mark_all_rebind();
        self.flows.begin_flush();
    }

    /// The connect attempt failed
    pub fn on_connect_failed(&mut self, now: Instant) {
        warn!(
            "udpgw connect failed, retrying in {} ms",
            RECONNECT_INTERVAL.as_millis()
        );
        self.reset(now);
    }

    /// The established connection broke; queues are kept
    pub fn on_connection_lost(&mut self, now: Instant) {
        warn!(
            "udpgw connection lost, reconnecting in {} ms",
            RECONNECT_INTERVAL.as_millis()
        );
        self.reset(now);
    }

    /// Whether [`poll_transmit`](Self::poll_transmit) has a frame
    pub fn has_transmit(&self) -> bool {
        self.state == ConnState::Connected && (self.keepalive_due || self.flows.has_queued())
    }

    /// Next frame to write, length prefix included
    pub fn poll_transmit(&mut self, now: Instant) -> Option<Bytes> {
        if self.state != ConnState::Connected {
            return None;
        }

        if self.keepalive_due {
            self.keepalive_due = false;
            self.keepalive_at = Some(now + KEEPALIVE_INTERVAL);
            trace!("udpgw keepalive");
            return Some(proto::encode_keepalive());
        }

        while let Some(out) = self.flows.pop_next() {
            let mut flags = 0;
            if out.rebind {
                flags |= FLAG_REBIND;
            }
            if self.transparent_dns && out.key.remote.port() == DNS_PORT {
                flags |= FLAG_DNS;
            }

            match proto::encode_data(flags, out.conid, out.key.remote, &out.payload) {
                Ok(frame) => {
                    self.flows.touch(out.conid, now);
                    self.keepalive_at = Some(now + KEEPALIVE_INTERVAL);
                    trace!(
                        "udpgw [{}] {}: sending {} bytes",
                        out.conid,
                        out.key,
                        out.payload.len()
                    );
                    return Some(frame);
                }
                Err(e) => debug!("udpgw [{}] {}: {}", out.conid, out.key, e),
            }
        }
        None
    }

    /// Fire every timer due at `now`
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.state == ConnState::Connected {
            if let Some(at) = self.keepalive_at {
                if at <= now {
                    self.keepalive_due = true;
                    self.keepalive_at = None;
                }
            }
        }

        if let Some(timeout) = self.idle_timeout {
            for (conid, key) in self.flows.retire_idle(now, timeout) {
                debug!("udpgw [{}] {}: idle flow retired", conid, key);
            }
        }
    }

    /// Earliest instant [`handle_timeout`](Self::handle_timeout) or
    /// [`poll_connect`](Self::poll_connect) has work
    pub fn poll_timeout(&self) -> Option<Instant> {
        let conn_timer = match self.state {
            ConnState::Disconnected => self.reconnect_at,
            ConnState::Connecting => None,
            ConnState::Connected => self.keepalive_at,
        };
        let idle = self
            .idle_timeout
            .and_then(|timeout| self.flows.next_idle_deadline(timeout));

        match (conn_timer, idle) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Handle a frame body read from the gateway; returns the datagram to
    /// deliver locally, if any
    pub fn on_frame(&mut self, body: Bytes, now: Instant) -> Option<Datagram> {
        let frame = match proto::decode(body) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("udpgw: dropping malformed frame: {}", e);
                return None;
            }
        };

        if frame.is_keepalive() {
            trace!("udpgw keepalive from gateway");
            return None;
        }

        if frame.is_error() {
            match self.flows.retire(frame.conid) {
                Some(key) => info!("udpgw [{}] {}: closed by gateway", frame.conid, key),
                None => debug!("udpgw [{}]: close for unknown flow", frame.conid),
            }
            return None;
        }

        let Some(key) = self.flows.key(frame.conid) else {
            debug!("udpgw [{}]: datagram for unknown flow dropped", frame.conid);
            return None;
        };
        self.flows.touch(frame.conid, now);
        trace!(
            "udpgw [{}] {}: received {} bytes",
            frame.conid,
            key,
            frame.payload.len()
        );

        Some(Datagram {
            local: key.local,
            remote: key.remote,
            payload: frame.payload,
        })
    }

    /// Drop every flow and forget the connection
    pub fn shutdown(&mut self) {
        info!("udpgw shutting down, dropping {} flows", self.flows.len());
        self.flows.clear();
        self.state = ConnState::Disconnected;
        self.want_connect = false;
        self.reconnect_at = None;
        self.keepalive_at = None;
        self.keepalive_due = false;
    }

    fn reset(&mut self, now: Instant) {
        self.state = ConnState::Disconnected;
        self.want_connect = false;
        self.reconnect_at = Some(now + RECONNECT_INTERVAL);
        self.keepalive_at = None;
        self.keepalive_due = false;
    }
}
