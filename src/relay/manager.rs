//! The set of live TCP relays and the entry points the reactor calls.
//!
//! Relays live in a generation-checked [`Arena`]. Every entry point looks
//! its relay up by [`RelayId`] first, so an event for a relay that was
//! destroyed earlier (a late SOCKS completion, a stack notification
//! collected before an abort) is dropped instead of touching a reused slot.

use super::arena::{Arena, RelayId};
use super::bridge::{SocksConnector, SocksEvent, SocksRequest, StackBridge, StackEvent};
use super::tcp::TcpRelay;
use crate::error::RelayError;
use crate::socks::{Credentials, TargetAddr};
use bytes::Bytes;
use std::fmt::Debug;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Default size of one receive from the SOCKS session.
pub const SOCKS_RECV_BUF_SIZE: usize = 8192;

/// Relay policy and sizing.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Maximum number of live relays
    pub max_relays: usize,
    /// Capacity of the buffer toward SOCKS (the local receive window)
    pub window: usize,
    /// Size of each receive from SOCKS
    pub recv_chunk: usize,
    /// SOCKS credentials
    pub credentials: Option<Credentials>,
    /// Append the local peer's address to the username
    pub append_source_to_username: bool,
    /// Destination requested instead of the intercepted one
    pub override_dest: Option<TargetAddr>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            max_relays: 1024,
            window: 65535,
            recv_chunk: SOCKS_RECV_BUF_SIZE,
            credentials: None,
            append_source_to_username: false,
            override_dest: None,
        }
    }
}

/// Why an intercepted connection was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Too many live relays
    #[error("relay limit reached ({0})")]
    LimitReached(usize),

    /// The destination cannot be proxied
    #[error("unroutable destination {0}")]
    Unroutable(IpAddr),
}

/// Owner of every live [`TcpRelay`].
pub struct RelayManager<H, C: SocksConnector> {
    config: RelayConfig,
    connector: C,
    relays: Arena<TcpRelay<H, C::Session>>,
}

impl<H, C> RelayManager<H, C>
where
    H: Copy + Eq + Debug,
    C: SocksConnector,
{
    /// Create an empty manager
    pub fn new(config: RelayConfig, connector: C) -> Self {
        RelayManager {
            config,
            connector,
            relays: Arena::new(),
        }
    }

    /// Number of live relays
    pub fn len(&self) -> usize {
        self.relays.len()
    }

    /// Whether no relay is live
    pub fn is_empty(&self) -> bool {
        self.relays.is_empty()
    }

    /// Whether `id` names a live relay
    pub fn contains(&self, id: RelayId) -> bool {
        self.relays.contains(id)
    }

    /// The connector sessions are started with
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Bytes of local data relay `id` can take right now
    pub fn recv_capacity(&self, id: RelayId) -> usize {
        self.relays.get(id).map_or(0, TcpRelay::recv_capacity)
    }

    /// A new connection was intercepted; start its SOCKS session
    pub fn on_accept(
        &mut self,
        local: SocketAddr,
        remote: SocketAddr,
        handle: H,
    ) -> Result<RelayId, RejectReason> {
        if self.relays.len() >= self.config.max_relays {
            warn!(
                "{} -> {}: refused, relay limit {} reached",
                local, remote, self.config.max_relays
            );
            return Err(RejectReason::LimitReached(self.config.max_relays));
        }

        let ip = remote.ip();
        let broadcast = matches!(ip, IpAddr::V4(v4) if v4.is_broadcast());
        if ip.is_unspecified() || ip.is_multicast() || broadcast {
            warn!("{} -> {}: refused, unroutable destination", local, remote);
            return Err(RejectReason::Unroutable(ip));
        }

        let request = SocksRequest {
            target: self
                .config
                .override_dest
                .clone()
                .unwrap_or(TargetAddr::Ip(remote)),
            credentials: self.config.credentials.as_ref().map(|creds| {
                if self.config.append_source_to_username {
                    creds.with_source(local.ip())
                } else {
                    creds.clone()
                }
            }),
        };

        info!("{} -> {}: accepted, connecting via SOCKS to {}", local, remote, request.target);

        let window = self.config.window;
        let recv_chunk = self.config.recv_chunk;
        let connector = &mut self.connector;
        let id = self.relays.insert_with(|id| {
            let session = connector.connect(id, request);
            TcpRelay::new(local, remote, handle, session, window, recv_chunk)
        });
        debug!("{} -> {}: relay {} created", local, remote, id);
        Ok(id)
    }

    /// Bytes from the local peer; returns how many were taken
    pub fn on_stack_data<B>(&mut self, id: RelayId, data: &[u8], stack: &mut B) -> usize
    where
        B: StackBridge<Handle = H>,
    {
        self.step(id, stack, |relay, stack| relay.on_stack_data(data, stack))
            .unwrap_or(0)
    }

    /// The local peer acknowledged `count` bytes
    pub fn on_stack_sent_ack<B>(&mut self, id: RelayId, count: usize, stack: &mut B)
    where
        B: StackBridge<Handle = H>,
    {
        self.step(id, stack, |relay, stack| relay.on_stack_sent(count, stack));
    }

    /// The local peer finished sending
    pub fn on_stack_fin<B>(&mut self, id: RelayId, stack: &mut B)
    where
        B: StackBridge<Handle = H>,
    {
        self.step(id, stack, |relay, _| relay.on_stack_fin());
    }

    /// The local connection failed; it is already gone at the stack
    pub fn on_stack_error<B>(&mut self, id: RelayId, stack: &mut B)
    where
        B: StackBridge<Handle = H>,
    {
        if self.relays.contains(id) {
            self.abort_with(id, RelayError::LocalReset, stack);
        }
    }

    /// Dispatch a stack notification
    pub fn on_stack_event<B>(&mut self, id: RelayId, event: StackEvent, stack: &mut B)
    where
        B: StackBridge<Handle = H>,
    {
        match event {
            StackEvent::Data(data) => {
                let taken = self.on_stack_data(id, &data, stack);
                if taken < data.len() && self.relays.contains(id) {
                    warn!("relay {}: {} delivered bytes did not fit", id, data.len() - taken);
                }
            }
            StackEvent::Sent(count) => self.on_stack_sent_ack(id, count, stack),
            StackEvent::Fin => self.on_stack_fin(id, stack),
            StackEvent::Error => self.on_stack_error(id, stack),
        }
    }

    /// Dispatch a SOCKS session completion
    pub fn on_socks_event<B>(&mut self, id: RelayId, event: SocksEvent, stack: &mut B)
    where
        B: StackBridge<Handle = H>,
    {
        match event {
            SocksEvent::Up => {
                self.step(id, stack, |relay, _| relay.on_socks_up());
            }
            SocksEvent::Closed => {
                self.step(id, stack, |relay, stack| relay.on_socks_closed(stack));
            }
            SocksEvent::Error(reason) => {
                if self.relays.contains(id) {
                    self.abort_with(id, RelayError::Socks(reason), stack);
                } else {
                    trace!("relay {}: SOCKS error for a gone relay: {}", id, reason);
                }
            }
            SocksEvent::SendDone(count) => self.on_socks_send_done(id, count, stack),
            SocksEvent::RecvDone(data) => self.on_socks_recv_done(id, data, stack),
        }
    }

    /// `count` bytes reached the SOCKS peer
    pub fn on_socks_send_done<B>(&mut self, id: RelayId, count: usize, stack: &mut B)
    where
        B: StackBridge<Handle = H>,
    {
        self.step(id, stack, |relay, stack| relay.on_socks_send_done(count, stack));
    }

    /// Bytes arrived from the SOCKS peer
    pub fn on_socks_recv_done<B>(&mut self, id: RelayId, data: Bytes, stack: &mut B)
    where
        B: StackBridge<Handle = H>,
    {
        self.step(id, stack, |relay, stack| relay.on_socks_recv_done(data, stack));
    }

    /// Reset the local connection and drop the relay
    pub fn abort<B>(&mut self, id: RelayId, stack: &mut B)
    where
        B: StackBridge<Handle = H>,
    {
        if self.relays.contains(id) {
            self.abort_with(id, RelayError::Shutdown, stack);
        }
    }

    /// Abort every live relay
    pub fn abort_all<B>(&mut self, stack: &mut B)
    where
        B: StackBridge<Handle = H>,
    {
        let ids = self.relays.ids();
        if !ids.is_empty() {
            info!("Aborting {} live relays", ids.len());
        }
        for id in ids {
            self.abort(id, stack);
        }
    }

    /// Run one relay step, then abort or destroy the relay as the step
    /// demands. Returns `None` when the relay is gone afterwards or was
    /// never there.
    fn step<B, T, F>(&mut self, id: RelayId, stack: &mut B, f: F) -> Option<T>
    where
        B: StackBridge<Handle = H>,
        F: FnOnce(&mut TcpRelay<H, C::Session>, &mut B) -> Result<T, RelayError>,
    {
        let Some(relay) = self.relays.get_mut(id) else {
            trace!("relay {}: event for a gone relay dropped", id);
            return None;
        };

        match f(&mut *relay, &mut *stack) {
            Ok(value) => {
                if relay.is_finished() {
                    self.destroy(id, stack);
                }
                Some(value)
            }
            Err(err) => {
                self.abort_with(id, err, stack);
                None
            }
        }
    }

    fn destroy<B>(&mut self, id: RelayId, stack: &mut B)
    where
        B: StackBridge<Handle = H>,
    {
        if let Some(relay) = self.relays.remove(id) {
            info!("{}: closed", relay);
            relay.release(stack);
        }
    }

    fn abort_with<B>(&mut self, id: RelayId, err: RelayError, stack: &mut B)
    where
        B: StackBridge<Handle = H>,
    {
        let Some(relay) = self.relays.remove(id) else {
            return;
        };
        match err {
            RelayError::Shutdown | RelayError::LocalReset => info!("{}: aborted: {}", relay, err),
            _ => warn!("{}: aborted: {}", relay, err),
        }
        relay.abort(err != RelayError::LocalReset, stack);
    }
}

impl<H, C: SocksConnector> Debug for RelayManager<H, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayManager")
            .field("relays", &self.relays.len())
            .field("max_relays", &self.config.max_relays)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::mock::{MockConnector, MockStack};
    use super::*;

    fn addrs() -> (SocketAddr, SocketAddr) {
        (
            "10.0.0.2:40000".parse().unwrap(),
            "93.184.216.34:80".parse().unwrap(),
        )
    }

    fn manager(config: RelayConfig) -> RelayManager<u32, MockConnector> {
        RelayManager::new(config, MockConnector::default())
    }

    fn accept_up(
        mgr: &mut RelayManager<u32, MockConnector>,
        stack: &mut MockStack,
        handle: u32,
    ) -> RelayId {
        let (local, remote) = addrs();
        let id = mgr.on_accept(local, remote, handle).unwrap();
        mgr.on_socks_event(id, SocksEvent::Up, stack);
        id
    }

    #[test]
    fn test_accept_requests_intercepted_target() {
        let mut mgr = manager(RelayConfig::default());
        let (local, remote) = addrs();
        let id = mgr.on_accept(local, remote, 1).unwrap();

        assert!(mgr.contains(id));
        let requests = mgr.connector().requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].target, TargetAddr::Ip(remote));
        assert!(requests[0].credentials.is_none());
    }

    #[test]
    fn test_accept_with_override_and_source_username() {
        let config = RelayConfig {
            credentials: Some(Credentials::new("bob", "pw")),
            append_source_to_username: true,
            override_dest: Some("proxy.internal:3128".parse().unwrap()),
            ..Default::default()
        };
        let mut mgr = manager(config);
        let (local, remote) = addrs();
        mgr.on_accept(local, remote, 1).unwrap();

        let request = &mgr.connector().requests()[0];
        assert_eq!(
            request.target,
            TargetAddr::Domain("proxy.internal".to_string(), 3128)
        );
        let creds = request.credentials.as_ref().unwrap();
        assert_eq!(creds.username, "bob@10.0.0.2");
        assert_eq!(creds.password, "pw");
    }

    #[test]
    fn test_accept_rejects_over_limit() {
        let mut mgr = manager(RelayConfig {
            max_relays: 2,
            ..Default::default()
        });
        let (local, remote) = addrs();
        mgr.on_accept(local, remote, 1).unwrap();
        mgr.on_accept(local, remote, 2).unwrap();

        assert_eq!(
            mgr.on_accept(local, remote, 3),
            Err(RejectReason::LimitReached(2))
        );
        assert_eq!(mgr.len(), 2);
    }

    #[test]
    fn test_accept_rejects_unroutable() {
        let mut mgr = manager(RelayConfig::default());
        let (local, _) = addrs();
        for target in ["0.0.0.0:80", "224.0.0.1:80", "255.255.255.255:80", "[::]:80"] {
            let remote: SocketAddr = target.parse().unwrap();
            assert!(matches!(
                mgr.on_accept(local, remote, 1),
                Err(RejectReason::Unroutable(_))
            ));
        }
        assert!(mgr.is_empty());
    }

    #[test]
    fn test_data_before_up_is_held() {
        let mut stack = MockStack::default();
        let mut mgr = manager(RelayConfig::default());
        let (local, remote) = addrs();
        let id = mgr.on_accept(local, remote, 1).unwrap();

        assert_eq!(mgr.on_stack_data(id, b"early", &mut stack), 5);
        let session = mgr.connector().session(0);
        assert!(session.sent_chunks().is_empty());

        mgr.on_socks_event(id, SocksEvent::Up, &mut stack);
        assert_eq!(session.sent_chunks(), vec![Bytes::from_static(b"early")]);
        assert_eq!(session.recv_requests(), vec![SOCKS_RECV_BUF_SIZE]);
    }

    #[test]
    fn test_one_send_in_flight() {
        let mut stack = MockStack::default();
        let mut mgr = manager(RelayConfig::default());
        let id = accept_up(&mut mgr, &mut stack, 1);
        let session = mgr.connector().session(0);

        mgr.on_stack_data(id, b"abc", &mut stack);
        mgr.on_stack_data(id, b"def", &mut stack);
        assert_eq!(session.sent_chunks(), vec![Bytes::from_static(b"abc")]);

        mgr.on_socks_send_done(id, 3, &mut stack);
        assert_eq!(
            session.sent_chunks(),
            vec![Bytes::from_static(b"abc"), Bytes::from_static(b"def")]
        );
    }

    #[test]
    fn test_backpressure_pauses_and_resumes() {
        let mut stack = MockStack::default();
        let mut mgr = manager(RelayConfig {
            window: 8,
            ..Default::default()
        });
        let id = accept_up(&mut mgr, &mut stack, 1);

        assert_eq!(mgr.on_stack_data(id, b"12345678", &mut stack), 8);
        assert!(stack.conn(1).paused);
        assert_eq!(mgr.recv_capacity(id), 0);
        assert_eq!(mgr.on_stack_data(id, b"9", &mut stack), 0);

        mgr.on_socks_send_done(id, 8, &mut stack);
        assert!(!stack.conn(1).paused);
        assert_eq!(mgr.recv_capacity(id), 8);
    }

    #[test]
    fn test_socks_data_limited_by_window() {
        let mut stack = MockStack::default();
        stack.set_capacity(1, 4);
        let mut mgr = manager(RelayConfig::default());
        let id = accept_up(&mut mgr, &mut stack, 1);
        let session = mgr.connector().session(0);

        mgr.on_socks_recv_done(id, Bytes::from_static(b"HTTP/1.0"), &mut stack);
        assert_eq!(stack.conn(1).delivered, b"HTTP");
        // No new receive while the chunk is only partly queued.
        assert_eq!(session.recv_requests().len(), 1);

        stack.set_capacity(1, 4);
        mgr.on_stack_sent_ack(id, 4, &mut stack);
        assert_eq!(stack.conn(1).delivered, b"HTTP/1.0");
        assert_eq!(session.recv_requests().len(), 2);
    }

    #[test]
    fn test_socks_error_aborts_with_reset() {
        let mut stack = MockStack::default();
        let mut mgr = manager(RelayConfig::default());
        let id = accept_up(&mut mgr, &mut stack, 1);

        mgr.on_socks_event(id, SocksEvent::Error("refused".into()), &mut stack);
        assert!(!mgr.contains(id));
        assert_eq!(stack.conn(1).aborts, 1);
        assert!(stack.conn(1).released);
    }

    #[test]
    fn test_stack_error_releases_without_reset() {
        let mut stack = MockStack::default();
        let mut mgr = manager(RelayConfig::default());
        let id = accept_up(&mut mgr, &mut stack, 1);

        mgr.on_stack_event(id, StackEvent::Error, &mut stack);
        assert!(!mgr.contains(id));
        assert_eq!(stack.conn(1).aborts, 0);
        assert!(stack.conn(1).released);
    }

    #[test]
    fn test_closed_before_up_aborts() {
        let mut stack = MockStack::default();
        let mut mgr = manager(RelayConfig::default());
        let (local, remote) = addrs();
        let id = mgr.on_accept(local, remote, 1).unwrap();

        mgr.on_socks_event(id, SocksEvent::Closed, &mut stack);
        assert!(!mgr.contains(id));
        assert_eq!(stack.conn(1).aborts, 1);
    }

    #[test]
    fn test_session_failure_inside_data_handler_aborts_once() {
        let mut stack = MockStack::default();
        let mut mgr = manager(RelayConfig::default());
        let id = accept_up(&mut mgr, &mut stack, 1);
        mgr.connector().session(0).fail();

        assert_eq!(mgr.on_stack_data(id, b"boom", &mut stack), 0);
        assert!(!mgr.contains(id));
        assert_eq!(stack.conn(1).aborts, 1);

        // Completions still queued for the destroyed relay are ignored.
        mgr.on_socks_send_done(id, 4, &mut stack);
        mgr.on_socks_recv_done(id, Bytes::from_static(b"late"), &mut stack);
        mgr.abort(id, &mut stack);
        assert_eq!(stack.conn(1).aborts, 1);
        assert!(stack.conn(1).delivered.is_empty());
    }

    #[test]
    fn test_stack_send_failure_aborts() {
        let mut stack = MockStack::default();
        let mut mgr = manager(RelayConfig::default());
        let id = accept_up(&mut mgr, &mut stack, 1);
        stack.fail_sends(1);

        mgr.on_socks_recv_done(id, Bytes::from_static(b"reply"), &mut stack);
        assert!(!mgr.contains(id));
        assert_eq!(stack.conn(1).aborts, 1);
    }

    #[test]
    fn test_stalled_window_aborts() {
        let mut stack = MockStack::default();
        stack.set_capacity(1, 0);
        let mut mgr = manager(RelayConfig::default());
        let id = accept_up(&mut mgr, &mut stack, 1);

        mgr.on_socks_recv_done(id, Bytes::from_static(b"reply"), &mut stack);
        assert!(!mgr.contains(id));
    }

    #[test]
    fn test_stale_id_does_not_reach_new_relay() {
        let mut stack = MockStack::default();
        let mut mgr = manager(RelayConfig::default());
        let old = accept_up(&mut mgr, &mut stack, 1);
        mgr.abort(old, &mut stack);

        let new = accept_up(&mut mgr, &mut stack, 2);
        assert_eq!(old.index(), new.index());

        mgr.on_socks_recv_done(old, Bytes::from_static(b"stale"), &mut stack);
        mgr.on_socks_event(old, SocksEvent::Error("stale".into()), &mut stack);
        assert!(mgr.contains(new));
        assert!(stack.conn(2).delivered.is_empty());
        assert_eq!(stack.conn(2).aborts, 0);
    }

    #[test]
    fn test_half_close_both_directions_destroys() {
        let mut stack = MockStack::default();
        let mut mgr = manager(RelayConfig::default());
        let id = accept_up(&mut mgr, &mut stack, 1);
        let session = mgr.connector().session(0);

        mgr.on_stack_event(id, StackEvent::Fin, &mut stack);
        assert!(session.is_shutdown());
        assert!(mgr.contains(id));

        mgr.on_socks_recv_done(id, Bytes::from_static(b"bye"), &mut stack);
        mgr.on_socks_event(id, SocksEvent::Closed, &mut stack);
        assert_eq!(stack.conn(1).delivered, b"bye");
        assert!(stack.conn(1).closed);
        assert!(!mgr.contains(id));
        assert!(stack.conn(1).released);
        assert_eq!(stack.conn(1).aborts, 0);
    }

    #[test]
    fn test_socks_close_first_keeps_upstream_open() {
        let mut stack = MockStack::default();
        let mut mgr = manager(RelayConfig::default());
        let id = accept_up(&mut mgr, &mut stack, 1);
        let session = mgr.connector().session(0);

        mgr.on_socks_event(id, SocksEvent::Closed, &mut stack);
        assert!(stack.conn(1).closed);
        assert!(mgr.contains(id));

        mgr.on_stack_data(id, b"more", &mut stack);
        mgr.on_socks_send_done(id, 4, &mut stack);
        assert_eq!(session.sent_chunks(), vec![Bytes::from_static(b"more")]);

        mgr.on_stack_event(id, StackEvent::Fin, &mut stack);
        assert!(session.is_shutdown());
        assert!(!mgr.contains(id));
    }

    #[test]
    fn test_abort_all() {
        let mut stack = MockStack::default();
        let mut mgr = manager(RelayConfig::default());
        accept_up(&mut mgr, &mut stack, 1);
        accept_up(&mut mgr, &mut stack, 2);

        mgr.abort_all(&mut stack);
        assert!(mgr.is_empty());
        assert_eq!(stack.conn(1).aborts, 1);
        assert_eq!(stack.conn(2).aborts, 1);
    }
}
