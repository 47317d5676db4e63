//! Relay manager driven end to end through real SOCKS sessions

mod common;

use common::{bytes, recv_timeout, MockSocksServer, MockStack};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tunsocks::relay::{RelayConfig, RelayId, RelayManager, SocksEvent, StackEvent};
use tunsocks::socks::{Credentials, SocksDialer, TokioConnector};

type Manager = RelayManager<u32, TokioConnector>;
type Events = mpsc::UnboundedReceiver<(RelayId, SocksEvent)>;

const HANDLE: u32 = 1;

fn local() -> SocketAddr {
    "10.0.0.2:40000".parse().unwrap()
}

fn remote() -> SocketAddr {
    "93.184.216.34:80".parse().unwrap()
}

fn manager(server: SocketAddr, config: RelayConfig) -> (Manager, Events) {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let connector = TokioConnector::new(SocksDialer::new(server), events_tx);
    (RelayManager::new(config, connector), events_rx)
}

/// Feed session completions to the manager until `done` holds
async fn pump<F>(manager: &mut Manager, stack: &mut MockStack, events: &mut Events, done: F)
where
    F: Fn(&Manager, &MockStack) -> bool,
{
    while !done(manager, stack) {
        let (id, event) = recv_timeout(events).await;
        manager.on_socks_event(id, event, stack);
    }
}

#[tokio::test]
async fn test_relay_round_trip_and_half_close() {
    let mut server = MockSocksServer::start(Some("secret")).await;
    let config = RelayConfig {
        credentials: Some(Credentials::new("alice", "secret")),
        append_source_to_username: true,
        ..Default::default()
    };
    let (mut manager, mut events) = manager(server.addr, config);
    let mut stack = MockStack::default();

    let id = manager.on_accept(local(), remote(), HANDLE).unwrap();

    // Data arriving before the session is up is held, not lost.
    manager.on_stack_event(id, StackEvent::Data(bytes(b"GET / HTTP/1.0\r\n")), &mut stack);
    manager.on_stack_event(id, StackEvent::Data(bytes(b"\r\n")), &mut stack);

    pump(&mut manager, &mut stack, &mut events, |_, s| {
        s.conn(HANDLE).delivered == b"GET / HTTP/1.0\r\n\r\n"
    })
    .await;

    let seen = recv_timeout(&mut server.requests).await;
    assert_eq!(seen.target, "93.184.216.34:80");
    assert_eq!(
        seen.auth,
        Some(("alice@10.0.0.2".to_string(), "secret".to_string()))
    );

    // Local FIN reaches the server, which closes in turn; the relay then
    // closes the local side and goes away without a reset.
    manager.on_stack_event(id, StackEvent::Fin, &mut stack);
    pump(&mut manager, &mut stack, &mut events, |m, _| m.is_empty()).await;

    let conn = stack.conn(HANDLE);
    assert!(conn.closed);
    assert!(conn.released);
    assert!(!conn.aborted);
}

#[tokio::test]
async fn test_relay_aborts_on_rejected_credentials() {
    let server = MockSocksServer::start(Some("secret")).await;
    let config = RelayConfig {
        credentials: Some(Credentials::new("alice", "nope")),
        ..Default::default()
    };
    let (mut manager, mut events) = manager(server.addr, config);
    let mut stack = MockStack::default();

    manager.on_accept(local(), remote(), HANDLE).unwrap();
    pump(&mut manager, &mut stack, &mut events, |m, _| m.is_empty()).await;

    let conn = stack.conn(HANDLE);
    assert!(conn.aborted);
    assert!(conn.released);
    assert!(conn.delivered.is_empty());
}

#[tokio::test]
async fn test_relay_backpressure_both_directions() {
    let server = MockSocksServer::start(None).await;
    let config = RelayConfig {
        window: 4,
        ..Default::default()
    };
    let (mut manager, mut events) = manager(server.addr, config);
    let mut stack = MockStack::default();
    stack.set_capacity(HANDLE, 2);

    let id = manager.on_accept(local(), remote(), HANDLE).unwrap();
    assert_eq!(manager.recv_capacity(id), 4);

    manager.on_stack_event(id, StackEvent::Data(bytes(b"abcd")), &mut stack);
    assert!(stack.conn(HANDLE).paused);
    assert_eq!(manager.recv_capacity(id), 0);

    // The echo comes back through a two-byte local window.
    pump(&mut manager, &mut stack, &mut events, |_, s| {
        let conn = s.conn(HANDLE);
        conn.delivered == b"ab" && !conn.paused
    })
    .await;
    assert_eq!(manager.recv_capacity(id), 4);

    stack.ack_all(HANDLE, 64);
    manager.on_stack_event(id, StackEvent::Sent(2), &mut stack);
    pump(&mut manager, &mut stack, &mut events, |_, s| {
        s.conn(HANDLE).delivered == b"abcd"
    })
    .await;
    assert!(manager.contains(id));
}

#[tokio::test]
async fn test_relay_local_reset_releases_without_reset() {
    let server = MockSocksServer::start(None).await;
    let (mut manager, mut events) = manager(server.addr, RelayConfig::default());
    let mut stack = MockStack::default();

    let id = manager.on_accept(local(), remote(), HANDLE).unwrap();
    let (up_id, up) = recv_timeout(&mut events).await;
    manager.on_socks_event(up_id, up, &mut stack);

    manager.on_stack_event(id, StackEvent::Error, &mut stack);
    assert!(manager.is_empty());
    let conn = stack.conn(HANDLE);
    assert!(conn.released);
    assert!(!conn.aborted);
}
