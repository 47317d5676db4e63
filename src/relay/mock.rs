//! In-memory stand-ins for the stack and SOCKS sessions.

use super::bridge::{SocksConnector, SocksRequest, SocksSession, StackBridge};
use super::RelayId;
use crate::error::{RelayError, StackError};
use bytes::Bytes;
use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

const DEFAULT_CAPACITY: usize = 65535;

/// Observable state of one mock connection.
#[derive(Debug, Clone, Default)]
pub struct MockConn {
    pub capacity: Option<usize>,
    pub delivered: Vec<u8>,
    pub paused: bool,
    pub closed: bool,
    pub aborts: usize,
    pub released: bool,
    pub fail_send: bool,
}

#[derive(Debug, Default)]
pub struct MockStack {
    conns: HashMap<u32, MockConn>,
}

impl MockStack {
    pub fn conn(&self, handle: u32) -> MockConn {
        self.conns.get(&handle).cloned().unwrap_or_default()
    }

    pub fn set_capacity(&mut self, handle: u32, capacity: usize) {
        self.conns.entry(handle).or_default().capacity = Some(capacity);
    }

    pub fn fail_sends(&mut self, handle: u32) {
        self.conns.entry(handle).or_default().fail_send = true;
    }
}

impl StackBridge for MockStack {
    type Handle = u32;

    fn send_capacity(&self, handle: u32) -> usize {
        self.conns
            .get(&handle)
            .and_then(|c| c.capacity)
            .unwrap_or(DEFAULT_CAPACITY)
    }

    fn send(&mut self, handle: u32, data: &[u8]) -> Result<usize, StackError> {
        let conn = self.conns.entry(handle).or_default();
        if conn.fail_send {
            return Err(StackError::NotWritable("Closed"));
        }
        let n = data.len().min(conn.capacity.unwrap_or(DEFAULT_CAPACITY));
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
        self.conns.entry(handle).or_default().aborts += 1;
    }

    fn release(&mut self, handle: u32) {
        self.conns.entry(handle).or_default().released = true;
    }
}

#[derive(Debug, Default)]
struct SessionState {
    sent: Vec<Bytes>,
    recv_requests: Vec<usize>,
    shutdown: bool,
    failed: bool,
}

/// Session handle whose clones share one recorded history.
#[derive(Debug, Clone, Default)]
pub struct MockSession {
    state: Rc<RefCell<SessionState>>,
}

impl MockSession {
    pub fn sent_chunks(&self) -> Vec<Bytes> {
        self.state.borrow().sent.clone()
    }

    pub fn recv_requests(&self) -> Vec<usize> {
        self.state.borrow().recv_requests.clone()
    }

    pub fn is_shutdown(&self) -> bool {
        self.state.borrow().shutdown
    }

    pub fn fail(&self) {
        self.state.borrow_mut().failed = true;
    }

    fn check(&self) -> Result<(), RelayError> {
        if self.state.borrow().failed {
            Err(RelayError::SessionGone)
        } else {
            Ok(())
        }
    }
}

impl SocksSession for MockSession {
    fn send(&mut self, data: Bytes) -> Result<(), RelayError> {
        self.check()?;
        self.state.borrow_mut().sent.push(data);
        Ok(())
    }

    fn recv(&mut self, max: usize) -> Result<(), RelayError> {
        self.check()?;
        self.state.borrow_mut().recv_requests.push(max);
        Ok(())
    }

    fn shutdown_write(&mut self) -> Result<(), RelayError> {
        self.check()?;
        self.state.borrow_mut().shutdown = true;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MockConnector {
    requests: Vec<SocksRequest>,
    sessions: Vec<MockSession>,
}

impl MockConnector {
    pub fn requests(&self) -> Vec<SocksRequest> {
        self.requests.clone()
    }

    pub fn session(&self, n: usize) -> MockSession {
        self.sessions[n].clone()
    }
}

impl SocksConnector for MockConnector {
    type Session = MockSession;

    fn connect(&mut self, _relay: RelayId, request: SocksRequest) -> MockSession {
        let session = MockSession::default();
        self.requests.push(request);
        self.sessions.push(session.clone());
        session
    }
}
