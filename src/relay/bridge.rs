//! Seams between a relay and its two peers.
//!
//! The relay never owns I/O. It calls into the embedded stack through
//! [`StackBridge`] and into its SOCKS session through [`SocksSession`];
//! completions come back as [`StackEvent`]s and [`SocksEvent`]s delivered
//! by the reactor loop.

use super::RelayId;
use crate::error::{RelayError, StackError};
use crate::socks::{Credentials, TargetAddr};
use bytes::Bytes;
use std::fmt::Debug;

/// Per-connection operations of the embedded TCP stack.
pub trait StackBridge {
    /// Stack-side identifier of one intercepted connection
    type Handle: Copy + Eq + Debug;

    /// Bytes the connection can queue toward the local peer right now
    fn send_capacity(&self, handle: Self::Handle) -> usize;

    /// Queue bytes toward the local peer, returning how many were taken
    fn send(&mut self, handle: Self::Handle, data: &[u8]) -> Result<usize, StackError>;

    /// Stop or resume delivering received bytes for this connection
    fn set_recv_paused(&mut self, handle: Self::Handle, paused: bool);

    /// Send FIN once queued bytes are out
    fn close(&mut self, handle: Self::Handle);

    /// Reset the connection
    fn abort(&mut self, handle: Self::Handle);

    /// The relay is done with this connection; the stack reclaims it
    fn release(&mut self, handle: Self::Handle);
}

/// Byte-stream primitives of an established SOCKS session.
///
/// Each call only starts an operation; completion arrives later as a
/// [`SocksEvent`]. An `Err` means the session is gone.
pub trait SocksSession {
    /// Write all of `data`; completes with [`SocksEvent::SendDone`]
    fn send(&mut self, data: Bytes) -> Result<(), RelayError>;

    /// Read up to `max` bytes; completes with [`SocksEvent::RecvDone`]
    /// or [`SocksEvent::Closed`]
    fn recv(&mut self, max: usize) -> Result<(), RelayError>;

    /// No more data will be sent
    fn shutdown_write(&mut self) -> Result<(), RelayError>;
}

/// Starts SOCKS sessions on behalf of relays.
pub trait SocksConnector {
    /// Session type produced
    type Session: SocksSession;

    /// Begin connecting; the outcome arrives as [`SocksEvent::Up`] or
    /// [`SocksEvent::Error`] tagged with `relay`
    fn connect(&mut self, relay: RelayId, request: SocksRequest) -> Self::Session;
}

/// What a relay asks the SOCKS server for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocksRequest {
    /// Destination to CONNECT to
    pub target: TargetAddr,
    /// Optional username/password
    pub credentials: Option<Credentials>,
}

/// Completions reported by a SOCKS session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksEvent {
    /// Handshake finished, the stream is usable
    Up,
    /// The peer finished sending
    Closed,
    /// The session failed
    Error(String),
    /// A send completed
    SendDone(usize),
    /// A receive completed
    RecvDone(Bytes),
}

/// Notifications derived from the embedded stack for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    /// Bytes received from the local peer
    Data(Bytes),
    /// The local peer acknowledged bytes we queued
    Sent(usize),
    /// The local peer finished sending
    Fin,
    /// The connection was reset or failed
    Error,
}
