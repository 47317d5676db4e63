//! State of one proxied TCP connection.
//!
//! Every step takes the stack bridge it may call into and returns
//! `Err` when the relay has to be aborted. The owning
//! [`RelayManager`](super::RelayManager) performs the abort, so a step
//! never outlives the relay it is working on.

use super::bridge::{SocksSession, StackBridge};
use super::buffer::{InboundBuffer, OutboundBuffer};
use crate::error::RelayError;
use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use tracing::{debug, info, trace, warn};

/// One intercepted TCP connection bridged to a SOCKS session.
pub struct TcpRelay<H, S> {
    local: SocketAddr,
    remote: SocketAddr,
    handle: H,
    socks: S,

    outbound: OutboundBuffer,
    inbound: InboundBuffer,
    recv_chunk: usize,

    socks_up: bool,
    socks_closed: bool,
    socks_write_shut: bool,
    socks_sending: bool,
    socks_receiving: bool,

    local_closed: bool,
    local_fin_sent: bool,
    recv_paused: bool,
    inbound_waiting: bool,
    stack_unacked: usize,
}

impl<H, S> TcpRelay<H, S>
where
    H: Copy + Eq + fmt::Debug,
    S: SocksSession,
{
    /// Create a relay for an accepted connection whose SOCKS session is
    /// already connecting
    pub fn new(
        local: SocketAddr,
        remote: SocketAddr,
        handle: H,
        socks: S,
        window: usize,
        recv_chunk: usize,
    ) -> Self {
        TcpRelay {
            local,
            remote,
            handle,
            socks,
            outbound: OutboundBuffer::new(window),
            inbound: InboundBuffer::new(),
            recv_chunk,
            socks_up: false,
            socks_closed: false,
            socks_write_shut: false,
            socks_sending: false,
            socks_receiving: false,
            local_closed: false,
            local_fin_sent: false,
            recv_paused: false,
            inbound_waiting: false,
            stack_unacked: 0,
        }
    }

    /// Bytes of local data the relay can take right now
    pub fn recv_capacity(&self) -> usize {
        if self.recv_paused || self.local_closed {
            0
        } else {
            self.outbound.free()
        }
    }

    /// Both directions are done and nothing is in flight
    pub fn is_finished(&self) -> bool {
        self.local_closed
            && self.socks_write_shut
            && !self.socks_sending
            && self.outbound.is_empty()
            && self.local_fin_sent
    }

    /// Local bytes arrived; returns how many were taken
    pub fn on_stack_data<B>(&mut self, data: &[u8], stack: &mut B) -> Result<usize, RelayError>
    where
        B: StackBridge<Handle = H>,
    {
        if self.local_closed {
            debug!("{}: data after FIN ignored ({} bytes)", self, data.len());
            return Ok(0);
        }

        let taken = self.outbound.push(data);
        if taken < data.len() {
            debug!("{}: buffer full, refused {} bytes", self, data.len() - taken);
        }

        if self.outbound.is_full() && !self.recv_paused {
            trace!("{}: pausing local receive", self);
            stack.set_recv_paused(self.handle, true);
            self.recv_paused = true;
        }

        if self.socks_up && !self.socks_sending {
            self.send_to_socks()?;
        }
        Ok(taken)
    }

    /// The local peer acknowledged `count` queued bytes
    pub fn on_stack_sent<B>(&mut self, count: usize, stack: &mut B) -> Result<(), RelayError>
    where
        B: StackBridge<Handle = H>,
    {
        self.stack_unacked = self.stack_unacked.saturating_sub(count);
        if self.inbound_waiting {
            self.flush_inbound(stack)?;
        }
        Ok(())
    }

    /// The local peer finished sending
    pub fn on_stack_fin(&mut self) -> Result<(), RelayError> {
        if self.local_closed {
            return Ok(());
        }
        info!("{}: local side closed", self);
        self.local_closed = true;

        if self.socks_up && !self.socks_sending && self.outbound.is_empty() {
            self.shutdown_socks_write()?;
        } else if !self.outbound.is_empty() {
            debug!(
                "{}: waiting until {} buffered bytes reach SOCKS",
                self,
                self.outbound.len()
            );
        }
        Ok(())
    }

    /// SOCKS handshake finished
    pub fn on_socks_up(&mut self) -> Result<(), RelayError> {
        if self.socks_up {
            warn!("{}: duplicate SOCKS up event", self);
            return Ok(());
        }
        info!("{}: SOCKS up", self);
        self.socks_up = true;

        if !self.outbound.is_empty() {
            self.send_to_socks()?;
        } else if self.local_closed {
            self.shutdown_socks_write()?;
        }
        self.start_socks_recv()
    }

    /// The SOCKS peer finished sending
    pub fn on_socks_closed<B>(&mut self, stack: &mut B) -> Result<(), RelayError>
    where
        B: StackBridge<Handle = H>,
    {
        if !self.socks_up {
            return Err(RelayError::ClosedBeforeUp);
        }
        info!("{}: SOCKS closed", self);
        self.socks_closed = true;
        self.socks_receiving = false;

        if self.inbound.is_drained() && !self.inbound_waiting {
            self.close_local(stack);
        } else {
            debug!("{}: waiting until buffered data reaches the local peer", self);
        }
        Ok(())
    }

    /// A send to SOCKS completed
    pub fn on_socks_send_done<B>(&mut self, count: usize, stack: &mut B) -> Result<(), RelayError>
    where
        B: StackBridge<Handle = H>,
    {
        if !self.socks_sending {
            warn!("{}: unexpected SOCKS send completion", self);
            return Ok(());
        }
        self.socks_sending = false;
        self.outbound.consume(count);
        trace!("{}: sent {} bytes to SOCKS", self, count);

        if self.recv_paused && !self.outbound.is_full() {
            trace!("{}: resuming local receive", self);
            stack.set_recv_paused(self.handle, false);
            self.recv_paused = false;
        }

        if !self.outbound.is_empty() {
            self.send_to_socks()
        } else if self.local_closed {
            self.shutdown_socks_write()
        } else {
            Ok(())
        }
    }

    /// Bytes arrived from SOCKS
    pub fn on_socks_recv_done<B>(&mut self, data: Bytes, stack: &mut B) -> Result<(), RelayError>
    where
        B: StackBridge<Handle = H>,
    {
        if !self.socks_receiving {
            warn!("{}: unexpected SOCKS receive completion", self);
            return Ok(());
        }
        self.socks_receiving = false;
        trace!("{}: received {} bytes from SOCKS", self, data.len());

        self.inbound.fill(data);
        self.flush_inbound(stack)
    }

    /// Tear down the session side, resetting the local connection unless
    /// it is already dead
    pub fn abort<B>(self, reset_local: bool, stack: &mut B)
    where
        B: StackBridge<Handle = H>,
    {
        if reset_local {
            stack.abort(self.handle);
        }
        stack.release(self.handle);
    }

    /// Hand the connection back to the stack after a clean finish
    pub fn release<B>(self, stack: &mut B)
    where
        B: StackBridge<Handle = H>,
    {
        stack.release(self.handle);
    }

    fn send_to_socks(&mut self) -> Result<(), RelayError> {
        if self.outbound.is_empty() {
            return Ok(());
        }
        self.socks.send(self.outbound.snapshot())?;
        self.socks_sending = true;
        Ok(())
    }

    fn shutdown_socks_write(&mut self) -> Result<(), RelayError> {
        if self.socks_write_shut {
            return Ok(());
        }
        debug!("{}: shutting down SOCKS write side", self);
        self.socks.shutdown_write()?;
        self.socks_write_shut = true;
        Ok(())
    }

    fn start_socks_recv(&mut self) -> Result<(), RelayError> {
        if self.socks_closed || self.socks_receiving {
            return Ok(());
        }
        self.socks.recv(self.recv_chunk)?;
        self.socks_receiving = true;
        Ok(())
    }

    /// Queue as much of the SOCKS chunk as the local window allows
    fn flush_inbound<B>(&mut self, stack: &mut B) -> Result<(), RelayError>
    where
        B: StackBridge<Handle = H>,
    {
        loop {
            let pending = self.inbound.pending().len();
            if pending == 0 {
                break;
            }
            let to_write = pending.min(stack.send_capacity(self.handle));
            if to_write == 0 {
                break;
            }
            let written = stack.send(self.handle, &self.inbound.pending()[..to_write])?;
            self.inbound.advance(written);
            self.stack_unacked += written;
            if written < to_write {
                break;
            }
        }

        if !self.inbound.is_drained() {
            if self.stack_unacked == 0 {
                return Err(RelayError::Stalled);
            }
            trace!(
                "{}: {} bytes wait for the local window",
                self,
                self.inbound.pending().len()
            );
            self.inbound_waiting = true;
            return Ok(());
        }

        self.inbound_waiting = false;
        self.inbound.clear();

        if self.socks_closed {
            self.close_local(stack);
            Ok(())
        } else {
            self.start_socks_recv()
        }
    }

    fn close_local<B>(&mut self, stack: &mut B)
    where
        B: StackBridge<Handle = H>,
    {
        if self.local_fin_sent {
            return;
        }
        debug!("{}: closing local side", self);
        stack.close(self.handle);
        self.local_fin_sent = true;
    }
}

impl<H, S> fmt::Display for TcpRelay<H, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}

impl<H: fmt::Debug, S> fmt::Debug for TcpRelay<H, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpRelay")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("handle", &self.handle)
            .field("outbound", &self.outbound.len())
            .field("inbound_pending", &self.inbound.pending().len())
            .field("socks_up", &self.socks_up)
            .field("socks_closed", &self.socks_closed)
            .field("local_closed", &self.local_closed)
            .finish()
    }
}
