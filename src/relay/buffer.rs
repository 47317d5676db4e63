//! Bounded relay buffers.

use bytes::{Buf, Bytes, BytesMut};

/// Bytes read from the local connection, waiting to be written to SOCKS.
///
/// Capacity is fixed at the connection's receive window; anything that
/// does not fit is refused and stays with the stack.
#[derive(Debug)]
pub struct OutboundBuffer {
    data: BytesMut,
    capacity: usize,
}

impl OutboundBuffer {
    /// Create an empty buffer holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        OutboundBuffer {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Append as much of `bytes` as fits, returning the count taken
    pub fn push(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.free());
        self.data.extend_from_slice(&bytes[..n]);
        n
    }

    /// Copy of everything buffered
    pub fn snapshot(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data)
    }

    /// Discard `n` bytes from the front
    pub fn consume(&mut self, n: usize) {
        self.data.advance(n.min(self.data.len()));
    }

    /// Bytes buffered
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Free space left
    pub fn free(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Whether no more bytes fit
    pub fn is_full(&self) -> bool {
        self.free() == 0
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

/// One chunk received from SOCKS, with a cursor of how much of it has
/// been queued to the local connection.
#[derive(Debug, Default)]
pub struct InboundBuffer {
    data: Bytes,
    sent: usize,
}

impl InboundBuffer {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the contents with a freshly received chunk
    pub fn fill(&mut self, data: Bytes) {
        debug_assert!(self.is_drained(), "refilling a buffer with unsent bytes");
        self.data = data;
        self.sent = 0;
    }

    /// Bytes not yet queued to the stack
    pub fn pending(&self) -> &[u8] {
        &self.data[self.sent..]
    }

    /// Mark `n` more bytes as queued
    pub fn advance(&mut self, n: usize) {
        self.sent = (self.sent + n).min(self.data.len());
    }

    /// Bytes held, queued or not
    pub fn used(&self) -> usize {
        self.data.len()
    }

    /// Bytes already queued
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Whether every held byte has been queued
    pub fn is_drained(&self) -> bool {
        self.sent == self.data.len()
    }

    /// Drop everything
    pub fn clear(&mut self) {
        self.data = Bytes::new();
        self.sent = 0;
    }
}
