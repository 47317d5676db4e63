//! UDP gateway wire format
//!
//! Every message is a little-endian `u16` length followed by that many
//! bytes:
//!
//! ```text
//! +--------+-------+-----------+----------------------+---------+
//! | len LE | flags | conid LE  | addr + port (BE)     | payload |
//! | 2      | 1     | 2         | 6 (IPv4) / 18 (IPv6) | ...     |
//! +--------+-------+-----------+----------------------+---------+
//! ```
//!
//! Keepalive frames stop after the connection id.

use crate::error::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// No-op frame keeping the connection alive
pub const FLAG_KEEPALIVE: u8 = 0x01;
/// The gateway must drop any state it has for this connection id
pub const FLAG_REBIND: u8 = 0x02;
/// The gateway resolves this datagram with its own DNS server
pub const FLAG_DNS: u8 = 0x04;
/// The address is IPv6
pub const FLAG_IPV6: u8 = 0x08;
/// The gateway closed this connection id
pub const FLAG_ERR: u8 = 0x20;

/// Length prefix size
pub const LEN_PREFIX: usize = 2;
/// Flags plus connection id
pub const HEADER_LEN: usize = 3;
/// IPv4 address plus port
pub const IPV4_ADDR_LEN: usize = 6;
/// IPv6 address plus port
pub const IPV6_ADDR_LEN: usize = 18;
/// Largest body a length prefix can describe
pub const MAX_BODY_LEN: usize = u16::MAX as usize;

/// A decoded frame body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Flag bits
    pub flags: u8,
    /// Connection id
    pub conid: u16,
    /// Remote address of a data frame
    pub addr: Option<SocketAddr>,
    /// Datagram payload
    pub payload: Bytes,
}

impl Frame {
    /// Whether this is a keepalive
    pub fn is_keepalive(&self) -> bool {
        self.flags & FLAG_KEEPALIVE != 0
    }

    /// Whether the gateway closed the connection id
    pub fn is_error(&self) -> bool {
        self.flags & FLAG_ERR != 0
    }
}

fn addr_len(addr: &SocketAddr) -> usize {
    match addr {
        SocketAddr::V4(_) => IPV4_ADDR_LEN,
        SocketAddr::V6(_) => IPV6_ADDR_LEN,
    }
}

/// Largest payload that fits in one frame to `addr`
pub fn max_payload(addr: &SocketAddr) -> usize {
    MAX_BODY_LEN - HEADER_LEN - addr_len(addr)
}

/// Encode a keepalive message, length prefix included
pub fn encode_keepalive() -> Bytes {
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + HEADER_LEN);
    buf.put_u16_le(HEADER_LEN as u16);
    buf.put_u8(FLAG_KEEPALIVE);
    buf.put_u16_le(0);
    buf.freeze()
}

/// Encode a data message, length prefix included. The IPv6 flag follows
/// the address family.
pub fn encode_data(
    flags: u8,
    conid: u16,
    addr: SocketAddr,
    payload: &[u8],
) -> Result<Bytes, FrameError> {
    if payload.len() > max_payload(&addr) {
        return Err(FrameError::TooLarge(payload.len()));
    }

    let body_len = HEADER_LEN + addr_len(&addr) + payload.len();
    let mut buf = BytesMut::with_capacity(LEN_PREFIX + body_len);
    buf.put_u16_le(body_len as u16);

    match addr {
        SocketAddr::V4(v4) => {
            buf.put_u8(flags & !FLAG_IPV6);
            buf.put_u16_le(conid);
            buf.put_slice(&v4.ip().octets());
            buf.put_u16(v4.port());
        }
        SocketAddr::V6(v6) => {
            buf.put_u8(flags | FLAG_IPV6);
            buf.put_u16_le(conid);
            buf.put_slice(&v6.ip().octets());
            buf.put_u16(v6.port());
        }
    }
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decode a frame body (the bytes after the length prefix)
pub fn decode(body: Bytes) -> Result<Frame, FrameError> {
    let total = body.len();
    if total < HEADER_LEN {
        return Err(FrameError::TooShort(total));
    }

    let mut buf = body;
    let flags = buf.get_u8();
    let conid = buf.get_u16_le();

    if flags & (FLAG_KEEPALIVE | FLAG_ERR) != 0 {
        return Ok(Frame {
            flags,
            conid,
            addr: None,
            payload: Bytes::new(),
        });
    }

    let addr = if flags & FLAG_IPV6 != 0 {
        if buf.remaining() < IPV6_ADDR_LEN {
            return Err(FrameError::TooShort(total));
        }
        let mut octets = [0u8; 16];
        buf.copy_to_slice(&mut octets);
        let port = buf.get_u16();
        SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0))
    } else {
        if buf.remaining() < IPV4_ADDR_LEN {
            return Err(FrameError::TooShort(total));
        }
        let mut octets = [0u8; 4];
        buf.copy_to_slice(&mut octets);
        let port = buf.get_u16();
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(octets), port))
    };

    Ok(Frame {
        flags,
        conid,
        addr: Some(addr),
        payload: buf,
    })
}
