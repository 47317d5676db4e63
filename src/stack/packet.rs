//! IP packet inspection and UDP packet construction

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Packet, Ipv4Repr, Ipv6Packet, Ipv6Repr, TcpPacket, UdpPacket,
    UdpRepr,
};
use std::net::{IpAddr, SocketAddr};

const HOP_LIMIT: u8 = 64;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;

/// What the reactor needs to know about a packet from the TUN device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inspected<'a> {
    /// A UDP datagram
    Udp {
        /// Sender
        src: SocketAddr,
        /// Destination
        dst: SocketAddr,
        /// Datagram payload
        payload: &'a [u8],
    },
    /// A TCP segment opening a connection
    TcpSyn {
        /// Sender
        src: SocketAddr,
        /// Destination
        dst: SocketAddr,
    },
    /// Any other IPv4 packet
    OtherV4,
    /// Any other IPv6 packet
    OtherV6,
    /// Not an IP packet we can parse
    Invalid,
}

/// Classify a raw IP packet. Fragments count as "other".
pub fn inspect(packet: &[u8]) -> Inspected<'_> {
    match packet.first().map(|b| b >> 4) {
        Some(4) => inspect_v4(packet),
        Some(6) => inspect_v6(packet),
        _ => Inspected::Invalid,
    }
}

fn inspect_v4(packet: &[u8]) -> Inspected<'_> {
    let Ok(ip) = Ipv4Packet::new_checked(packet) else {
        return Inspected::Invalid;
    };
    if ip.more_frags() || ip.frag_offset() != 0 {
        return Inspected::OtherV4;
    }
    let src = IpAddr::V4(ip.src_addr());
    let dst = IpAddr::V4(ip.dst_addr());
    let protocol = ip.next_header();
    // The payload borrows `packet`, not the wrapper.
    let header_len = ip.header_len() as usize;
    let total_len = ip.total_len() as usize;
    let payload = &packet[header_len..total_len];

    transport(protocol, src, dst, payload).unwrap_or(Inspected::OtherV4)
}

fn inspect_v6(packet: &[u8]) -> Inspected<'_> {
    let Ok(ip) = Ipv6Packet::new_checked(packet) else {
        return Inspected::Invalid;
    };
    let src = IpAddr::V6(ip.src_addr());
    let dst = IpAddr::V6(ip.dst_addr());
    let protocol = ip.next_header();
    let end = IPV6_HEADER_LEN + ip.payload_len() as usize;
    let payload = &packet[IPV6_HEADER_LEN..end];

    transport(protocol, src, dst, payload).unwrap_or(Inspected::OtherV6)
}

fn transport<'a>(
    protocol: IpProtocol,
    src: IpAddr,
    dst: IpAddr,
    payload: &'a [u8],
) -> Option<Inspected<'a>> {
    match protocol {
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(payload).ok()?;
            let len = udp.len() as usize;
            Some(Inspected::Udp {
                src: SocketAddr::new(src, udp.src_port()),
                dst: SocketAddr::new(dst, udp.dst_port()),
                payload: &payload[UDP_HEADER_LEN..len],
            })
        }
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(payload).ok()?;
            (tcp.syn() && !tcp.ack()).then(|| Inspected::TcpSyn {
                src: SocketAddr::new(src, tcp.src_port()),
                dst: SocketAddr::new(dst, tcp.dst_port()),
            })
        }
        _ => None,
    }
}

/// Build an IP/UDP packet with valid checksums. Returns `None` when the
/// address families differ.
pub fn build_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    let udp_repr = UdpRepr {
        src_port: src.port(),
        dst_port: dst.port(),
    };
    let udp_len = udp_repr.header_len() + payload.len();
    let caps = ChecksumCapabilities::default();

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            let ip_repr = Ipv4Repr {
                src_addr: src_ip,
                dst_addr: dst_ip,
                next_header: IpProtocol::Udp,
                payload_len: udp_len,
                hop_limit: HOP_LIMIT,
            };
            let mut buf = vec![0u8; ip_repr.buffer_len() + udp_len];
            let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip_repr.emit(&mut ip, &caps);
            let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
            udp_repr.emit(
                &mut udp,
                &IpAddress::Ipv4(src_ip),
                &IpAddress::Ipv4(dst_ip),
                payload.len(),
                |buf| buf.copy_from_slice(payload),
                &caps,
            );
            Some(buf)
        }
        (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
            let ip_repr = Ipv6Repr {
                src_addr: src_ip,
                dst_addr: dst_ip,
                next_header: IpProtocol::Udp,
                payload_len: udp_len,
                hop_limit: HOP_LIMIT,
            };
            let mut buf = vec![0u8; ip_repr.buffer_len() + udp_len];
            let mut ip = Ipv6Packet::new_unchecked(&mut buf[..]);
            ip_repr.emit(&mut ip);
            let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
            udp_repr.emit(
                &mut udp,
                &IpAddress::Ipv6(src_ip),
                &IpAddress::Ipv6(dst_ip),
                payload.len(),
                |buf| buf.copy_from_slice(payload),
                &caps,
            );
            Some(buf)
        }
        _ => None,
    }
}
