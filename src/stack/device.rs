//! In-memory packet device for smoltcp.
//!
//! Packets read from the TUN device are queued with
//! [`TunDevice::inject_rx`] and consumed by smoltcp on the next poll;
//! packets smoltcp emits land in the transmit queue until the reactor
//! writes them to the TUN device. `Medium::Ip`, so there is no link
//! layer framing.

use smoltcp::phy::{Checksum, ChecksumCapabilities, Device, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use std::collections::VecDeque;

/// A smoltcp device backed by two packet queues.
pub struct TunDevice {
    rx_queue: VecDeque<Vec<u8>>,
    tx_queue: VecDeque<Vec<u8>>,
    mtu: usize,
}

impl TunDevice {
    /// Create a device with the given MTU
    pub fn new(mtu: usize) -> Self {
        Self {
            rx_queue: VecDeque::with_capacity(64),
            tx_queue: VecDeque::with_capacity(64),
            mtu,
        }
    }

    /// Queue a packet read from the TUN device
    pub fn inject_rx(&mut self, packet: Vec<u8>) {
        self.rx_queue.push_back(packet);
    }

    /// Queue a packet built outside smoltcp for the TUN device
    pub fn push_tx(&mut self, packet: Vec<u8>) {
        self.tx_queue.push_back(packet);
    }

    /// Take every packet bound for the TUN device
    pub fn drain_tx(&mut self) -> impl Iterator<Item = Vec<u8>> + '_ {
        self.tx_queue.drain(..)
    }
}

impl Device for TunDevice {
    type RxToken<'a> = RxToken;
    type TxToken<'a> = TxToken<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let buffer = self.rx_queue.pop_front()?;
        Some((
            RxToken { buffer },
            TxToken {
                tx_queue: &mut self.tx_queue,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(TxToken {
            tx_queue: &mut self.tx_queue,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps.checksum = ChecksumCapabilities::default();
        caps.checksum.ipv4 = Checksum::Both;
        caps.checksum.tcp = Checksum::Both;
        caps.checksum.udp = Checksum::Both;
        caps
    }
}

/// Receive token owning one queued packet.
pub struct RxToken {
    buffer: Vec<u8>,
}

impl smoltcp::phy::RxToken for RxToken {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        f(&self.buffer)
    }
}

/// Transmit token appending to the transmit queue.
pub struct TxToken<'a> {
    tx_queue: &'a mut VecDeque<Vec<u8>>,
}

impl<'a> smoltcp::phy::TxToken for TxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        self.tx_queue.push_back(buffer);
        result
    }
}

impl std::fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunDevice")
            .field("mtu", &self.mtu)
            .field("rx_queue_len", &self.rx_queue.len())
            .field("tx_queue_len", &self.tx_queue.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smoltcp::phy::{RxToken as _, TxToken as _};

    #[test]
    fn test_receive_pairs_rx_with_tx() {
        let mut dev = TunDevice::new(1500);
        assert!(dev.receive(Instant::ZERO).is_none());

        dev.inject_rx(vec![0x45, 0, 0, 20]);

        let (rx, tx) = dev.receive(Instant::ZERO).unwrap();
        assert_eq!(rx.consume(|buf| buf.to_vec()), vec![0x45, 0, 0, 20]);
        tx.consume(3, |buf| buf.copy_from_slice(&[1, 2, 3]));

        assert!(dev.receive(Instant::ZERO).is_none());
        assert_eq!(dev.drain_tx().collect::<Vec<_>>(), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn test_push_tx_keeps_order() {
        let mut dev = TunDevice::new(1500);
        dev.transmit(Instant::ZERO)
            .unwrap()
            .consume(1, |buf| buf[0] = 1);
        dev.push_tx(vec![2]);

        let packets: Vec<_> = dev.drain_tx().collect();
        assert_eq!(packets, vec![vec![1], vec![2]]);
        assert_eq!(dev.drain_tx().count(), 0);
    }

    #[test]
    fn test_capabilities() {
        let dev = TunDevice::new(1400);
        let caps = dev.capabilities();
        assert_eq!(caps.medium, Medium::Ip);
        assert_eq!(caps.max_transmission_unit, 1400);
    }
}
