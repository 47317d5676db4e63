//! Embedded TCP/IP stack
//!
//! A smoltcp interface in IP medium that terminates TCP connections to
//! any destination, plus the helpers the reactor uses to pick UDP out of
//! the packet stream and to build UDP replies.

mod device;
mod netstack;
pub mod packet;

pub use device::TunDevice;
pub use netstack::{Accepted, NetStack, StackConfig};
pub use packet::{build_udp, inspect, Inspected};
