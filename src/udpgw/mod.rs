//! UDP gateway client
//!
//! Multiplexes UDP flows over one TCP connection to a badvpn-compatible
//! `udpgw` server reached through the SOCKS server. [`UdpGwClient`] holds
//! the protocol state and [`UdpGwHandle`] runs it on a tokio task.

mod client;
mod flows;
pub mod proto;
mod runner;

pub use client::{
    ConnState, Datagram, SendOutcome, UdpGwClient, KEEPALIVE_INTERVAL, RECONNECT_INTERVAL,
};
pub use flows::{DropReason, FlowKey, FlowTable, Outgoing};
pub use runner::{GatewayConnector, SocksGatewayConnector, UdpGwHandle};
