//! TCP relay core
//!
//! One [`TcpRelay`] bridges each intercepted TCP connection to a SOCKS
//! session. Data moves in two directions through two bounded buffers:
//!
//! ```text
//! local peer --(stack)--> OutboundBuffer --(SocksSession::send)--> SOCKS
//! local peer <--(stack)-- InboundBuffer  <--(SocksSession::recv)-- SOCKS
//! ```
//!
//! Each direction has exactly one backpressure gate. A full outbound
//! buffer pauses delivery from the stack until SOCKS confirms a send; an
//! inbound chunk the local window cannot take holds back the next SOCKS
//! receive until the local peer acknowledges data.
//!
//! Half-close travels across: a FIN from the local peer shuts down the
//! SOCKS write side once buffered bytes are out, and EOF from SOCKS sends
//! FIN to the local peer once its bytes are queued. The relay goes away
//! when both directions are done, or immediately on any error.

mod arena;
mod bridge;
mod buffer;
mod manager;
#[cfg(test)]
mod mock;
mod tcp;

pub use arena::{Arena, RelayId};
pub use bridge::{SocksConnector, SocksEvent, SocksRequest, SocksSession, StackBridge, StackEvent};
pub use buffer::{InboundBuffer, OutboundBuffer};
pub use manager::{RejectReason, RelayConfig, RelayManager, SOCKS_RECV_BUF_SIZE};
pub use tcp::TcpRelay;
