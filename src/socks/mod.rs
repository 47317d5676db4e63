//! SOCKS5 module for Tunsocks
//!
//! Everything that talks to the upstream SOCKS5 server: the destination
//! and credential types, the dialer performing the client handshake, and
//! the per-relay session tasks.

mod dial;
mod session;
mod types;

pub use dial::SocksDialer;
pub use session::{SessionEvents, SessionHandle, TokioConnector};
pub use types::{Credentials, TargetAddr};
