//! # Tunsocks - TUN to SOCKS5 relay
//!
//! Tunsocks terminates the IP traffic of a TUN device in a user-space
//! TCP/IP stack and re-originates it through a SOCKS5 proxy, so every
//! program routed through the interface is proxied without knowing it.
//!
//! ## Features
//!
//! - **Transparent TCP**: each intercepted connection becomes one SOCKS5
//!   CONNECT, with flow control and half-close in both directions
//! - **UDP over udpgw**: datagrams are multiplexed over a single
//!   connection to a badvpn-compatible UDP gateway
//! - **Optional authentication**: username/password, password file, and
//!   per-source usernames
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tunsocks::config::load_config;
//! use tunsocks::tunnel::run_tunnel;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config("tunsocks.toml")?;
//!     let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
//!
//!     run_tunnel(config, shutdown_rx).await
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! TUN device -> smoltcp stack -> TcpRelay -> SOCKS session -> SOCKS server
//!            \-> UDP datagrams -> udpgw client ----------------^
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod error;
pub mod relay;
pub mod socks;
pub mod stack;
pub mod transport;
pub mod tunnel;
pub mod udpgw;

// Re-export commonly used items
pub use config::{load_config, Config};
pub use error::{RelayError, Socks5Error, TunsocksError, TunsocksResult};
pub use tunnel::run_tunnel;

/// Version of the Tunsocks library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Name of the application
pub const NAME: &str = env!("CARGO_PKG_NAME");
