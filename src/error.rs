//! Error types for Tunsocks
//!
//! This module defines all custom error types used throughout the application.

use std::io;
use thiserror::Error;

/// Main error type for Tunsocks operations
#[derive(Error, Debug)]
pub enum TunsocksError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// SOCKS5 protocol error
    #[error("SOCKS5 error: {0}")]
    Socks5(#[from] Socks5Error),

    /// Embedded stack error
    #[error("Stack error: {0}")]
    Stack(#[from] StackError),

    /// UDP gateway error
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Timeout error
    #[error("Timeout: {0}")]
    Timeout(String),
}

/// SOCKS5 specific errors
#[derive(Error, Debug)]
pub enum Socks5Error {
    /// Handshake with the SOCKS server failed
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// Could not reach the SOCKS server
    #[error("Cannot reach SOCKS server {0}")]
    Unreachable(String),
}

/// Errors reported by the embedded stack for a single connection
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StackError {
    /// The connection handle no longer refers to a live socket
    #[error("Unknown connection handle")]
    UnknownHandle,

    /// The socket cannot take outbound data in its current state
    #[error("Socket not writable (state={0})")]
    NotWritable(&'static str),
}

/// Reasons a TCP relay is aborted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The local connection failed or was reset
    #[error("local connection error")]
    LocalReset,

    /// The SOCKS session reported an error
    #[error("SOCKS error: {0}")]
    Socks(String),

    /// The SOCKS session task is gone
    #[error("SOCKS session gone")]
    SessionGone,

    /// The SOCKS peer closed before the session was established
    #[error("SOCKS closed before connect")]
    ClosedBeforeUp,

    /// Writing to the stack failed
    #[error("stack send failed: {0}")]
    Stack(#[from] StackError),

    /// Data is waiting but the stack accepts nothing and has nothing in flight
    #[error("stack window stalled with nothing in flight")]
    Stalled,

    /// Process shutdown
    #[error("shutting down")]
    Shutdown,
}

/// Malformed UDP gateway frames
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    /// Frame shorter than its header
    #[error("Frame too short: {0} bytes")]
    TooShort(usize),

    /// Datagram does not fit in a frame
    #[error("Payload too large: {0} bytes")]
    TooLarge(usize),
}

/// Result type alias for Tunsocks operations
pub type TunsocksResult<T> = Result<T, TunsocksError>;
