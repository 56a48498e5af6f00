//! Error types for panmux.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::types::PeerAddr;

/// Result type alias for panmux operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for panmux.
#[derive(Error, Debug)]
pub enum Error {
    // Path database errors
    #[error("path lookup for {peer} failed: {reason}")]
    LookupFailed { peer: PeerAddr, reason: String },

    #[error("no path set known for {0}, refresh first")]
    NotFound(PeerAddr),

    #[error("invalid path set: {paths} paths for {connections} open connections")]
    InvalidPathSet { paths: usize, connections: usize },

    // Scheduler errors
    #[error("no connection available to {0}")]
    NoConnectionAvailable(&'static str),

    // Handshake errors
    #[error("handshake with {remote} timed out after {attempts} attempts")]
    HandshakeTimeout { remote: SocketAddr, attempts: u32 },

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    // Connection errors
    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection to {addr} failed: {reason}")]
    ConnectionFailed { addr: SocketAddr, reason: String },

    #[error("connection timeout")]
    ConnectionTimeout,

    #[error("session is shutting down")]
    Shutdown,

    #[error("no peer connected")]
    NotConnected,

    // Transport and protocol errors
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Transport layer errors.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("bind failed on {addr}: {reason}")]
    BindFailed { addr: SocketAddr, reason: String },

    #[error("address in use: {0}")]
    AddressInUse(SocketAddr),

    #[error("no listener on {0}")]
    Unreachable(SocketAddr),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    #[error("TCP error: {0}")]
    Tcp(String),

    #[error("socket error: {0}")]
    SocketError(String),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Handshake message encoding errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("invalid version: expected {expected}, got {got}")]
    InvalidVersion { expected: u8, got: u8 },

    #[error("truncated frame: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    #[error("unexpected message: expected {expected}, got {got}")]
    UnexpectedMessage { expected: &'static str, got: &'static str },

    #[error("port negotiation failed: requested {requested}, offered {offered}")]
    PortMismatch { requested: usize, offered: usize },
}

impl Error {
    /// Check if error is transient (retry on the next round).
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::LookupFailed { .. }
                | Error::HandshakeTimeout { .. }
                | Error::ConnectionTimeout
                | Error::Transport(
                    TransportError::SendFailed(_) | TransportError::ReceiveFailed(_)
                )
                | Error::Io(_)
        )
    }

    /// Check if error indicates the connection is gone.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let peer: PeerAddr = "1-ff00:0:110,[127.0.0.1]:4000".parse().unwrap();
        assert!(Error::LookupFailed { peer, reason: "down".into() }.is_recoverable());
        assert!(Error::HandshakeTimeout {
            remote: "127.0.0.1:4011".parse().unwrap(),
            attempts: 5
        }
        .is_recoverable());
        assert!(!Error::NotFound(peer).is_recoverable());
        assert!(!Error::InvalidPathSet { paths: 1, connections: 2 }.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = Error::NoConnectionAvailable("write");
        assert_eq!(err.to_string(), "no connection available to write");
    }
}
