//! Listening socket setup for the TCP transport.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};

use super::TransportConfig;
use crate::error::{Result, TransportError};

/// Create a bound, non-blocking TCP socket ready for `listen`.
///
/// Buffer sizes and `SO_REUSEADDR` come from `config`.
pub fn bind_tcp_socket(addr: SocketAddr, config: &TransportConfig) -> Result<Socket> {
    let domain = if addr.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| TransportError::SocketError(e.to_string()))?;

    socket
        .set_send_buffer_size(config.send_buffer_size)
        .map_err(|e| TransportError::SocketError(format!("set send buffer: {e}")))?;
    socket
        .set_recv_buffer_size(config.recv_buffer_size)
        .map_err(|e| TransportError::SocketError(format!("set recv buffer: {e}")))?;
    if config.reuse_addr {
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::SocketError(format!("set reuse addr: {e}")))?;
    }

    socket.bind(&addr.into()).map_err(|e| {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            TransportError::AddressInUse(addr)
        } else {
            TransportError::BindFailed {
                addr,
                reason: e.to_string(),
            }
        }
    })?;

    socket
        .set_nonblocking(true)
        .map_err(|e| TransportError::SocketError(e.to_string()))?;

    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn test_bind_ephemeral_port() {
        let socket =
            bind_tcp_socket("127.0.0.1:0".parse().unwrap(), &TransportConfig::default()).unwrap();
        let local = socket.local_addr().unwrap().as_socket().unwrap();
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn test_bind_reports_address_in_use() {
        let config = TransportConfig {
            reuse_addr: false,
            ..Default::default()
        };
        let first = bind_tcp_socket("127.0.0.1:0".parse().unwrap(), &config).unwrap();
        first.listen(8).unwrap();
        let taken = first.local_addr().unwrap().as_socket().unwrap();

        let err = bind_tcp_socket(taken, &config).unwrap_err();
        assert!(matches!(
            err,
            Error::Transport(TransportError::AddressInUse(addr)) if addr == taken
        ));
    }
}
