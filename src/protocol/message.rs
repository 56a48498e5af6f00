//! Handshake message types.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::path::Path;
use crate::types::PeerAddr;

/// Message container exchanged during session establishment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    HandshakeRequest(HandshakeRequest),
    HandshakeResponse(HandshakeResponse),
    DialPacket(DialPacket),
}

impl Message {
    /// Short name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::HandshakeRequest(_) => "HandshakeRequest",
            Self::HandshakeResponse(_) => "HandshakeResponse",
            Self::DialPacket(_) => "DialPacket",
        }
    }

    /// Serialize to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serialize(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from bytes.
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        bincode::deserialize(data).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }

    pub fn into_request(self) -> Result<HandshakeRequest, ProtocolError> {
        match self {
            Self::HandshakeRequest(req) => Ok(req),
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "HandshakeRequest",
                got: other.name(),
            }),
        }
    }

    pub fn into_response(self) -> Result<HandshakeResponse, ProtocolError> {
        match self {
            Self::HandshakeResponse(resp) => Ok(resp),
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "HandshakeResponse",
                got: other.name(),
            }),
        }
    }

    pub fn into_dial_packet(self) -> Result<DialPacket, ProtocolError> {
        match self {
            Self::DialPacket(packet) => Ok(packet),
            other => Err(ProtocolError::UnexpectedMessage {
                expected: "DialPacket",
                got: other.name(),
            }),
        }
    }
}

/// Opens a session: sent by the initiator on the base connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Initiator's own listening address.
    pub local_addr: PeerAddr,
    /// Number of parallel connections requested.
    pub num_ports: u16,
}

/// Acceptor's answer, listing the ports it now listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    pub local_addr: PeerAddr,
    pub num_ports: u16,
    /// One port per requested slot.
    pub ports: Vec<u16>,
}

/// Per-connection handshake, sent by the dialer and echoed by the acceptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DialPacket {
    pub local_addr: PeerAddr,
    pub path: Option<Path>,
}

impl From<HandshakeRequest> for Message {
    fn from(m: HandshakeRequest) -> Self {
        Self::HandshakeRequest(m)
    }
}

impl From<HandshakeResponse> for Message {
    fn from(m: HandshakeResponse) -> Self {
        Self::HandshakeResponse(m)
    }
}

impl From<DialPacket> for Message {
    fn from(m: DialPacket) -> Self {
        Self::DialPacket(m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer() -> PeerAddr {
        "1-ff00:0:110,[127.0.0.1]:4000".parse().unwrap()
    }

    #[test]
    fn test_response_bytes() {
        let msg: Message = HandshakeResponse {
            local_addr: peer(),
            num_ports: 2,
            ports: vec![4011, 4022],
        }
        .into();

        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        let resp = decoded.into_response().unwrap();
        assert_eq!(resp.ports, vec![4011, 4022]);
        assert_eq!(resp.local_addr, peer());
    }

    #[test]
    fn test_unexpected_message() {
        let msg: Message = DialPacket {
            local_addr: peer(),
            path: None,
        }
        .into();
        let err = msg.into_request().unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedMessage {
                expected: "HandshakeRequest",
                got: "DialPacket"
            }
        ));
    }

    #[test]
    fn test_garbage_fails_to_decode() {
        assert!(Message::from_bytes(&[0xff, 0xff, 0xff, 0xff, 0x01]).is_err());
    }
}
