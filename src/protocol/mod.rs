//! Wire protocol for session establishment.
//!
//! Three messages are exchanged, each carried in exactly one connection frame:
//!
//! ```text
//! initiator                          acceptor
//!     │── HandshakeRequest ─────────────▶│   base connection
//!     │◀──────────── HandshakeResponse ──│   (ports[])
//!     │                                   │
//!     │── DialPacket ───────────────────▶│   one per negotiated port
//!     │◀─────────────────── DialPacket ──│   echo
//! ```
//!
//! ## Frame Format
//!
//! ```text
//! ┌─────────────┬──────────────┬───────────────────────┐
//! │ Version (1) │ Length (4)   │ bincode body ...      │
//! └─────────────┴──────────────┴───────────────────────┘
//! ```

mod codec;
mod message;

pub use codec::MessageCodec;
pub use message::{DialPacket, HandshakeRequest, HandshakeResponse, Message};

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};
use crate::transport::Connection;

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 5;

/// Maximum encoded message body.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

/// Encode `msg` and send it as one frame.
pub async fn send_message(conn: &dyn Connection, msg: impl Into<Message>) -> Result<()> {
    let mut buf = BytesMut::new();
    MessageCodec::new().encode(msg.into(), &mut buf)?;
    conn.write(&buf).await?;
    Ok(())
}

/// Receive one frame and decode it as a message.
pub async fn recv_message(conn: &dyn Connection) -> Result<Message> {
    let mut buf = vec![0u8; FRAME_HEADER_SIZE + MAX_MESSAGE_SIZE];
    let n = conn.read(&mut buf).await?;

    let mut frame = BytesMut::from(&buf[..n]);
    MessageCodec::new().decode(&mut frame)?.ok_or_else(|| {
        ProtocolError::Truncated {
            need: FRAME_HEADER_SIZE,
            have: n,
        }
        .into()
    })
}

/// Verify protocol version compatibility.
pub fn is_compatible_version(version: u8) -> bool {
    version == crate::PROTOCOL_VERSION
}
