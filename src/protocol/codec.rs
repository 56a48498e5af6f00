//! Message framing.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::{Message, FRAME_HEADER_SIZE, MAX_MESSAGE_SIZE};
use crate::error::ProtocolError;
use crate::PROTOCOL_VERSION;

/// Tokio codec for handshake messages.
///
/// Each frame is `version (1) | length (4, big-endian) | bincode body`.
pub struct MessageCodec {
    max_message_size: usize,
}

impl MessageCodec {
    /// Create a new codec with default settings.
    pub fn new() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }

    /// Create a codec with custom max message size.
    pub fn with_max_message(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = crate::Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> std::result::Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let version = src[0];
        if version != PROTOCOL_VERSION {
            return Err(ProtocolError::InvalidVersion {
                expected: PROTOCOL_VERSION,
                got: version,
            }
            .into());
        }

        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                max: self.max_message_size,
            }
            .into());
        }

        let total_len = FRAME_HEADER_SIZE + len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_SIZE);
        let body = src.split_to(len);
        Ok(Some(Message::from_bytes(&body)?))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = crate::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> std::result::Result<(), Self::Error> {
        let body = item.to_bytes()?;
        if body.len() > self.max_message_size {
            return Err(ProtocolError::MessageTooLarge {
                size: body.len(),
                max: self.max_message_size,
            }
            .into());
        }

        dst.reserve(FRAME_HEADER_SIZE + body.len());
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);

        Ok(())
    }
}
