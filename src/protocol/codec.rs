//! Framed codec for the registry protocol
//!
//! Frame layout (big-endian):
//!
//! ```text
//! offset size field
//!   0    2   magic = 0xBABE
//!   2    1   sign
//!   3    1   reserved = 0x00
//!   4    8   id (0 for server pushes)
//!  12    4   body length
//!  16    …   body (serializer output)
//! ```
//!
//! The decoder is a two-state machine (header, body) and is replay-safe: it
//! consumes nothing until a complete header (respectively body) is
//! buffered, so it can be re-entered after a partial read without losing
//! state.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ProtocolError, Result};
use crate::serializer::Serializer;

use super::constants::{HEADER_LENGTH, MAGIC};
use super::message::{Acknowledge, Message, Sign};

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Message),
    Ack(Acknowledge),
}

#[derive(Debug, Clone, Copy)]
struct Header {
    sign: Sign,
    #[allow(dead_code)] // carried on the wire, unused: correlation is by body sequence
    id: u64,
    body_length: usize,
}

#[derive(Debug, Clone, Copy)]
enum DecodeState {
    Header,
    Body(Header),
}

/// Replay-safe frame decoder
pub struct Decoder {
    state: DecodeState,
    serializer: Arc<dyn Serializer>,
}

impl Decoder {
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self {
            state: DecodeState::Header,
            serializer,
        }
    }

    /// Decode the next frame out of `buf`.
    ///
    /// Returns `Ok(None)` when more bytes are needed; call again after the
    /// next read. Heartbeat frames are swallowed (logged only). Errors are
    /// connection-fatal.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Inbound>> {
        loop {
            match self.state {
                DecodeState::Header => {
                    if buf.len() < HEADER_LENGTH {
                        return Ok(None);
                    }

                    let magic = buf.get_u16();
                    if magic != MAGIC {
                        return Err(ProtocolError::IllegalMagic(magic).into());
                    }

                    let sign_byte = buf.get_u8();
                    let _reserved = buf.get_u8();
                    let id = buf.get_u64();
                    let body_length = buf.get_i32();

                    let Some(sign) = Sign::from_byte(sign_byte) else {
                        return Err(ProtocolError::IllegalSign(sign_byte).into());
                    };
                    if body_length < 0 {
                        return Err(ProtocolError::Decode(format!(
                            "negative body length: {body_length}"
                        ))
                        .into());
                    }

                    self.state = DecodeState::Body(Header {
                        sign,
                        id,
                        body_length: body_length as usize,
                    });
                }
                DecodeState::Body(header) => {
                    if buf.len() < header.body_length {
                        return Ok(None);
                    }

                    let body = buf.split_to(header.body_length).freeze();
                    self.state = DecodeState::Header;

                    match header.sign {
                        Sign::Heartbeat => {
                            tracing::debug!("heartbeat");
                            continue;
                        }
                        Sign::Publish | Sign::Unpublish | Sign::Subscribe => {
                            let mut msg = self.serializer.read_message(&body)?;
                            msg.sign = header.sign;
                            return Ok(Some(Inbound::Message(msg)));
                        }
                        Sign::Ack => {
                            let ack = self.serializer.read_ack(&body)?;
                            return Ok(Some(Inbound::Ack(ack)));
                        }
                    }
                }
            }
        }
    }
}

/// Frame encoder
///
/// Writes `id = 0` for every outbound frame; correlation relies on the
/// body-encoded sequence. This matches the wire format expected by peers.
#[derive(Clone)]
pub struct Encoder {
    serializer: Arc<dyn Serializer>,
}

impl Encoder {
    pub fn new(serializer: Arc<dyn Serializer>) -> Self {
        Self { serializer }
    }

    pub fn encode_message(&self, msg: &Message) -> Result<Bytes> {
        let body = self.serializer.write_message(msg)?;
        Ok(frame(msg.sign, &body))
    }

    pub fn encode_ack(&self, ack: &Acknowledge) -> Result<Bytes> {
        let body = self.serializer.write_ack(ack)?;
        Ok(frame(Sign::Ack, &body))
    }

    /// Empty-bodied heartbeat frame
    pub fn encode_heartbeat(&self) -> Bytes {
        frame(Sign::Heartbeat, &[])
    }
}

fn frame(sign: Sign, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LENGTH + body.len());
    buf.put_u16(MAGIC);
    buf.put_u8(sign.to_byte());
    buf.put_u8(0);
    buf.put_u64(0);
    buf.put_i32(body.len() as i32);
    buf.put_slice(body);
    buf.freeze()
}
