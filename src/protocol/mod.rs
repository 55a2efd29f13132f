//! Framed wire protocol
//!
//! A fixed 16-byte header (magic, sign, reserved, id, body length) followed
//! by a serializer-opaque body. See [`codec`] for the framing rules and
//! [`message`] for the body model.

pub mod codec;
pub mod constants;
pub mod message;

pub use codec::{Decoder, Encoder, Inbound};
pub use message::{Acknowledge, Message, Payload, Sequence, Sign};
