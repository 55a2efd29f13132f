//! Body serialization
//!
//! The wire format treats frame bodies as opaque serializer output. The
//! serializer stays behind a trait so the framing layer never depends on a
//! concrete encoding; [`BincodeSerializer`] is the default used by the
//! server and the consumer dispatcher.

use std::sync::Arc;

use crate::client::MessageWrapper;
use crate::error::{Error, ProtocolError, Result};
use crate::protocol::message::{Acknowledge, Message};

/// Encodes and decodes frame bodies
pub trait Serializer: Send + Sync + 'static {
    fn write_message(&self, msg: &Message) -> Result<Vec<u8>>;
    fn read_message(&self, bytes: &[u8]) -> Result<Message>;

    fn write_ack(&self, ack: &Acknowledge) -> Result<Vec<u8>>;
    fn read_ack(&self, bytes: &[u8]) -> Result<Acknowledge>;

    /// Consumer-side request body for the dispatcher
    fn write_request(&self, request: &MessageWrapper) -> Result<Vec<u8>>;
}

/// Default serializer backed by `bincode` (fixed int encoding, so sequence
/// and version fields have a stable width on the wire).
#[derive(Debug, Default, Clone)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub const fn new() -> Self {
        Self
    }

    fn config() -> impl bincode::config::Config {
        bincode::config::standard().with_fixed_int_encoding()
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(value, Self::config())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        bincode::serde::decode_from_slice(bytes, Self::config())
            .map(|(value, _)| value)
            .map_err(|e| ProtocolError::Decode(e.to_string()).into())
    }
}

impl Serializer for BincodeSerializer {
    fn write_message(&self, msg: &Message) -> Result<Vec<u8>> {
        Self::encode(msg)
    }

    fn read_message(&self, bytes: &[u8]) -> Result<Message> {
        Self::decode(bytes)
    }

    fn write_ack(&self, ack: &Acknowledge) -> Result<Vec<u8>> {
        Self::encode(ack)
    }

    fn read_ack(&self, bytes: &[u8]) -> Result<Acknowledge> {
        Self::decode(bytes)
    }

    fn write_request(&self, request: &MessageWrapper) -> Result<Vec<u8>> {
        Self::encode(request)
    }
}

/// Shared handle to the process-wide serializer
pub fn default_serializer() -> Arc<dyn Serializer> {
    Arc::new(BincodeSerializer::new())
}
