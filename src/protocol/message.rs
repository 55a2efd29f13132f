//! Message model for the registry protocol
//!
//! A frame body is a serialized [`Message`] or [`Acknowledge`]; the header's
//! `sign` byte selects which. Payloads form a tagged sum decoded by a single
//! match on the sign.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::registry::meta::{RegisterMeta, ServiceMeta};

use super::constants;

/// Message kind carried in the frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sign {
    Heartbeat,
    Publish,
    Unpublish,
    Subscribe,
    Ack,
}

impl Sign {
    /// Wire byte for this sign
    pub const fn to_byte(self) -> u8 {
        match self {
            Sign::Heartbeat => constants::HEARTBEAT,
            Sign::Publish => constants::PUBLISH_SERVICE,
            Sign::Unpublish => constants::UN_PUBLISH_SERVICE,
            Sign::Subscribe => constants::SUBSCRIBE_SERVICE,
            Sign::Ack => constants::ACK,
        }
    }

    /// Parse a wire byte; `None` for unknown codes
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            constants::HEARTBEAT => Some(Sign::Heartbeat),
            constants::PUBLISH_SERVICE => Some(Sign::Publish),
            constants::UN_PUBLISH_SERVICE => Some(Sign::Unpublish),
            constants::SUBSCRIBE_SERVICE => Some(Sign::Subscribe),
            constants::ACK => Some(Sign::Ack),
            _ => None,
        }
    }
}

/// Typed message payload, selected by the header sign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    /// Provider record for publish/unpublish
    Register(RegisterMeta),
    /// Service identity for subscribe
    Subscribe(ServiceMeta),
    /// Full provider list pushed to subscribers
    Providers {
        service: ServiceMeta,
        list: Vec<RegisterMeta>,
    },
}

/// A protocol message
///
/// `sequence` is assigned by the sender and echoed by the receiver in ACKs.
/// `version` carries the per-service registry version on pushes; requests
/// leave it at zero. After decoding, `sign` is stamped from the frame header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub sign: Sign,
    pub sequence: u64,
    pub version: i64,
    pub data: Payload,
}

impl Message {
    pub fn publish(sequence: u64, meta: RegisterMeta) -> Self {
        Self {
            sign: Sign::Publish,
            sequence,
            version: 0,
            data: Payload::Register(meta),
        }
    }

    pub fn unpublish(sequence: u64, meta: RegisterMeta) -> Self {
        Self {
            sign: Sign::Unpublish,
            sequence,
            version: 0,
            data: Payload::Register(meta),
        }
    }

    pub fn subscribe(sequence: u64, service: ServiceMeta) -> Self {
        Self {
            sign: Sign::Subscribe,
            sequence,
            version: 0,
            data: Payload::Subscribe(service),
        }
    }

    /// Full provider-list push at `version`
    pub fn providers(
        sequence: u64,
        version: i64,
        service: ServiceMeta,
        list: Vec<RegisterMeta>,
    ) -> Self {
        Self {
            sign: Sign::Publish,
            sequence,
            version,
            data: Payload::Providers { service, list },
        }
    }
}

/// Acknowledgement of a received message, echoing its sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acknowledge {
    pub sequence: u64,
}

impl Acknowledge {
    pub fn new(sequence: u64) -> Self {
        Self { sequence }
    }
}

/// Monotonically increasing sequence source for sender-assigned sequences
#[derive(Debug, Default)]
pub struct Sequence(AtomicU64);

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next sequence value; starts at 1
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}
