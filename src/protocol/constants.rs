//! Shared wire and protocol constants
//!
//! The header constants must match across client and server; both codec
//! directions in this crate read them from here.

/// Frame header magic, big-endian on the wire
pub const MAGIC: u16 = 0xBABE;

/// Fixed frame header length in bytes:
/// magic(2) + sign(1) + reserved(1) + id(8) + body_length(4)
pub const HEADER_LENGTH: usize = 16;

/// `sign` codes selecting the payload type
pub const HEARTBEAT: u8 = 0x01;
pub const PUBLISH_SERVICE: u8 = 0x02;
pub const UN_PUBLISH_SERVICE: u8 = 0x03;
pub const SUBSCRIBE_SERVICE: u8 = 0x04;
pub const ACK: u8 = 0x05;

/// Server-side reader idle limit before liveness action
pub const READER_IDLE_TIME_SECONDS: u64 = 60;

/// Unacked pushes older than this are retransmitted or dropped
pub const ACK_TIMEOUT_MILLIS: u64 = 10_000;

/// Interval of the pending-ack scanner
pub const ACK_SCAN_INTERVAL_MILLIS: u64 = 300;

/// Default provider weight
pub const DEFAULT_WEIGHT: u32 = 50;

/// Default channel-group warm-up window
pub const DEFAULT_WARM_UP_MILLIS: u64 = 10 * 60 * 1000;

/// Listen backlog for the registry acceptor
pub const DEFAULT_BACKLOG: u32 = 1024;
