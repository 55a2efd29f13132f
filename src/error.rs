//! Crate error types
//!
//! Protocol signals (illegal magic, illegal sign, decode failure) are fatal
//! for the connection they occur on and are handled at the connection
//! boundary; they never reach registry logic.

use std::io;

use thiserror::Error;

/// Convenience result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from the socket layer
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Connection-fatal protocol signal
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Transport-level failure
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Serializer failed to encode an outbound body
    #[error("serialization failure: {0}")]
    Serialization(String),
}

/// Signals raised by the frame decoder
///
/// Any of these fails the connection: log once, close the socket.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Header magic did not match
    #[error("illegal magic: 0x{0:04x}")]
    IllegalMagic(u16),

    /// Unknown `sign` byte in the header
    #[error("illegal sign: 0x{0:02x}")]
    IllegalSign(u8),

    /// Serializer rejected a frame body
    #[error("body decode failure: {0}")]
    Decode(String),
}

/// Transport-level errors surfaced to callers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// A channel group stayed empty across all retry attempts
    #[error("no channel available for {0}")]
    NoChannelAvailable(String),
}
