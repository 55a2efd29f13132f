//! Transport-facing pieces: connection handles and channel groups
//!
//! The underlying TCP transport is an external collaborator; the registry
//! core only sees [`Channel`] handles with non-blocking egress queues.

pub mod channel;
pub mod group;

pub use channel::{Attributes, Channel, CloseListener, Outbound, WriteListener};
pub use group::ChannelGroup;
