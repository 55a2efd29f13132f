//! Service registry core
//!
//! Providers publish `(service, endpoint)` records; consumers subscribe to
//! a service and receive the current full provider set, kept live by
//! version-stamped pushes with explicit acknowledgements and
//! retransmissions.
//!
//! # Architecture
//!
//! ```text
//!                      Arc<RegistryService>
//!               ┌────────────────────────────────┐
//!               │ context: service -> (version,  │
//!               │          address -> meta)      │
//!               │ subscribers: channel set       │
//!               │ messages_non_ack: pending acks │
//!               └───────────────┬────────────────┘
//!                               │
//!        ┌──────────────────────┼──────────────────────┐
//!        ▼                      ▼                      ▼
//!   [Provider]            [Subscriber]           [Subscriber]
//!   publish/unpublish     full-list push         full-list push
//!        │                      │ ACK                  │ ACK
//!        └── version bump ──────┴── AckRetransmitter ──┘
//! ```

pub mod context;
pub mod meta;
pub mod retransmit;
pub mod service;

pub use context::{ConfigWithVersion, RegistryContext, ServiceConfig, ServiceSet};
pub use meta::{Address, RegisterMeta, ServiceMeta};
pub use retransmit::AckRetransmitter;
pub use service::{MessageNonAck, RegistryService};
