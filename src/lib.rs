//! registry-rs: service registry with a framed liveness protocol
//!
//! Providers publish `(service, endpoint)` records to a central registry;
//! consumers subscribe to a service and receive the current full provider
//! set, kept live by version-stamped pushes with explicit acknowledgements
//! and retransmissions. Idle connections are detected on a single shared
//! hashed timing wheel.
//!
//! # Components
//!
//! - [`protocol`]: 16-byte framed wire protocol with a replay-safe decoder
//! - [`registry`]: versioned registry state, fan-out, ack retransmission
//! - [`transport`]: connection handles and round-robin channel groups
//! - [`time`]: clock, hashed timing wheel, idle-state detection
//! - [`server`]: TCP acceptor wiring it all together
//! - [`client`]: consumer directory and broadcast dispatch
//!
//! # Example
//!
//! ```no_run
//! use registry_rs::server::{RegistryServer, ServerConfig};
//!
//! # async fn example() -> registry_rs::error::Result<()> {
//! let config = ServerConfig::with_addr("0.0.0.0:20001".parse().unwrap());
//! let server = RegistryServer::new(config);
//! server.run().await
//! # }
//! ```

pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod serializer;
pub mod server;
pub mod stats;
pub mod time;
pub mod transport;

pub use error::{Error, Result};
pub use registry::{Address, RegisterMeta, RegistryService, ServiceMeta};
pub use server::{RegistryServer, ServerConfig};
