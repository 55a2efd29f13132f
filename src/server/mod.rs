//! Registry server: configuration and TCP acceptor

pub mod config;
pub mod listener;

pub use config::ServerConfig;
pub use listener::RegistryServer;
