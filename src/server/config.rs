//! Server configuration

use std::net::SocketAddr;
use std::time::Duration;

use crate::protocol::constants::{
    ACK_SCAN_INTERVAL_MILLIS, ACK_TIMEOUT_MILLIS, DEFAULT_BACKLOG, READER_IDLE_TIME_SECONDS,
};

/// Registry server configuration options
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: SocketAddr,

    /// Listen backlog
    pub backlog: u32,

    /// Set `SO_REUSEADDR` on the listener and on accepted sockets
    pub reuse_addr: bool,

    /// Enable `TCP_NODELAY` on accepted sockets
    pub tcp_nodelay: bool,

    /// Reader idle limit; the acceptor closes connections that stay
    /// read-idle past it. Zero disables.
    pub reader_idle: Duration,

    /// Writer idle limit (disabled by default)
    pub writer_idle: Duration,

    /// All-idle limit (disabled by default)
    pub all_idle: Duration,

    /// How long a push may stay unacknowledged before the scanner acts
    pub ack_timeout: Duration,

    /// Interval of the pending-ack scanner
    pub ack_scan_interval: Duration,

    /// Tick duration of the shared timing wheel
    pub wheel_tick: Duration,

    /// Slot count of the shared timing wheel (rounded up to a power of two)
    pub wheel_slots: usize,

    /// Per-connection read buffer size
    pub read_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:20001".parse().expect("valid default bind address"),
            backlog: DEFAULT_BACKLOG,
            reuse_addr: true,
            tcp_nodelay: true,
            reader_idle: Duration::from_secs(READER_IDLE_TIME_SECONDS),
            writer_idle: Duration::ZERO,
            all_idle: Duration::ZERO,
            ack_timeout: Duration::from_millis(ACK_TIMEOUT_MILLIS),
            ack_scan_interval: Duration::from_millis(ACK_SCAN_INTERVAL_MILLIS),
            wheel_tick: Duration::from_millis(100),
            wheel_slots: 512,
            read_buffer_size: 64 * 1024,
        }
    }
}

impl ServerConfig {
    /// Create a config with a custom bind address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the bind address
    pub fn bind(mut self, addr: SocketAddr) -> Self {
        self.bind_addr = addr;
        self
    }

    /// Set the reader idle limit
    pub fn reader_idle(mut self, idle: Duration) -> Self {
        self.reader_idle = idle;
        self
    }

    /// Set the ack timeout
    pub fn ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Set the pending-ack scan interval
    pub fn ack_scan_interval(mut self, interval: Duration) -> Self {
        self.ack_scan_interval = interval;
        self
    }

    /// Set the listen backlog
    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }
}
