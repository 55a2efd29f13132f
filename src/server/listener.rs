//! Registry server listener
//!
//! Binds the TCP acceptor and wires each accepted connection into the
//! registry core: a replay-safe frame decoder feeding the registry service,
//! a writer task draining the channel's egress queue, and an idle-state
//! checker on the shared timing wheel whose trigger closes connections that
//! stay read-idle.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::codec::Decoder;
use crate::registry::retransmit::AckRetransmitter;
use crate::registry::service::RegistryService;
use crate::serializer::{default_serializer, Serializer};
use crate::time::idle::{IdleEvent, IdleListener, IdleStateChecker};
use crate::time::{Clock, TimingWheel};
use crate::transport::channel::{Channel, Outbound};

use super::config::ServerConfig;

/// Registry server: acceptor plus the shared singletons (timing wheel,
/// registry service with its pending-ack map)
pub struct RegistryServer {
    config: ServerConfig,
    serializer: Arc<dyn Serializer>,
    service: Arc<RegistryService>,
    clock: Clock,
    wheel: TimingWheel,
    next_channel_id: AtomicU64,
}

impl RegistryServer {
    /// Server with the default bincode serializer
    pub fn new(config: ServerConfig) -> Self {
        Self::with_serializer(config, default_serializer())
    }

    pub fn with_serializer(config: ServerConfig, serializer: Arc<dyn Serializer>) -> Self {
        let clock = Clock::new();
        let wheel = TimingWheel::new(clock, config.wheel_tick, config.wheel_slots);
        let service = RegistryService::new(Arc::clone(&serializer), clock);

        Self {
            config,
            serializer,
            service,
            clock,
            wheel,
            next_channel_id: AtomicU64::new(1),
        }
    }

    /// The registry state machine behind this server
    pub fn service(&self) -> &Arc<RegistryService> {
        &self.service
    }

    /// Run the server. Blocks until the accept loop fails.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind()?;
        tracing::info!(addr = %self.config.bind_addr, "registry server listening");

        let scanner = self.spawn_scanner();
        let result = self.accept_loop(&listener).await;
        scanner.abort();
        result
    }

    /// Run the server until `shutdown` resolves
    pub async fn run_until<F>(&self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()>,
    {
        let listener = self.bind()?;
        tracing::info!(addr = %self.config.bind_addr, "registry server listening");

        let scanner = self.spawn_scanner();
        let result = tokio::select! {
            _ = shutdown => {
                tracing::info!("shutdown signal received");
                Ok(())
            }
            result = self.accept_loop(&listener) => result,
        };
        scanner.abort();
        result
    }

    /// Stop the shared timing wheel. Call once the server is done.
    pub fn shutdown(&self) {
        self.wheel.shutdown();
    }

    fn spawn_scanner(&self) -> tokio::task::JoinHandle<()> {
        AckRetransmitter::with_timing(
            Arc::clone(&self.service),
            self.config.ack_timeout,
            self.config.ack_scan_interval,
        )
        .spawn()
    }

    /// Bind the listen socket with the configured options
    fn bind(&self) -> Result<TcpListener> {
        let addr = self.config.bind_addr;
        let domain = if addr.is_ipv6() {
            Domain::IPV6
        } else {
            Domain::IPV4
        };

        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        if self.config.reuse_addr {
            socket.set_reuse_address(true)?;
        }
        socket.bind(&addr.into())?;
        socket.listen(self.config.backlog as i32)?;
        socket.set_nonblocking(true)?;

        Ok(TcpListener::from_std(socket.into())?)
    }

    async fn accept_loop(&self, listener: &TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    self.handle_connection(socket, peer_addr);
                }
                Err(e) => {
                    tracing::error!(error = %e, "failed to accept connection");
                }
            }
        }
    }

    fn handle_connection(&self, socket: TcpStream, peer_addr: SocketAddr) {
        if let Err(e) = self.configure_socket(&socket) {
            tracing::error!(peer = %peer_addr, error = %e, "failed to configure socket");
            return;
        }

        let id = self.next_channel_id.fetch_add(1, Ordering::Relaxed);
        self.service.metrics().incr_connections();
        tracing::debug!(channel = id, peer = %peer_addr, "new connection");

        let (channel, egress_rx) = Channel::new(id, Some(peer_addr));
        let checker = IdleStateChecker::new(
            self.wheel.clone(),
            self.clock,
            &channel,
            Arc::new(AcceptorIdleTrigger),
            self.config.reader_idle,
            self.config.writer_idle,
            self.config.all_idle,
        );
        checker.initialize();

        let (read_half, write_half) = socket.into_split();

        tokio::spawn(run_writer(
            write_half,
            egress_rx,
            checker.clone(),
            Arc::clone(&channel),
        ));
        tokio::spawn(run_connection(
            read_half,
            channel,
            Arc::clone(&self.service),
            Arc::clone(&self.serializer),
            checker,
            self.config.read_buffer_size,
        ));
    }

    fn configure_socket(&self, socket: &TcpStream) -> std::io::Result<()> {
        if self.config.tcp_nodelay {
            socket.set_nodelay(true)?;
        }
        if self.config.reuse_addr {
            SockRef::from(socket).set_reuse_address(true)?;
        }
        Ok(())
    }
}

/// Closes connections that stay read-idle past the configured limit
struct AcceptorIdleTrigger;

impl IdleListener for AcceptorIdleTrigger {
    fn on_idle(&self, channel: &Arc<Channel>, event: IdleEvent) -> Result<()> {
        if event.is_reader_idle() {
            tracing::warn!(channel = channel.id(), ?event, "connection read-idle, closing");
            channel.close();
        }
        Ok(())
    }
}

/// Drain the channel's egress queue into the socket, FIFO. Completion
/// listeners and the idle checker's writer activity fire only after the
/// bytes actually reached the socket.
async fn run_writer(
    mut write_half: OwnedWriteHalf,
    mut egress_rx: mpsc::UnboundedReceiver<Outbound>,
    checker: IdleStateChecker,
    channel: Arc<Channel>,
) {
    while let Some(item) = egress_rx.recv().await {
        match item {
            Outbound::Frame { bytes, listener } => match write_half.write_all(&bytes).await {
                Ok(()) => {
                    checker.on_write();
                    if let Some(listener) = listener {
                        listener(true);
                    }
                }
                Err(e) => {
                    tracing::debug!(channel = channel.id(), error = %e, "write failed");
                    if let Some(listener) = listener {
                        listener(false);
                    }
                    channel.close();
                    break;
                }
            },
            Outbound::Close => break,
        }
    }
    let _ = write_half.shutdown().await;
}

/// Per-connection read loop: bytes -> decoder -> registry service
async fn run_connection(
    mut read_half: OwnedReadHalf,
    channel: Arc<Channel>,
    service: Arc<RegistryService>,
    serializer: Arc<dyn Serializer>,
    checker: IdleStateChecker,
    read_buffer_size: usize,
) {
    let mut decoder = Decoder::new(serializer);
    let mut buf = BytesMut::with_capacity(read_buffer_size);

    loop {
        tokio::select! {
            read = read_half.read_buf(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(_) => {
                        checker.on_read();
                        if !drain_frames(&mut decoder, &mut buf, &service, &channel) {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(channel = channel.id(), error = %e, "read failed");
                        break;
                    }
                }
            }
            _ = channel.closed() => break,
        }
    }

    tracing::debug!(channel = channel.id(), "connection closed");
    channel.close();
    service.channel_inactive(&channel);
    checker.destroy();
}

/// Decode every complete frame in `buf`. Returns `false` when the
/// connection must close (protocol violation).
fn drain_frames(
    decoder: &mut Decoder,
    buf: &mut BytesMut,
    service: &Arc<RegistryService>,
    channel: &Arc<Channel>,
) -> bool {
    loop {
        match decoder.decode(buf) {
            Ok(Some(inbound)) => {
                if let Err(e) = service.process_inbound(inbound, channel) {
                    // Handler failures are logged against the connection;
                    // the connection itself stays up.
                    tracing::error!(channel = channel.id(), error = %e, "handler failed");
                }
            }
            Ok(None) => return true,
            Err(e) => {
                tracing::error!(channel = channel.id(), error = %e, "protocol violation, closing");
                channel.close();
                return false;
            }
        }
    }
}
