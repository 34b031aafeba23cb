use crate::envelope::SampleEnvelope;
use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod framing;
pub mod memory;
pub mod tcp_socket;
pub mod unix_domain_socket;

pub use memory::{MemoryBus, MemoryChannel};
pub use tcp_socket::TcpSocketChannel;
pub use unix_domain_socket::UnixDomainSocketChannel;

/// Identifier the channel assigns to each matched peer.
pub type PeerId = u64;

/// Notifications delivered from a channel's receive path.
///
/// Receive tasks only ever enqueue these; all protocol state is mutated by
/// the task that drains the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    PeerMatched(PeerId),
    PeerUnmatched(PeerId),
    /// A raw frame, decoded by the consumer.
    Frame(PeerId, Vec<u8>),
}

/// Send-side failures.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("send timed out under backpressure")]
    BackpressureTimeout,

    #[error("no matched peers")]
    NoPeers,

    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

/// Which end of the measurement a channel endpoint serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionRole {
    /// Sends data and pings; listens for subscribers on stream transports.
    Publisher,
    /// Receives data and echoes; connects to publishers on stream transports.
    Subscriber,
}

impl ConnectionRole {
    pub fn opposite(self) -> Self {
        match self {
            ConnectionRole::Publisher => ConnectionRole::Subscriber,
            ConnectionRole::Subscriber => ConnectionRole::Publisher,
        }
    }
}

/// Transport configuration for message channels
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub buffer_size: usize,
    pub host: String,
    pub port: u16,
    /// Publisher addresses a TCP subscriber connects to.
    pub peers: Vec<String>,
    pub socket_path: PathBuf,
    /// Depth of the event queue between receive tasks and the protocol task.
    pub event_queue_depth: usize,
    pub write_timeout: Duration,
    /// How long a subscriber keeps retrying a connection to a publisher.
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_size: 65536,
            host: "127.0.0.1".to_string(),
            port: 7400,
            peers: Vec::new(),
            socket_path: PathBuf::from("/tmp/pubsub_perftest.sock"),
            event_queue_depth: 1024,
            write_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

/// Asynchronous, identity-tagged message channel.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Start as the listening side (publishers on stream transports).
    async fn start_server(&mut self, config: &TransportConfig) -> Result<()>;

    /// Start as the connecting side (subscribers on stream transports).
    async fn start_client(&mut self, config: &TransportConfig) -> Result<()>;

    /// Deliver `envelope` to every matched peer.
    async fn send(&mut self, envelope: &SampleEnvelope) -> Result<(), IpcError>;

    /// Hand out the event queue. Returns `None` once it has been taken.
    fn take_events(&mut self) -> Option<mpsc::Receiver<ChannelEvent>>;

    /// Close every connection.
    async fn close(&mut self) -> Result<()>;

    /// Get channel name for identification
    fn name(&self) -> &'static str;
}

/// Start `channel` on the side matching `role`.
pub async fn start_channel(
    channel: &mut dyn MessageChannel,
    role: ConnectionRole,
    config: &TransportConfig,
) -> Result<()> {
    match role {
        ConnectionRole::Publisher => channel.start_server(config).await,
        ConnectionRole::Subscriber => channel.start_client(config).await,
    }
}

/// Channel factory for the stream transports
pub struct ChannelFactory;

impl ChannelFactory {
    /// Create a new channel instance based on the transport
    pub fn create(transport: crate::cli::TransportKind) -> Result<Box<dyn MessageChannel>> {
        use crate::cli::TransportKind;

        match transport {
            TransportKind::Tcp => Ok(Box::new(TcpSocketChannel::new())),
            TransportKind::Uds => Ok(Box::new(UnixDomainSocketChannel::new())),
            TransportKind::Memory => Err(anyhow::anyhow!(
                "memory channels are joined through a MemoryBus, not created standalone"
            )),
        }
    }
}
