use super::framing::PeerSet;
use super::{ChannelEvent, IpcError, MessageChannel, TransportConfig};
use crate::envelope::SampleEnvelope;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delay between connection attempts while a publisher is not yet listening.
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// TCP channel: publishers listen, subscribers connect to every publisher.
pub struct TcpSocketChannel {
    peers: Option<PeerSet<OwnedWriteHalf>>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    accept_task: Option<JoinHandle<()>>,
    local_addr: Option<SocketAddr>,
    has_warned_backpressure: bool,
}

impl Default for TcpSocketChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocketChannel {
    pub fn new() -> Self {
        Self {
            peers: None,
            events: None,
            accept_task: None,
            local_addr: None,
            has_warned_backpressure: false,
        }
    }

    /// Address the server is bound to, useful when binding port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn init_peers(&mut self, config: &TransportConfig) -> PeerSet<OwnedWriteHalf> {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_depth);
        let peers = PeerSet::new(events_tx, config.write_timeout);
        self.peers = Some(peers.clone());
        self.events = Some(events_rx);
        peers
    }

    /// Apply low-latency socket options.
    fn configure_stream(stream: &TcpStream, buffer_size: usize) -> std::io::Result<()> {
        let socket = socket2::SockRef::from(stream);
        socket.set_nodelay(true)?;
        socket.set_recv_buffer_size(buffer_size)?;
        socket.set_send_buffer_size(buffer_size)?;
        Ok(())
    }

    async fn connect_with_retry(addr: &str, connect_timeout: Duration) -> Result<TcpStream> {
        let deadline = tokio::time::Instant::now() + connect_timeout;
        loop {
            match TcpStream::connect(addr).await {
                Ok(stream) => return Ok(stream),
                Err(e) if tokio::time::Instant::now() < deadline => {
                    debug!("Publisher {} not reachable yet: {}", addr, e);
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Failed to connect to {}", addr));
                }
            }
        }
    }
}

#[async_trait]
impl MessageChannel for TcpSocketChannel {
    async fn start_server(&mut self, config: &TransportConfig) -> Result<()> {
        let addr = format!("{}:{}", config.host, config.port);
        debug!("Starting TCP publisher endpoint on: {}", addr);

        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        let local_addr = listener.local_addr()?;
        self.local_addr = Some(local_addr);
        info!("TCP publisher listening on {}", local_addr);

        let peers = self.init_peers(config);
        let buffer_size = config.buffer_size;

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, client_addr)) => {
                        debug!("Accepted TCP subscriber from {}", client_addr);
                        if let Err(e) = Self::configure_stream(&stream, buffer_size) {
                            warn!("Failed to set socket options for {}: {}", client_addr, e);
                        }
                        let (reader, writer) = stream.into_split();
                        peers.attach(reader, writer).await;
                    }
                    Err(e) => {
                        warn!("TCP accept failed: {}", e);
                        break;
                    }
                }
            }
        }));

        Ok(())
    }

    async fn start_client(&mut self, config: &TransportConfig) -> Result<()> {
        let targets = if config.peers.is_empty() {
            vec![format!("{}:{}", config.host, config.port)]
        } else {
            config.peers.clone()
        };

        let peers = self.init_peers(config);
        for target in &targets {
            debug!("Connecting TCP subscriber to {}", target);
            let stream = Self::connect_with_retry(target, config.connect_timeout).await?;
            Self::configure_stream(&stream, config.buffer_size)?;
            let (reader, writer) = stream.into_split();
            peers.attach(reader, writer).await;
            info!("TCP subscriber connected to {}", target);
        }
        Ok(())
    }

    async fn send(&mut self, envelope: &SampleEnvelope) -> Result<(), IpcError> {
        let peers = self
            .peers
            .as_ref()
            .ok_or_else(|| IpcError::Generic(anyhow!("Channel not started")))?;
        let frame = envelope.to_bytes()?;

        match peers.broadcast(&frame).await {
            Err(IpcError::BackpressureTimeout) => {
                if !self.has_warned_backpressure {
                    warn!(
                        "TCP send timed out due to backpressure. \
                        This will significantly impact latency and throughput measurements."
                    );
                    self.has_warned_backpressure = true;
                }
                Err(IpcError::BackpressureTimeout)
            }
            other => other,
        }
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.events.take()
    }

    async fn close(&mut self) -> Result<()> {
        debug!("Closing TCP channel");
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Some(peers) = self.peers.take() {
            peers.clear().await;
        }
        self.local_addr = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TCP Socket"
    }
}

impl Drop for TcpSocketChannel {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
    }
}
