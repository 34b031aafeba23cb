use super::framing::PeerSet;
use super::{ChannelEvent, IpcError, MessageChannel, TransportConfig};
use crate::envelope::SampleEnvelope;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Unix Domain Socket channel: the publisher binds the socket path,
/// subscribers connect to it.
pub struct UnixDomainSocketChannel {
    peers: Option<PeerSet<OwnedWriteHalf>>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    accept_task: Option<JoinHandle<()>>,
    socket_path: Option<PathBuf>,
    // Only the binding publisher unlinks the socket file.
    owns_socket_file: bool,
}

impl Default for UnixDomainSocketChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixDomainSocketChannel {
    pub fn new() -> Self {
        Self {
            peers: None,
            events: None,
            accept_task: None,
            socket_path: None,
            owns_socket_file: false,
        }
    }

    fn init_peers(&mut self, config: &TransportConfig) -> PeerSet<OwnedWriteHalf> {
        let (events_tx, events_rx) = mpsc::channel(config.event_queue_depth);
        let peers = PeerSet::new(events_tx, config.write_timeout);
        self.peers = Some(peers.clone());
        self.events = Some(events_rx);
        peers
    }

    fn configure_stream(stream: &UnixStream, buffer_size: usize) -> std::io::Result<()> {
        let socket = socket2::SockRef::from(stream);
        socket.set_recv_buffer_size(buffer_size)?;
        socket.set_send_buffer_size(buffer_size)?;
        Ok(())
    }

    fn cleanup_socket(&mut self) {
        if !self.owns_socket_file {
            return;
        }
        if let Some(path) = self.socket_path.take() {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove socket file {}: {}", path.display(), e);
                }
            }
        }
        self.owns_socket_file = false;
    }

    async fn connect_with_retry(path: &Path, connect_timeout: Duration) -> Result<UnixStream> {
        let deadline = tokio::time::Instant::now() + connect_timeout;
        loop {
            match UnixStream::connect(path).await {
                Ok(stream) => return Ok(stream),
                Err(e) if tokio::time::Instant::now() < deadline => {
                    debug!("Socket {} not ready yet: {}", path.display(), e);
                    tokio::time::sleep(CONNECT_RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("Failed to connect to {}", path.display()));
                }
            }
        }
    }
}

#[async_trait]
impl MessageChannel for UnixDomainSocketChannel {
    async fn start_server(&mut self, config: &TransportConfig) -> Result<()> {
        let path = config.socket_path.clone();
        debug!("Starting UDS publisher endpoint on: {}", path.display());

        // Stale socket files from an earlier run would make bind fail.
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)
            .with_context(|| format!("Failed to bind {}", path.display()))?;
        #[cfg(unix)]
        {
            use std::fs;
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&path, fs::Permissions::from_mode(0o666));
        }
        self.socket_path = Some(path.clone());
        self.owns_socket_file = true;
        info!("UDS publisher listening on {}", path.display());

        let peers = self.init_peers(config);
        let buffer_size = config.buffer_size;

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        debug!("Accepted UDS subscriber");
                        if let Err(e) = Self::configure_stream(&stream, buffer_size) {
                            warn!("Failed to set socket options: {}", e);
                        }
                        let (reader, writer) = stream.into_split();
                        peers.attach(reader, writer).await;
                    }
                    Err(e) => {
                        warn!("UDS accept failed: {}", e);
                        break;
                    }
                }
            }
        }));

        Ok(())
    }

    async fn start_client(&mut self, config: &TransportConfig) -> Result<()> {
        let targets: Vec<PathBuf> = if config.peers.is_empty() {
            vec![config.socket_path.clone()]
        } else {
            config.peers.iter().map(PathBuf::from).collect()
        };

        let peers = self.init_peers(config);
        for path in &targets {
            let stream = Self::connect_with_retry(path, config.connect_timeout).await?;
            Self::configure_stream(&stream, config.buffer_size)?;
            let (reader, writer) = stream.into_split();
            peers.attach(reader, writer).await;
            info!("UDS subscriber connected to {}", path.display());
        }
        Ok(())
    }

    async fn send(&mut self, envelope: &SampleEnvelope) -> Result<(), IpcError> {
        let peers = self
            .peers
            .as_ref()
            .ok_or_else(|| IpcError::Generic(anyhow!("Channel not started")))?;
        let frame = envelope.to_bytes()?;
        peers.broadcast(&frame).await
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.events.take()
    }

    async fn close(&mut self) -> Result<()> {
        debug!("Closing UDS channel");
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        if let Some(peers) = self.peers.take() {
            peers.clear().await;
        }
        self.cleanup_socket();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Unix Domain Socket"
    }
}

impl Drop for UnixDomainSocketChannel {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        self.cleanup_socket();
    }
}
