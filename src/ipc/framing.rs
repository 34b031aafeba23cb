//! Length-prefixed framing shared by the stream transports
//!
//! Each frame is a 4-byte little-endian length followed by the encoded
//! envelope. `PeerSet` owns the write halves of every connected peer and
//! spawns one reader task per peer that forwards frames into the event
//! queue.

use super::{ChannelEvent, IpcError, PeerId};
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, warn};

/// Frames above this size are rejected as corrupt.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Read one frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes).await?;
    let frame_len = u32::from_le_bytes(len_bytes) as usize;

    if frame_len > MAX_FRAME_LEN {
        return Err(anyhow!("Frame too large: {} bytes", frame_len));
    }

    let mut frame = vec![0u8; frame_len];
    reader.read_exact(&mut frame).await?;
    Ok(frame)
}

/// Write one frame, giving up after `write_timeout`.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &[u8],
    write_timeout: Duration,
) -> Result<(), IpcError> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(IpcError::Generic(anyhow!(
            "Frame too large: {} bytes",
            frame.len()
        )));
    }
    let frame_len = frame.len() as u32;

    let write_fut = async {
        writer.write_all(&frame_len.to_le_bytes()).await?;
        writer.write_all(frame).await?;
        writer.flush().await?;
        Ok(()) as Result<(), std::io::Error>
    };

    match timeout(write_timeout, write_fut).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(IpcError::Generic(e.into())),
        Err(_) => Err(IpcError::BackpressureTimeout),
    }
}

/// Connected peers of one stream channel.
pub struct PeerSet<W> {
    writers: Arc<Mutex<HashMap<PeerId, W>>>,
    next_peer_id: Arc<AtomicU64>,
    events: mpsc::Sender<ChannelEvent>,
    write_timeout: Duration,
}

impl<W> Clone for PeerSet<W> {
    fn clone(&self) -> Self {
        Self {
            writers: self.writers.clone(),
            next_peer_id: self.next_peer_id.clone(),
            events: self.events.clone(),
            write_timeout: self.write_timeout,
        }
    }
}

impl<W> PeerSet<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(events: mpsc::Sender<ChannelEvent>, write_timeout: Duration) -> Self {
        Self {
            writers: Arc::new(Mutex::new(HashMap::new())),
            next_peer_id: Arc::new(AtomicU64::new(1)),
            events,
            write_timeout,
        }
    }

    /// Register a connection and start forwarding its frames.
    pub async fn attach<R>(&self, reader: R, writer: W) -> PeerId
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let peer = self.next_peer_id.fetch_add(1, Ordering::Relaxed);
        self.writers.lock().await.insert(peer, writer);

        if self.events.send(ChannelEvent::PeerMatched(peer)).await.is_err() {
            debug!("Event queue closed before peer {} matched", peer);
        }

        tokio::spawn(Self::forward_frames(
            peer,
            reader,
            self.events.clone(),
            self.writers.clone(),
        ));
        peer
    }

    async fn forward_frames<R>(
        peer: PeerId,
        mut reader: R,
        events: mpsc::Sender<ChannelEvent>,
        writers: Arc<Mutex<HashMap<PeerId, W>>>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        loop {
            match read_frame(&mut reader).await {
                Ok(frame) => {
                    if events.send(ChannelEvent::Frame(peer, frame)).await.is_err() {
                        debug!("Event queue closed for peer {}", peer);
                        break;
                    }
                }
                Err(e) => {
                    debug!("Peer {} disconnected: {}", peer, e);
                    break;
                }
            }
        }

        writers.lock().await.remove(&peer);
        let _ = events.send(ChannelEvent::PeerUnmatched(peer)).await;
    }

    /// Write `frame` to every connected peer.
    ///
    /// Every peer is attempted; the first failure is returned.
    pub async fn broadcast(&self, frame: &[u8]) -> Result<(), IpcError> {
        let mut writers = self.writers.lock().await;
        if writers.is_empty() {
            return Err(IpcError::NoPeers);
        }

        let mut first_error = None;
        for (peer, writer) in writers.iter_mut() {
            if let Err(e) = write_frame(writer, frame, self.write_timeout).await {
                warn!("Send to peer {} failed: {}", peer, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn len(&self) -> usize {
        self.writers.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn clear(&self) {
        let mut writers = self.writers.lock().await;
        for (_, mut writer) in writers.drain() {
            let _ = writer.shutdown().await;
        }
    }
}
