//! In-process channel
//!
//! A `MemoryBus` connects any number of publisher and subscriber endpoints
//! inside one process. Frames sent by a publisher reach every subscriber and
//! vice versa. An optional loss rate drops data frames at random, which is
//! how loss detection and echo timeouts are exercised without a network.
//! Control traffic is never dropped.

use super::{ChannelEvent, ConnectionRole, IpcError, MessageChannel, PeerId, TransportConfig};
use crate::envelope::{EnvelopeKind, SampleEnvelope};
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, trace, warn};

const DEFAULT_QUEUE_DEPTH: usize = 1024;
const UNMATCH_NOTIFY_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct BusState {
    next_id: PeerId,
    endpoints: HashMap<PeerId, (ConnectionRole, mpsc::Sender<ChannelEvent>)>,
}

impl BusState {
    fn senders_for(&self, role: ConnectionRole) -> Vec<(PeerId, mpsc::Sender<ChannelEvent>)> {
        self.endpoints
            .iter()
            .filter(|(_, (r, _))| *r == role)
            .map(|(id, (_, tx))| (*id, tx.clone()))
            .collect()
    }
}

/// Shared hub for in-process endpoints.
#[derive(Clone)]
pub struct MemoryBus {
    state: Arc<Mutex<BusState>>,
    loss_rate: f64,
    seed: Option<u64>,
    queue_depth: usize,
}

impl Default for MemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                next_id: 1,
                endpoints: HashMap::new(),
            })),
            loss_rate: 0.0,
            seed: None,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }

    /// Drop data frames with probability `loss_rate`. A seed makes the
    /// drop pattern reproducible.
    pub fn with_loss(mut self, loss_rate: f64, seed: Option<u64>) -> Self {
        self.loss_rate = loss_rate.clamp(0.0, 1.0);
        self.seed = seed;
        self
    }

    pub fn with_queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = depth.max(1);
        self
    }

    /// Attach a new endpoint. Existing endpoints on the opposite side are
    /// matched immediately in both directions.
    pub fn join(&self, role: ConnectionRole) -> MemoryChannel {
        let (tx, rx) = mpsc::channel(self.queue_depth);
        let mut state = self.state.lock();
        let id = state.next_id;
        state.next_id += 1;

        for (peer, peer_tx) in state.senders_for(role.opposite()) {
            if peer_tx.try_send(ChannelEvent::PeerMatched(id)).is_err() {
                debug!("Endpoint {} could not be notified of {}", peer, id);
            }
            let _ = tx.try_send(ChannelEvent::PeerMatched(peer));
        }
        state.endpoints.insert(id, (role, tx));
        drop(state);

        let rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(id)),
            None => StdRng::from_entropy(),
        };
        debug!("Memory endpoint {} joined as {:?}", id, role);

        MemoryChannel {
            id,
            role,
            bus: self.clone(),
            events: Some(rx),
            rng,
            joined: true,
        }
    }

    /// Detach an endpoint and return the peers that must be told.
    fn leave(&self, id: PeerId) -> Vec<(PeerId, mpsc::Sender<ChannelEvent>)> {
        let mut state = self.state.lock();
        match state.endpoints.remove(&id) {
            Some((role, _)) => state.senders_for(role.opposite()),
            None => Vec::new(),
        }
    }

    /// Number of endpoints currently attached.
    pub fn endpoint_count(&self) -> usize {
        self.state.lock().endpoints.len()
    }
}

/// One endpoint on a `MemoryBus`.
pub struct MemoryChannel {
    id: PeerId,
    role: ConnectionRole,
    bus: MemoryBus,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    rng: StdRng,
    joined: bool,
}

impl MemoryChannel {
    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn role(&self) -> ConnectionRole {
        self.role
    }

    fn should_drop(&mut self, envelope: &SampleEnvelope) -> bool {
        self.bus.loss_rate > 0.0
            && envelope.kind() == EnvelopeKind::Data
            && self.rng.gen::<f64>() < self.bus.loss_rate
    }
}

#[async_trait]
impl MessageChannel for MemoryChannel {
    async fn start_server(&mut self, _config: &TransportConfig) -> Result<()> {
        Ok(())
    }

    async fn start_client(&mut self, _config: &TransportConfig) -> Result<()> {
        Ok(())
    }

    async fn send(&mut self, envelope: &SampleEnvelope) -> Result<(), IpcError> {
        let targets = self.bus.state.lock().senders_for(self.role.opposite());
        if targets.is_empty() {
            return Err(IpcError::NoPeers);
        }

        let frame = envelope.to_bytes()?;
        for (peer, tx) in targets {
            if self.should_drop(envelope) {
                trace!(
                    "Dropping seq {} from {} to {}",
                    envelope.sequence_number,
                    self.id,
                    peer
                );
                continue;
            }
            if tx
                .send(ChannelEvent::Frame(self.id, frame.clone()))
                .await
                .is_err()
            {
                debug!("Memory endpoint {} has gone away", peer);
            }
        }
        Ok(())
    }

    fn take_events(&mut self) -> Option<mpsc::Receiver<ChannelEvent>> {
        self.events.take()
    }

    async fn close(&mut self) -> Result<()> {
        if !self.joined {
            return Ok(());
        }
        self.joined = false;
        for (peer, tx) in self.bus.leave(self.id) {
            let notice = ChannelEvent::PeerUnmatched(self.id);
            match timeout(UNMATCH_NOTIFY_TIMEOUT, tx.send(notice)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => debug!("Memory endpoint {} has gone away", peer),
                Err(_) => warn!(
                    "Endpoint {} was not told that {} left: event queue stayed full",
                    peer, self.id
                ),
            }
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Memory"
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        if !self.joined {
            return;
        }
        for (peer, tx) in self.bus.leave(self.id) {
            if let Err(mpsc::error::TrySendError::Full(_)) =
                tx.try_send(ChannelEvent::PeerUnmatched(self.id))
            {
                warn!(
                    "Endpoint {} was not told that {} left: event queue full",
                    peer, self.id
                );
            }
        }
    }
}
