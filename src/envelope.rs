//! Sample envelope wire format
//!
//! Every frame exchanged between publishers and subscribers is one
//! `SampleEnvelope`: a fixed little-endian header followed by the payload
//! whose length is the independent variable of the benchmark. Control
//! signals reuse the same layout; they are told apart from data by a
//! reserved value in the `size` field that no data sample can carry.

use crate::error::PerftestError;
use serde::{Deserialize, Serialize};

/// `latency_ping` value for samples that do not request an echo.
pub const NOT_A_PING: i32 = -1;

/// Size of the fixed header, including the payload length prefix.
///
/// Reported sample lengths are `payload + OVERHEAD_BYTES`, so a configured
/// data length can never be smaller than this.
pub const OVERHEAD_BYTES: usize = 36;

/// Largest sample (header plus payload) a data envelope may carry.
pub const MAX_DATA_SIZE: usize = 131_072;

/// Largest sample size in the default scan.
pub const MAX_SYNCHRONOUS_SIZE: usize = 63_000;

/// Reserved `size` markers. All of them sit above `MAX_DATA_SIZE`.
pub const ANNOUNCEMENT_SIZE: u32 = u32::MAX;
pub const LENGTH_CHANGED_SIZE: u32 = u32::MAX - 1;
pub const FINISHED_SIZE: u32 = u32::MAX - 2;
pub const INITIALIZE_SIZE: u32 = u32::MAX - 3;

/// What an envelope means to the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    /// A measured sample; `size` equals the payload length.
    Data,
    /// A subscriber has discovered every publisher.
    Announcement,
    /// Warm-up traffic, excluded from statistics.
    Initialize,
    /// The publisher is moving on to the next payload size.
    LengthChanged,
    /// The publisher has sent its last sample.
    Finished,
}

impl EnvelopeKind {
    fn marker(self) -> Option<u32> {
        match self {
            EnvelopeKind::Data => None,
            EnvelopeKind::Announcement => Some(ANNOUNCEMENT_SIZE),
            EnvelopeKind::Initialize => Some(INITIALIZE_SIZE),
            EnvelopeKind::LengthChanged => Some(LENGTH_CHANGED_SIZE),
            EnvelopeKind::Finished => Some(FINISHED_SIZE),
        }
    }

    fn from_marker(size: u32) -> Option<Self> {
        match size {
            ANNOUNCEMENT_SIZE => Some(EnvelopeKind::Announcement),
            INITIALIZE_SIZE => Some(EnvelopeKind::Initialize),
            LENGTH_CHANGED_SIZE => Some(EnvelopeKind::LengthChanged),
            FINISHED_SIZE => Some(EnvelopeKind::Finished),
            _ => None,
        }
    }

    /// Whether this kind ends a payload size on the publisher side.
    pub fn is_end_marker(self) -> bool {
        matches!(self, EnvelopeKind::LengthChanged | EnvelopeKind::Finished)
    }
}

/// One transmitted unit of payload plus its control metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleEnvelope {
    pub entity_id: i32,
    pub sequence_number: u64,
    pub timestamp_seconds: u32,
    pub timestamp_microseconds: u32,
    pub latency_ping: i32,
    pub size: u32,
    pub payload: Vec<u8>,
}

impl SampleEnvelope {
    /// Build a data envelope stamped with `send_time_us`.
    pub fn encode(
        entity_id: i32,
        sequence_number: u64,
        send_time_us: u64,
        ping_id: i32,
        payload: Vec<u8>,
    ) -> Self {
        let mut envelope = Self {
            entity_id,
            sequence_number,
            timestamp_seconds: 0,
            timestamp_microseconds: 0,
            latency_ping: ping_id,
            size: payload.len() as u32,
            payload,
        };
        envelope.stamp(send_time_us);
        envelope
    }

    /// Build a control envelope. `Data` falls back to a plain data sample.
    pub fn control(kind: EnvelopeKind, entity_id: i32, latency_ping: i32, payload: Vec<u8>) -> Self {
        let mut envelope = Self::encode(entity_id, 0, 0, latency_ping, payload);
        if let Some(marker) = kind.marker() {
            envelope.size = marker;
        }
        envelope
    }

    /// Overwrite the send timestamp, immediately before handing it to the channel.
    pub fn stamp(&mut self, send_time_us: u64) {
        self.timestamp_seconds = (send_time_us / 1_000_000) as u32;
        self.timestamp_microseconds = (send_time_us % 1_000_000) as u32;
    }

    pub fn sent_time_usec(&self) -> u64 {
        self.timestamp_seconds as u64 * 1_000_000 + self.timestamp_microseconds as u64
    }

    pub fn kind(&self) -> EnvelopeKind {
        EnvelopeKind::from_marker(self.size).unwrap_or(EnvelopeKind::Data)
    }

    pub fn is_ping(&self) -> bool {
        self.latency_ping != NOT_A_PING
    }

    /// Length accounted for in throughput and reports.
    pub fn sample_length(&self) -> usize {
        self.payload.len() + OVERHEAD_BYTES
    }

    /// Serialize to the wire representation.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parse a received frame.
    ///
    /// Fails when the frame is shorter than the header, when the payload is
    /// truncated, or when a data envelope's declared size disagrees with the
    /// payload it carries.
    pub fn decode(raw: &[u8]) -> Result<Self, PerftestError> {
        let malformed = |reason: String| PerftestError::MalformedEnvelope {
            len: raw.len(),
            header: OVERHEAD_BYTES,
            reason,
        };

        if raw.len() < OVERHEAD_BYTES {
            return Err(malformed("shorter than header".to_string()));
        }

        let envelope: SampleEnvelope =
            bincode::deserialize(raw).map_err(|e| malformed(e.to_string()))?;

        if envelope.size as usize <= MAX_DATA_SIZE {
            if envelope.size as usize != envelope.payload.len() {
                return Err(malformed(format!(
                    "declared size {} but payload is {} bytes",
                    envelope.size,
                    envelope.payload.len()
                )));
            }
        } else if EnvelopeKind::from_marker(envelope.size).is_none() {
            return Err(malformed(format!("unknown size marker {:#x}", envelope.size)));
        }

        Ok(envelope)
    }
}

/// Payload bytes for a sample of `data_length` total bytes.
pub fn payload_for(data_length: usize) -> Vec<u8> {
    vec![0u8; data_length.saturating_sub(OVERHEAD_BYTES)]
}
