//! Error taxonomy for the measurement core
//!
//! Per-sample anomalies (`MalformedEnvelope`, `ClockAnomaly`, an individual
//! `TimeoutExceeded`) are recovered locally by the protocol and only logged.
//! `Configuration` errors are raised before any I/O takes place, and
//! `Channel` errors abort the run.

use thiserror::Error;

/// Errors produced by the measurement core.
#[derive(Debug, Error)]
pub enum PerftestError {
    /// A received frame could not be decoded as a sample envelope.
    #[error("malformed envelope: {reason} ({len} bytes, header is {header} bytes)")]
    MalformedEnvelope {
        len: usize,
        header: usize,
        reason: String,
    },

    /// An echo, acknowledgement or discovery wait ran past its bound.
    #[error("timed out after {waited_ms} ms waiting for {what}")]
    TimeoutExceeded { what: String, waited_ms: u128 },

    /// The receive timestamp is earlier than the send timestamp.
    #[error("clock anomaly: received at {received_us} us before sent at {sent_us} us")]
    ClockAnomaly { sent_us: u64, received_us: u64 },

    /// Invalid test configuration, surfaced before a run starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The message channel failed in a way the run cannot recover from.
    #[error("channel failure: {0}")]
    Channel(String),
}

impl PerftestError {
    /// Whether the protocol may keep running after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PerftestError::MalformedEnvelope { .. }
                | PerftestError::TimeoutExceeded { .. }
                | PerftestError::ClockAnomaly { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PerftestError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        let malformed = PerftestError::MalformedEnvelope {
            len: 3,
            header: 36,
            reason: "short frame".to_string(),
        };
        assert!(malformed.is_recoverable());
        assert!(PerftestError::ClockAnomaly {
            sent_us: 10,
            received_us: 5
        }
        .is_recoverable());
        assert!(!PerftestError::Configuration("bad".into()).is_recoverable());
        assert!(!PerftestError::Channel("gone".into()).is_recoverable());
    }

    #[test]
    fn test_display_includes_context() {
        let err = PerftestError::TimeoutExceeded {
            what: "echo of round 7".to_string(),
            waited_ms: 200,
        };
        let text = err.to_string();
        assert!(text.contains("200 ms"));
        assert!(text.contains("round 7"));
    }
}
