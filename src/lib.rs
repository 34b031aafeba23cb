//! # Publish/Subscribe Performance Test Library
//!
//! Measures end-to-end latency and throughput of a publish/subscribe data
//! path across a scan of payload sizes.
//!
//! ## How a Test Works
//!
//! A publisher sends a stream of timestamped, sequence-numbered samples.
//! Every `latency_count`-th sample is a *ping*: one subscriber echoes it
//! back unchanged and the publisher records the round-trip time (or half of
//! it, for one-way latency) in a histogram. Subscribers also count every
//! sample they receive and detect loss from sequence gaps, reporting
//! throughput at a fixed interval and per payload size.
//!
//! ## Architecture Overview
//!
//! - `envelope`: the sample envelope and its wire encoding
//! - `metrics`: latency statistics accumulator and report records
//! - `throughput`: per-publisher loss detection and rate calculation
//! - `protocol`: the pinger and ponger state machines
//! - `printer`: legacy, CSV and JSON report emitters
//! - `ipc`: message channels (in-memory bus, TCP, Unix domain sockets)
//! - `benchmark`: configuration and the driver that runs a scan
//! - `results`: the per-run result and its optional JSON record
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use pubsub_perftest::{BenchmarkRunner, TestConfiguration};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = TestConfiguration {
//!         data_lengths: vec![64, 1024, 8192],
//!         samples_per_size: 10_000,
//!         latency_count: 100,
//!         ..TestConfiguration::default()
//!     };
//!
//!     let result = BenchmarkRunner::configure(config)?.run_scan().await?;
//!     for size in &result.sizes {
//!         if let Some(latency) = &size.latency {
//!             println!("{} bytes: {:.1} us mean", size.data_length, latency.mean_us);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

/// Test configuration and the scan driver
///
/// `TestConfiguration` is built from the command line and validated before
/// any I/O. `BenchmarkRunner` creates the channels for the configured role
/// and runs every payload size to completion.
pub mod benchmark;

/// Command-line interface
///
/// Argument parsing with clap, including human-readable durations
/// (e.g., "500ms", "10s", "5m").
pub mod cli;

/// Process CPU usage sampling for the optional CPU report column
pub mod cpu;

/// Sample envelope and wire format
pub mod envelope;

/// Error taxonomy
pub mod error;

/// Message channels
///
/// The `MessageChannel` trait delivers envelopes to every matched peer and
/// reports peer matches, departures and received frames through one event
/// queue per endpoint. Implementations:
/// - In-process bus with optional simulated loss
/// - TCP sockets with TCP_NODELAY and configurable buffer sizes
/// - Unix domain sockets
pub mod ipc;

pub mod logging;

/// Latency statistics
///
/// A fixed-bucket histogram with running mean and variance. Percentiles are
/// read straight from the bucket counts.
pub mod metrics;

/// Report emitters
pub mod printer;

/// Pinger and ponger state machines
pub mod protocol;

/// Run results and the JSON run record
pub mod results;

/// Receive-side throughput and loss tracking
pub mod throughput;

pub mod utils;

pub use benchmark::{BenchmarkRunner, TestConfiguration};
pub use cli::{Args, OutputFormat, Role, TransportKind};
pub use envelope::{EnvelopeKind, SampleEnvelope};
pub use error::PerftestError;
pub use ipc::{ChannelEvent, MessageChannel};
pub use metrics::{LatencySummary, LatencyType, StatisticsAccumulator};
pub use printer::{create_printer, ReportPrinter};
pub use protocol::{Pinger, Ponger};
pub use results::{ResultsManager, RunResult};
pub use throughput::{ThroughputSummary, ThroughputTracker};

/// The current version of the perftest
///
/// Populated from Cargo.toml and recorded in the JSON run record.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Default total sample length in bytes, header included
    pub const DATA_LENGTH: usize = 100;

    /// Default number of data samples per sample length
    ///
    /// `--execution-time` is the usual way to bound longer runs.
    pub const SAMPLES_PER_SIZE: u64 = 1_000_000;

    /// Default ping spacing: one ping every this many samples
    pub const LATENCY_COUNT: u64 = 10_000;

    /// Default number of pings in flight
    pub const MAX_OUTSTANDING_PINGS: usize = 1;

    /// Default warm-up samples per sample length
    pub const WARMUP_SAMPLES: u64 = 100;

    /// Echo timeout with reliable delivery
    pub const ECHO_TIMEOUT: Duration = Duration::from_secs(5);

    /// Echo timeout with best-effort delivery
    ///
    /// Lost samples are expected, so abandoned rounds are given up on
    /// quickly to keep the pinger moving.
    pub const BEST_EFFORT_ECHO_TIMEOUT: Duration = Duration::from_millis(200);

    pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
    pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

    /// Throughput reporting interval
    pub const REPORT_INTERVAL: Duration = Duration::from_secs(1);

    /// Latency interval lines are printed for every echo by default
    pub const LATENCY_REPORT_EVERY: u64 = 1;

    /// Sample lengths used by `--scan` without explicit sizes
    ///
    /// Starts at the first power of two that fits the header.
    pub const DEFAULT_SCAN: [usize; 11] = [
        64,
        128,
        256,
        512,
        1024,
        2048,
        4096,
        8192,
        16384,
        32768,
        crate::envelope::MAX_SYNCHRONOUS_SIZE,
    ];

    pub const HOST: &str = "127.0.0.1";
    pub const PORT: u16 = 7400;
    pub const SOCKET_PATH: &str = "/tmp/pubsub_perftest.sock";
    pub const BUFFER_SIZE: usize = 65536;
}
