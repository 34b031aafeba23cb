use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Publish/subscribe performance test - measures latency and throughput
/// across a scan of payload sizes
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Which side of the test this process runs
    #[clap(long, value_enum, default_value_t = Role::Loopback, help_heading = "Core Options")]
    pub role: Role,

    /// Message channel carrying the samples
    #[clap(short = 't', long, value_enum, default_value_t = TransportKind::Memory, help_heading = "Core Options")]
    pub transport: TransportKind,

    /// Total sample length in bytes, header included
    #[clap(short = 's', long, default_value_t = crate::defaults::DATA_LENGTH, help_heading = "Core Options")]
    pub data_len: usize,

    /// Scan these sample lengths instead of --data-len (no values: default scan)
    #[clap(long, num_args = 0.., value_delimiter = ',', help_heading = "Core Options")]
    pub scan: Option<Vec<usize>>,

    /// Samples published per sample length
    #[clap(short = 'i', long, default_value_t = crate::defaults::SAMPLES_PER_SIZE, help_heading = "Core Options")]
    pub num_iter: u64,

    /// Send a ping every N samples
    #[clap(long, default_value_t = crate::defaults::LATENCY_COUNT, help_heading = "Latency")]
    pub latency_count: u64,

    /// Strict ping-pong: every sample is a ping and only one is in flight
    #[clap(long, default_value_t = false, help_heading = "Latency")]
    pub latency_test: bool,

    /// Pings allowed in flight at once
    #[clap(long, default_value_t = crate::defaults::MAX_OUTSTANDING_PINGS, help_heading = "Latency")]
    pub max_outstanding_pings: usize,

    /// Warm-up samples sent before each sample length
    #[clap(short = 'w', long, default_value_t = crate::defaults::WARMUP_SAMPLES, help_heading = "Latency")]
    pub warmup_samples: u64,

    /// Subscribers echo warm-up samples as well
    #[clap(long, default_value_t = false, help_heading = "Latency")]
    pub echo_warmup: bool,

    /// Report full round-trip time instead of one-way latency
    #[clap(long, default_value_t = false, help_heading = "Latency")]
    pub round_trip: bool,

    /// Print a latency interval line every N echoes
    #[clap(long, default_value_t = crate::defaults::LATENCY_REPORT_EVERY, help_heading = "Latency")]
    pub latency_report_every: u64,

    /// Stop measuring after this long (e.g. "30s", "5m")
    #[clap(short = 'd', long, value_parser = parse_duration, help_heading = "Timing")]
    pub execution_time: Option<Duration>,

    /// Abandon a ping not echoed within this time [default: 5s, 200ms with --best-effort]
    #[clap(long, value_parser = parse_duration, help_heading = "Timing")]
    pub echo_timeout: Option<Duration>,

    /// Time allowed for in-flight echoes and acknowledgements at the end of a size
    #[clap(long, value_parser = parse_duration, default_value = "2s", help_heading = "Timing")]
    pub drain_timeout: Duration,

    /// Time allowed for publishers and subscribers to find each other
    #[clap(long, value_parser = parse_duration, default_value = "30s", help_heading = "Timing")]
    pub discovery_timeout: Duration,

    /// Throughput reporting interval
    #[clap(long, value_parser = parse_duration, default_value = "1s", help_heading = "Timing")]
    pub interval: Duration,

    /// Limit publication to this many samples per second
    #[clap(long, help_heading = "Timing")]
    pub pub_rate: Option<u64>,

    /// Unreliable delivery: repeat control markers and shorten the echo timeout
    #[clap(long, default_value_t = false, help_heading = "Delivery")]
    pub best_effort: bool,

    /// Probability of dropping a data sample (memory transport only)
    #[clap(long, default_value_t = 0.0, help_heading = "Delivery")]
    pub loss_rate: f64,

    /// Seed for the drop pattern of --loss-rate
    #[clap(long, help_heading = "Delivery")]
    pub loss_seed: Option<u64>,

    /// Report format written to stdout
    #[clap(short = 'f', long, value_enum, default_value_t = OutputFormat::Legacy, help_heading = "Output")]
    pub output_format: OutputFormat,

    /// Only print per-size summaries
    #[clap(long, default_value_t = false, help_heading = "Output")]
    pub no_print_intervals: bool,

    /// Omit header lines
    #[clap(long, default_value_t = false, help_heading = "Output")]
    pub no_headers: bool,

    /// Report process CPU usage alongside every interval and summary
    #[clap(long, default_value_t = false, help_heading = "Output")]
    pub cpu: bool,

    /// JSON run record written at the end of the test
    #[clap(short = 'o', long, help_heading = "Output")]
    pub output_file: Option<PathBuf>,

    /// Also write logs to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[clap(short = 'v', long, action = clap::ArgAction::Count, help_heading = "Output")]
    pub verbose: u8,

    /// Only log warnings and errors
    #[clap(short = 'q', long, default_value_t = false, help_heading = "Output")]
    pub quiet: bool,

    /// Number of publishers in the test
    #[clap(long, default_value_t = 1, help_heading = "Topology")]
    pub num_publishers: usize,

    /// Number of subscribers in the test
    #[clap(long, default_value_t = 1, help_heading = "Topology")]
    pub num_subscribers: usize,

    /// Id of this publisher (0 is the pinger)
    #[clap(long, default_value_t = 0, help_heading = "Topology")]
    pub pid: i32,

    /// Id of this subscriber
    #[clap(long, default_value_t = 0, help_heading = "Topology")]
    pub sid: i32,

    /// Host address the publisher listens on
    #[clap(long, default_value = crate::defaults::HOST, help_heading = "Transport")]
    pub host: String,

    /// TCP port the publisher listens on
    #[clap(long, default_value_t = crate::defaults::PORT, help_heading = "Transport")]
    pub port: u16,

    /// Publisher address (host:port or socket path) for subscribers; repeatable
    #[clap(long = "peer", help_heading = "Transport")]
    pub peers: Vec<String>,

    /// Unix socket path the publisher binds
    #[clap(long, default_value = crate::defaults::SOCKET_PATH, help_heading = "Transport")]
    pub socket_path: PathBuf,

    /// Socket send/receive buffer size
    #[clap(long, default_value_t = crate::defaults::BUFFER_SIZE, help_heading = "Transport")]
    pub buffer_size: usize,
}

/// Side of the test run by this process
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum Role {
    /// Publisher (publisher 0 measures latency)
    #[clap(name = "pub")]
    Publisher,

    /// Subscriber (echoes pings, measures throughput)
    #[clap(name = "sub")]
    Subscriber,

    /// Publishers and subscribers in this process
    #[clap(name = "loopback")]
    Loopback,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Publisher => write!(f, "Publisher"),
            Role::Subscriber => write!(f, "Subscriber"),
            Role::Loopback => write!(f, "Loopback"),
        }
    }
}

/// Available message channels
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum TransportKind {
    /// In-process bus (loopback only)
    #[clap(name = "memory")]
    Memory,

    /// TCP Sockets
    #[clap(name = "tcp")]
    Tcp,

    /// Unix Domain Sockets
    #[clap(name = "uds")]
    Uds,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Memory => write!(f, "In-Memory Bus"),
            TransportKind::Tcp => write!(f, "TCP Socket"),
            TransportKind::Uds => write!(f, "Unix Domain Socket"),
        }
    }
}

/// Report formats
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum OutputFormat {
    /// Human-readable lines
    #[clap(name = "legacy")]
    Legacy,

    /// Comma-separated columns
    #[clap(name = "csv")]
    Csv,

    /// One JSON document per run
    #[clap(name = "json")]
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Legacy => write!(f, "legacy"),
            OutputFormat::Csv => write!(f, "csv"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix("us") {
        (stripped, "us")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let duration = match unit {
        "us" => Duration::from_micros(num as u64),
        "ms" => Duration::from_micros((num * 1_000.0) as u64),
        "s" => Duration::from_secs_f64(num),
        "m" => Duration::from_secs_f64(num * 60.0),
        "h" => Duration::from_secs_f64(num * 3600.0),
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("250us").unwrap(), Duration::from_micros(250));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));

        assert!(parse_duration("").is_err());
        assert!(parse_duration("invalid").is_err());
        assert!(parse_duration("-3s").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(TransportKind::Uds.to_string(), "Unix Domain Socket");
        assert_eq!(TransportKind::Tcp.to_string(), "TCP Socket");
        assert_eq!(Role::Publisher.to_string(), "Publisher");
        assert_eq!(OutputFormat::Json.to_string(), "json");
    }

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["pubsub-perftest"]);
        assert_eq!(args.role, Role::Loopback);
        assert_eq!(args.transport, TransportKind::Memory);
        assert_eq!(args.data_len, crate::defaults::DATA_LENGTH);
        assert!(args.scan.is_none());
        assert!(args.echo_timeout.is_none());
        assert_eq!(args.interval, Duration::from_secs(1));
        assert_eq!(args.verbose, 0);
    }

    #[test]
    fn test_scan_and_repeatable_peers() {
        let args = Args::parse_from([
            "pubsub-perftest",
            "--role",
            "sub",
            "--transport",
            "tcp",
            "--scan",
            "64,256",
            "--peer",
            "10.0.0.1:7400",
            "--peer",
            "10.0.0.2:7400",
            "-vv",
        ]);
        assert_eq!(args.role, Role::Subscriber);
        assert_eq!(args.scan, Some(vec![64, 256]));
        assert_eq!(args.peers.len(), 2);
        assert_eq!(args.verbose, 2);

        let args = Args::parse_from(["pubsub-perftest", "--scan"]);
        assert_eq!(args.scan, Some(vec![]));
    }
}
