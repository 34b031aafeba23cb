//! # Benchmark Driver Module
//!
//! Turns command-line arguments into an immutable [`TestConfiguration`] and
//! runs the payload-size scan for the role this process plays.
//!
//! ## Roles
//!
//! - **Publisher**: starts the listening side of a stream channel and runs a
//!   [`Pinger`]. Publisher 0 measures latency and prints the latency report.
//! - **Subscriber**: connects to every publisher and runs a [`Ponger`],
//!   printing the throughput report.
//! - **Loopback**: runs all publishers and subscribers of the test as tasks
//!   in this process, over the in-memory bus or over local sockets.
//!
//! ## Lifecycle
//!
//! 1. **Configure**: validate the configuration before any I/O happens
//! 2. **Connect**: create and start the channels for each role
//! 3. **Scan**: every payload size goes through warm-up, measuring, draining
//! 4. **Collect**: fold publisher and subscriber outcomes into a [`RunResult`]

use crate::cli::{Args, OutputFormat, Role, TransportKind};
use crate::envelope::{MAX_DATA_SIZE, OVERHEAD_BYTES};
use crate::error::PerftestError;
use crate::ipc::{
    start_channel, ChannelFactory, ConnectionRole, MemoryBus, MessageChannel, TransportConfig,
};
use crate::metrics::LatencyType;
use crate::printer::{create_printer, PrinterOptions, ReportPrinter};
use crate::protocol::{Clock, Pinger, PingerOutcome, Ponger, PongerOutcome, SystemClock};
use crate::results::RunResult;
use anyhow::{Context, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Upper bound on `max_outstanding_pings`.
pub const MAX_OUTSTANDING_PINGS_LIMIT: usize = 256;

/// Consistent display of the configuration at start-up.
struct ConfigurationDisplay<'a> {
    config: &'a TestConfiguration,
}

impl<'a> std::fmt::Display for ConfigurationDisplay<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let config = self.config;
        writeln!(
            f,
            "-----------------------------------------------------------------"
        )?;
        writeln!(f, "Perftest {} over {}", config.role, config.transport)?;
        writeln!(f, "  Sample Lengths:     {:?}", config.data_lengths)?;
        writeln!(f, "  Samples per Size:   {}", config.samples_per_size)?;
        writeln!(
            f,
            "  Latency Count:      {} (max {} in flight)",
            config.latency_count, config.max_outstanding_pings
        )?;
        writeln!(f, "  Warm-up Samples:    {}", config.warmup_samples)?;
        writeln!(f, "  Latency:            {}", config.latency_type)?;
        writeln!(
            f,
            "  Delivery:           {}",
            if config.best_effort {
                "best effort"
            } else {
                "reliable"
            }
        )?;
        writeln!(f, "  Echo Timeout:       {:?}", config.echo_timeout)?;
        if config.transport != TransportKind::Memory {
            writeln!(
                f,
                "  Buffer Size:        {}",
                crate::utils::format_bytes(config.transport_config.buffer_size)
            )?;
        }
        if let Some(execution_time) = config.execution_time {
            writeln!(f, "  Execution Time:     {:?}", execution_time)?;
        }
        if let Some(rate) = config.pub_rate {
            writeln!(f, "  Publication Rate:   {} samples/s", rate)?;
        }
        writeln!(
            f,
            "  Topology:           {} publisher(s), {} subscriber(s)",
            config.num_publishers, config.num_subscribers
        )?;
        write!(
            f,
            "-----------------------------------------------------------------"
        )
    }
}

/// Configuration for one perftest run
///
/// Built once from the command line and shared read-only by every protocol
/// task. Publisher and subscriber tasks in loopback mode each get a copy
/// with their own `pub_id`/`sub_id`.
#[derive(Debug, Clone)]
pub struct TestConfiguration {
    /// Which side of the test this process runs
    pub role: Role,

    /// Message channel carrying samples
    pub transport: TransportKind,

    /// Sample lengths to scan, in order, header included
    ///
    /// A single-size test is a scan of one.
    pub data_lengths: Vec<usize>,

    /// Data samples published per sample length
    pub samples_per_size: u64,

    /// Every `latency_count`-th sample from publisher 0 is a ping
    pub latency_count: u64,

    /// Pings allowed in flight before the publisher waits for an echo
    pub max_outstanding_pings: usize,

    /// Warm-up samples sent before each sample length; never measured
    pub warmup_samples: u64,

    /// Whether subscribers echo warm-up samples
    pub echo_warmup: bool,

    /// Optional bound on the time spent measuring
    ///
    /// When it expires the current size is cut short, summarized, and the
    /// remaining sizes are skipped.
    pub execution_time: Option<Duration>,

    /// A ping not echoed within this time is abandoned as a lost round
    pub echo_timeout: Duration,

    /// Time allowed for in-flight echoes and marker acknowledgements
    pub drain_timeout: Duration,

    /// Time allowed for publishers and subscribers to find each other
    pub discovery_timeout: Duration,

    /// Throughput reporting interval
    pub interval: Duration,

    /// Print a latency interval line every this many echoes
    pub latency_report_every: u64,

    /// Optional publication rate in samples per second
    pub pub_rate: Option<u64>,

    /// Unreliable delivery: control markers are repeated
    pub best_effort: bool,

    /// Probability of dropping a data sample on the in-memory bus
    pub loss_rate: f64,

    /// Seed for the drop pattern
    pub loss_seed: Option<u64>,

    pub latency_type: LatencyType,
    pub output_format: OutputFormat,
    pub print_intervals: bool,
    pub print_headers: bool,
    /// Sample process CPU usage for every report line.
    pub cpu: bool,

    pub num_publishers: usize,
    pub num_subscribers: usize,
    pub pub_id: i32,
    pub sub_id: i32,

    /// JSON run record destination
    pub output_file: Option<PathBuf>,

    /// Stream transport settings
    pub transport_config: TransportConfig,
}

impl Default for TestConfiguration {
    fn default() -> Self {
        Self {
            role: Role::Loopback,
            transport: TransportKind::Memory,
            data_lengths: vec![crate::defaults::DATA_LENGTH],
            samples_per_size: crate::defaults::SAMPLES_PER_SIZE,
            latency_count: crate::defaults::LATENCY_COUNT,
            max_outstanding_pings: crate::defaults::MAX_OUTSTANDING_PINGS,
            warmup_samples: crate::defaults::WARMUP_SAMPLES,
            echo_warmup: false,
            execution_time: None,
            echo_timeout: crate::defaults::ECHO_TIMEOUT,
            drain_timeout: crate::defaults::DRAIN_TIMEOUT,
            discovery_timeout: crate::defaults::DISCOVERY_TIMEOUT,
            interval: crate::defaults::REPORT_INTERVAL,
            latency_report_every: crate::defaults::LATENCY_REPORT_EVERY,
            pub_rate: None,
            best_effort: false,
            loss_rate: 0.0,
            loss_seed: None,
            latency_type: LatencyType::OneWay,
            output_format: OutputFormat::Legacy,
            print_intervals: true,
            print_headers: true,
            cpu: false,
            num_publishers: 1,
            num_subscribers: 1,
            pub_id: 0,
            sub_id: 0,
            output_file: None,
            transport_config: TransportConfig::default(),
        }
    }
}

impl TestConfiguration {
    /// Create a configuration from CLI arguments and validate it.
    ///
    /// `--latency-test` forces strict ping-pong: every sample is a ping and
    /// only one is ever in flight. The echo timeout defaults to 5 s, or
    /// 200 ms with `--best-effort`.
    pub fn from_args(args: &Args) -> Result<Self> {
        let data_lengths = match &args.scan {
            Some(sizes) if sizes.is_empty() => crate::defaults::DEFAULT_SCAN.to_vec(),
            Some(sizes) => sizes.clone(),
            None => vec![args.data_len],
        };

        let (latency_count, max_outstanding_pings) = if args.latency_test {
            (1, 1)
        } else {
            (args.latency_count, args.max_outstanding_pings)
        };

        let echo_timeout = args.echo_timeout.unwrap_or(if args.best_effort {
            crate::defaults::BEST_EFFORT_ECHO_TIMEOUT
        } else {
            crate::defaults::ECHO_TIMEOUT
        });

        let transport_config = TransportConfig {
            buffer_size: args.buffer_size,
            host: args.host.clone(),
            port: args.port,
            peers: args.peers.clone(),
            socket_path: args.socket_path.clone(),
            ..TransportConfig::default()
        };

        let config = Self {
            role: args.role,
            transport: args.transport,
            data_lengths,
            samples_per_size: args.num_iter,
            latency_count,
            max_outstanding_pings,
            warmup_samples: args.warmup_samples,
            echo_warmup: args.echo_warmup,
            execution_time: args.execution_time,
            echo_timeout,
            drain_timeout: args.drain_timeout,
            discovery_timeout: args.discovery_timeout,
            interval: args.interval,
            latency_report_every: args.latency_report_every,
            pub_rate: args.pub_rate,
            best_effort: args.best_effort,
            loss_rate: args.loss_rate,
            loss_seed: args.loss_seed,
            latency_type: if args.round_trip {
                LatencyType::RoundTrip
            } else {
                LatencyType::OneWay
            },
            output_format: args.output_format,
            print_intervals: !args.no_print_intervals,
            print_headers: !args.no_headers,
            cpu: args.cpu,
            num_publishers: args.num_publishers,
            num_subscribers: args.num_subscribers,
            pub_id: args.pid,
            sub_id: args.sid,
            output_file: args.output_file.clone(),
            transport_config,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the protocol cannot run.
    pub fn validate(&self) -> Result<(), PerftestError> {
        let invalid = |msg: String| Err(PerftestError::Configuration(msg));

        if self.data_lengths.is_empty() {
            return invalid("at least one sample length is required".to_string());
        }
        for &length in &self.data_lengths {
            if !(OVERHEAD_BYTES..=MAX_DATA_SIZE).contains(&length) {
                return invalid(format!(
                    "sample length {} outside [{}, {}]",
                    length, OVERHEAD_BYTES, MAX_DATA_SIZE
                ));
            }
        }
        if self.samples_per_size == 0 {
            return invalid("number of iterations must be positive".to_string());
        }
        if self.latency_count == 0 || self.latency_count > self.samples_per_size {
            return invalid(format!(
                "latency count {} must be between 1 and the number of iterations ({})",
                self.latency_count, self.samples_per_size
            ));
        }
        if self.max_outstanding_pings == 0
            || self.max_outstanding_pings > MAX_OUTSTANDING_PINGS_LIMIT
        {
            return invalid(format!(
                "max outstanding pings must be between 1 and {}",
                MAX_OUTSTANDING_PINGS_LIMIT
            ));
        }
        if !(0.0..=1.0).contains(&self.loss_rate) {
            return invalid(format!("loss rate {} outside [0, 1]", self.loss_rate));
        }
        if self.loss_rate > 0.0 && self.transport != TransportKind::Memory {
            return invalid("loss rate is only supported on the memory transport".to_string());
        }
        if self.transport == TransportKind::Memory && self.role != Role::Loopback {
            return invalid("the memory transport requires --role loopback".to_string());
        }
        if self.num_publishers == 0 || self.num_subscribers == 0 {
            return invalid("at least one publisher and one subscriber are required".to_string());
        }
        if self.pub_id < 0 || self.pub_id as usize >= self.num_publishers {
            return invalid(format!(
                "publisher id {} outside [0, {})",
                self.pub_id, self.num_publishers
            ));
        }
        if self.sub_id < 0 || self.sub_id as usize >= self.num_subscribers {
            return invalid(format!(
                "subscriber id {} outside [0, {})",
                self.sub_id, self.num_subscribers
            ));
        }
        if self.interval.is_zero() {
            return invalid("reporting interval must be positive".to_string());
        }
        if self.echo_timeout.is_zero() {
            return invalid("echo timeout must be positive".to_string());
        }
        if self.pub_rate == Some(0) {
            return invalid("publication rate must be positive".to_string());
        }
        if self.transport != TransportKind::Memory {
            crate::utils::validate_buffer_size(self.transport_config.buffer_size)
                .map_err(|e| PerftestError::Configuration(e.to_string()))?;
        }
        Ok(())
    }

    /// Publisher 0 is the only one that pings.
    pub fn is_pinger(&self) -> bool {
        self.pub_id == 0
    }

    pub fn printer_options(&self) -> PrinterOptions {
        PrinterOptions {
            print_intervals: self.print_intervals,
            print_headers: self.print_headers,
            latency_type: self.latency_type,
            show_cpu: self.cpu,
        }
    }

    fn for_publisher(&self, pub_id: i32) -> Arc<Self> {
        Arc::new(Self {
            pub_id,
            ..self.clone()
        })
    }

    fn for_subscriber(&self, sub_id: i32) -> Arc<Self> {
        Arc::new(Self {
            sub_id,
            ..self.clone()
        })
    }
}

/// Drives a whole scan for the configured role.
pub struct BenchmarkRunner {
    config: TestConfiguration,
    output: Box<dyn Write + Send + Sync>,
    subscriber_output: Box<dyn Write + Send + Sync>,
    clock: Arc<dyn Clock>,
}

impl BenchmarkRunner {
    /// Validate `config` and prepare a runner. Reports go to stdout, and in
    /// loopback mode the subscriber report goes to stderr.
    pub fn configure(config: TestConfiguration) -> Result<Self> {
        config.validate()?;
        info!("\n{}", ConfigurationDisplay { config: &config });
        Ok(Self {
            config,
            output: Box::new(std::io::stdout()),
            subscriber_output: Box::new(std::io::stderr()),
            clock: Arc::new(SystemClock),
        })
    }

    /// Send the primary report to `output` instead of stdout.
    pub fn with_output(mut self, output: Box<dyn Write + Send + Sync>) -> Self {
        self.output = output;
        self
    }

    /// Send the loopback subscriber report to `output` instead of stderr.
    pub fn with_subscriber_output(mut self, output: Box<dyn Write + Send + Sync>) -> Self {
        self.subscriber_output = output;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &TestConfiguration {
        &self.config
    }

    /// Run every payload size and collect the results.
    pub async fn run_scan(self) -> Result<RunResult> {
        let started = Instant::now();
        let mut result = RunResult::new(
            self.config.role,
            self.config.transport,
            self.config.latency_type,
        );

        match self.config.role {
            Role::Publisher => {
                let outcome = self.run_publisher().await?;
                result.add_publisher(&outcome);
            }
            Role::Subscriber => {
                let outcome = self.run_subscriber().await?;
                result.add_subscriber(&outcome);
            }
            Role::Loopback => {
                let (publishers, subscribers) = self.run_loopback().await?;
                for outcome in &publishers {
                    result.add_publisher(outcome);
                }
                for outcome in &subscribers {
                    result.add_subscriber(outcome);
                }
            }
        }

        result.test_duration = started.elapsed();
        info!(
            "Scan finished in {}",
            crate::utils::format_duration(result.test_duration)
        );
        Ok(result)
    }

    fn printer(&self, output: Box<dyn Write + Send + Sync>) -> Box<dyn ReportPrinter> {
        create_printer(
            self.config.output_format,
            self.config.printer_options(),
            output,
        )
    }

    async fn start_stream_channel(
        &self,
        role: ConnectionRole,
        transport_config: &TransportConfig,
    ) -> Result<Box<dyn MessageChannel>> {
        let mut channel = ChannelFactory::create(self.config.transport)?;
        start_channel(channel.as_mut(), role, transport_config)
            .await
            .with_context(|| format!("Failed to start {} channel", channel.name()))?;
        Ok(channel)
    }

    async fn run_publisher(self) -> Result<PingerOutcome> {
        let channel = self
            .start_stream_channel(ConnectionRole::Publisher, &self.config.transport_config)
            .await?;
        let config = Arc::new(self.config.clone());
        let printer = create_printer(
            self.config.output_format,
            self.config.printer_options(),
            self.output,
        );
        Pinger::new(config, channel, printer, self.clock)?
            .run()
            .await
    }

    async fn run_subscriber(self) -> Result<PongerOutcome> {
        let channel = self
            .start_stream_channel(ConnectionRole::Subscriber, &self.config.transport_config)
            .await?;
        let config = Arc::new(self.config.clone());
        let printer = create_printer(
            self.config.output_format,
            self.config.printer_options(),
            self.output,
        );
        Ponger::new(config, channel, printer)?.run().await
    }

    /// Transport settings for publisher `pub_id` when several publishers
    /// share one host: ports and socket paths are offset by the id.
    fn publisher_transport(&self, pub_id: i32) -> TransportConfig {
        let base = &self.config.transport_config;
        let mut config = base.clone();
        if self.config.num_publishers > 1 {
            config.port = base.port.wrapping_add(pub_id as u16);
            let mut path = base.socket_path.clone().into_os_string();
            path.push(format!(".{}", pub_id));
            config.socket_path = PathBuf::from(path);
        }
        config
    }

    async fn loopback_channels(
        &self,
    ) -> Result<(Vec<Box<dyn MessageChannel>>, Vec<Box<dyn MessageChannel>>)> {
        let mut publishers: Vec<Box<dyn MessageChannel>> = Vec::new();
        let mut subscribers: Vec<Box<dyn MessageChannel>> = Vec::new();

        if self.config.transport == TransportKind::Memory {
            let bus = MemoryBus::new().with_loss(self.config.loss_rate, self.config.loss_seed);
            for _ in 0..self.config.num_subscribers {
                subscribers.push(Box::new(bus.join(ConnectionRole::Subscriber)));
            }
            for _ in 0..self.config.num_publishers {
                publishers.push(Box::new(bus.join(ConnectionRole::Publisher)));
            }
            return Ok((publishers, subscribers));
        }

        let mut peers = Vec::new();
        for pub_id in 0..self.config.num_publishers as i32 {
            let transport = self.publisher_transport(pub_id);
            peers.push(match self.config.transport {
                TransportKind::Uds => transport.socket_path.display().to_string(),
                _ => format!("{}:{}", transport.host, transport.port),
            });
            publishers.push(
                self.start_stream_channel(ConnectionRole::Publisher, &transport)
                    .await?,
            );
        }

        let subscriber_transport = TransportConfig {
            peers,
            ..self.config.transport_config.clone()
        };
        for _ in 0..self.config.num_subscribers {
            subscribers.push(
                self.start_stream_channel(ConnectionRole::Subscriber, &subscriber_transport)
                    .await?,
            );
        }
        Ok((publishers, subscribers))
    }

    async fn run_loopback(mut self) -> Result<(Vec<PingerOutcome>, Vec<PongerOutcome>)> {
        let (publishers, subscribers) = self.loopback_channels().await?;

        let mut subscriber_output = Some(std::mem::replace(
            &mut self.subscriber_output,
            Box::new(std::io::sink()),
        ));
        let mut ponger_tasks: Vec<JoinHandle<Result<PongerOutcome>>> = Vec::new();
        for (sub_id, channel) in subscribers.into_iter().enumerate() {
            let output: Box<dyn Write + Send + Sync> = match subscriber_output.take() {
                Some(output) => output,
                None => Box::new(std::io::sink()),
            };
            let printer = self.printer(output);
            let ponger = Ponger::new(self.config.for_subscriber(sub_id as i32), channel, printer)?;
            ponger_tasks.push(tokio::spawn(ponger.run()));
        }

        let mut output = Some(std::mem::replace(
            &mut self.output,
            Box::new(std::io::sink()),
        ));
        let mut pinger_tasks: Vec<JoinHandle<Result<PingerOutcome>>> = Vec::new();
        for (pub_id, channel) in publishers.into_iter().enumerate() {
            let sink: Box<dyn Write + Send + Sync> = match output.take() {
                Some(output) => output,
                None => Box::new(std::io::sink()),
            };
            let printer = self.printer(sink);
            let pinger = Pinger::new(
                self.config.for_publisher(pub_id as i32),
                channel,
                printer,
                self.clock.clone(),
            )?;
            pinger_tasks.push(tokio::spawn(pinger.run()));
        }
        debug!(
            "Loopback running {} publisher and {} subscriber task(s)",
            pinger_tasks.len(),
            ponger_tasks.len()
        );

        let mut pinger_outcomes = Vec::new();
        for task in pinger_tasks {
            pinger_outcomes.push(task.await.context("Publisher task panicked")??);
        }
        let mut ponger_outcomes = Vec::new();
        for task in ponger_tasks {
            ponger_outcomes.push(task.await.context("Subscriber task panicked")??);
        }
        Ok((pinger_outcomes, ponger_outcomes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["pubsub-perftest"];
        argv.extend_from_slice(extra);
        Args::parse_from(argv)
    }

    #[test]
    fn test_latency_test_forces_strict_ping_pong() {
        let config = TestConfiguration::from_args(&args(&[
            "--latency-test",
            "--latency-count",
            "100",
            "--max-outstanding-pings",
            "50",
        ]))
        .unwrap();
        assert_eq!(config.latency_count, 1);
        assert_eq!(config.max_outstanding_pings, 1);
    }

    #[test]
    fn test_default_scan_and_echo_timeouts() {
        let config = TestConfiguration::from_args(&args(&["--scan"])).unwrap();
        assert_eq!(config.data_lengths.first(), Some(&64));
        assert_eq!(config.data_lengths.last(), Some(&63000));
        assert_eq!(config.echo_timeout, Duration::from_secs(5));

        let config = TestConfiguration::from_args(&args(&["--best-effort"])).unwrap();
        assert_eq!(config.echo_timeout, Duration::from_millis(200));
        let config =
            TestConfiguration::from_args(&args(&["--best-effort", "--echo-timeout", "1s"]))
                .unwrap();
        assert_eq!(config.echo_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_round_trip_and_output_flags() {
        let config = TestConfiguration::from_args(&args(&[
            "--round-trip",
            "--no-print-intervals",
            "--output-format",
            "json",
            "--cpu",
        ]))
        .unwrap();
        assert_eq!(config.latency_type, LatencyType::RoundTrip);
        let options = config.printer_options();
        assert!(!options.print_intervals);
        assert!(options.print_headers);
        assert!(options.show_cpu);
        assert!(!TestConfiguration::default().printer_options().show_cpu);
        assert_eq!(config.output_format, OutputFormat::Json);
    }

    #[test]
    fn test_validation_rejects_bad_configurations() {
        let rejected = |config: TestConfiguration| {
            matches!(config.validate(), Err(PerftestError::Configuration(_)))
        };
        let base = TestConfiguration {
            samples_per_size: 1000,
            latency_count: 100,
            ..TestConfiguration::default()
        };
        assert!(base.validate().is_ok());

        assert!(rejected(TestConfiguration {
            data_lengths: vec![OVERHEAD_BYTES - 1],
            ..base.clone()
        }));
        assert!(rejected(TestConfiguration {
            data_lengths: vec![MAX_DATA_SIZE + 1],
            ..base.clone()
        }));
        assert!(rejected(TestConfiguration {
            data_lengths: vec![],
            ..base.clone()
        }));
        assert!(rejected(TestConfiguration {
            latency_count: 2000,
            ..base.clone()
        }));
        assert!(rejected(TestConfiguration {
            max_outstanding_pings: MAX_OUTSTANDING_PINGS_LIMIT + 1,
            ..base.clone()
        }));
        assert!(rejected(TestConfiguration {
            loss_rate: 1.5,
            ..base.clone()
        }));
        assert!(rejected(TestConfiguration {
            transport: TransportKind::Tcp,
            loss_rate: 0.1,
            ..base.clone()
        }));
        assert!(rejected(TestConfiguration {
            role: Role::Publisher,
            ..base.clone()
        }));
        assert!(rejected(TestConfiguration {
            pub_id: 1,
            ..base.clone()
        }));
        assert!(rejected(TestConfiguration {
            num_subscribers: 0,
            ..base.clone()
        }));
        assert!(rejected(TestConfiguration {
            transport: TransportKind::Tcp,
            transport_config: TransportConfig {
                buffer_size: 16,
                ..TransportConfig::default()
            },
            ..base.clone()
        }));
        assert!(rejected(TestConfiguration {
            pub_rate: Some(0),
            ..base
        }));
    }

    #[test]
    fn test_from_args_reports_configuration_errors() {
        let err = TestConfiguration::from_args(&args(&["--data-len", "8"])).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PerftestError>(),
            Some(PerftestError::Configuration(_))
        ));
    }

    #[test]
    fn test_publisher_transport_offsets() {
        let runner = BenchmarkRunner::configure(TestConfiguration {
            num_publishers: 3,
            transport: TransportKind::Tcp,
            ..TestConfiguration::default()
        })
        .unwrap();
        let second = runner.publisher_transport(2);
        assert_eq!(second.port, runner.config().transport_config.port + 2);
        assert!(second.socket_path.to_string_lossy().ends_with(".2"));
    }
}
