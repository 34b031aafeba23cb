use anyhow::Result;
use pubsub_perftest::{
    cli::{OutputFormat, Role, TransportKind},
    ipc::TransportConfig,
    printer::SharedBuffer,
    BenchmarkRunner, TestConfiguration,
};
use std::time::Duration;

/// The loopback role over Unix domain sockets: the runner binds the socket,
/// connects the subscriber and removes the socket file afterwards.
#[tokio::test]
async fn uds_loopback_scan() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let socket_path = dir.path().join("perftest.sock");
    let config = TestConfiguration {
        role: Role::Loopback,
        transport: TransportKind::Uds,
        data_lengths: vec![100, 2048],
        samples_per_size: 50,
        latency_count: 1,
        max_outstanding_pings: 1,
        warmup_samples: 3,
        output_format: OutputFormat::Csv,
        print_intervals: false,
        discovery_timeout: Duration::from_secs(5),
        transport_config: TransportConfig {
            socket_path: socket_path.clone(),
            ..TransportConfig::default()
        },
        ..TestConfiguration::default()
    };

    let publisher_out = SharedBuffer::new();
    let result = BenchmarkRunner::configure(config)?
        .with_output(Box::new(publisher_out.clone()))
        .with_subscriber_output(Box::new(SharedBuffer::new()))
        .run_scan()
        .await?;

    assert_eq!(result.sizes.len(), 2);
    assert_eq!(result.latency_for(100).map(|l| l.count), Some(50));
    assert_eq!(result.latency_for(2048).map(|l| l.count), Some(50));
    assert_eq!(result.throughput_for(2048).map(|t| t.total_samples), Some(50));
    assert_eq!(result.lost_rounds, 0);
    assert!(!socket_path.exists());

    // Summary-only CSV: one header, one row per size.
    let text = publisher_out.contents();
    assert_eq!(text.matches("Length (Bytes)").count(), 1);
    Ok(())
}
