use crate::cli::{Role, TransportKind};
use crate::metrics::{LatencySummary, LatencyType};
use crate::protocol::{PingerOutcome, PongerOutcome};
use crate::throughput::ThroughputSummary;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Everything measured for one sample length.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SizeResult {
    pub data_length: usize,
    pub latency: Option<LatencySummary>,
    pub throughput: Option<ThroughputSummary>,
}

/// Outcome of a whole scan, as seen by this process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: String,
    pub role: Role,
    pub transport: TransportKind,
    pub latency_type: LatencyType,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub test_duration: Duration,
    pub sizes: Vec<SizeResult>,
    pub samples_sent: u64,
    pub samples_received: u64,
    pub lost_samples: u64,
    pub lost_rounds: u64,
    pub clock_anomalies: u64,
    pub malformed_frames: u64,
    pub deadline_reached: bool,
}

impl RunResult {
    pub fn new(role: Role, transport: TransportKind, latency_type: LatencyType) -> Self {
        Self {
            run_id: crate::utils::generate_test_id(),
            role,
            transport,
            latency_type,
            timestamp: chrono::Utc::now(),
            test_duration: Duration::ZERO,
            sizes: Vec::new(),
            samples_sent: 0,
            samples_received: 0,
            lost_samples: 0,
            lost_rounds: 0,
            clock_anomalies: 0,
            malformed_frames: 0,
            deadline_reached: false,
        }
    }

    fn size_mut(&mut self, data_length: usize) -> &mut SizeResult {
        let index = match self.sizes.iter().position(|s| s.data_length == data_length) {
            Some(index) => index,
            None => {
                self.sizes.push(SizeResult {
                    data_length,
                    ..SizeResult::default()
                });
                self.sizes.len() - 1
            }
        };
        &mut self.sizes[index]
    }

    /// Fold in what a publisher measured. Only publisher 0 carries latency.
    pub fn add_publisher(&mut self, outcome: &PingerOutcome) {
        for &data_length in &outcome.sizes_measured {
            self.size_mut(data_length);
        }
        for summary in &outcome.summaries {
            self.size_mut(summary.data_length).latency = Some(summary.clone());
        }
        self.samples_sent += outcome.samples_sent;
        self.lost_rounds += outcome.lost_rounds;
        self.clock_anomalies += outcome.clock_anomalies;
        self.malformed_frames += outcome.malformed_frames;
        self.deadline_reached |= outcome.deadline_reached;
    }

    /// Fold in what a subscriber measured. Throughput per size is kept from
    /// the first subscriber that reports it.
    pub fn add_subscriber(&mut self, outcome: &PongerOutcome) {
        for summary in &outcome.summaries {
            let size = self.size_mut(summary.data_length);
            if size.throughput.is_none() {
                size.throughput = Some(summary.clone());
            }
        }
        self.samples_received += outcome.totals.samples;
        self.lost_samples += outcome.totals.lost;
        self.malformed_frames += outcome.malformed_frames;
    }

    pub fn latency_for(&self, data_length: usize) -> Option<&LatencySummary> {
        self.sizes
            .iter()
            .find(|s| s.data_length == data_length)
            .and_then(|s| s.latency.as_ref())
    }

    pub fn throughput_for(&self, data_length: usize) -> Option<&ThroughputSummary> {
        self.sizes
            .iter()
            .find(|s| s.data_length == data_length)
            .and_then(|s| s.throughput.as_ref())
    }
}

/// System information for reproducibility
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub os: String,
    pub architecture: String,
    pub cpu_cores: usize,
    pub hostname: Option<String>,
    pub perftest_version: String,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            cpu_cores: num_cpus::get(),
            hostname: std::env::var("HOSTNAME").ok(),
            perftest_version: crate::VERSION.to_string(),
        }
    }
}

/// Run record metadata
#[derive(Debug, Serialize, Deserialize)]
pub struct RunMetadata {
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub system_info: SystemInfo,
}

/// The document written by `--output-file`
#[derive(Debug, Serialize, Deserialize)]
pub struct RunRecord {
    pub metadata: RunMetadata,
    pub result: RunResult,
}

/// Writes the JSON run record.
pub struct ResultsManager {
    output_file: PathBuf,
}

impl ResultsManager {
    pub fn new(output_file: &Path) -> Self {
        Self {
            output_file: output_file.to_path_buf(),
        }
    }

    pub fn output_file(&self) -> &Path {
        &self.output_file
    }

    /// Write `result` with run metadata, replacing any existing file.
    pub fn write(&self, result: &RunResult) -> Result<()> {
        let record = RunRecord {
            metadata: RunMetadata {
                version: crate::VERSION.to_string(),
                timestamp: chrono::Utc::now(),
                system_info: SystemInfo::default(),
            },
            result: result.clone(),
        };

        let json = serde_json::to_string_pretty(&record)?;
        std::fs::write(&self.output_file, json)
            .with_context(|| format!("Failed to write {}", self.output_file.display()))?;

        info!("Run record written to: {:?}", self.output_file);
        Ok(())
    }
}
