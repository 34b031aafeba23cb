//! Report emitters
//!
//! The three output formats share one trait and carry identical numbers;
//! only framing differs. The JSON emitter is stateful across calls so a whole
//! run, however many payload sizes it covers, forms one document:
//!
//! ```text
//! {"perftest":
//!     [
//!         { "length":N, "intervals":[ ... ], "summary":{ ... } },
//!         ...
//!     ]
//! }
//! ```

use crate::cli::OutputFormat;
use crate::metrics::{LatencyInterval, LatencySummary, LatencyType};
use crate::throughput::{ThroughputInterval, ThroughputSummary};
use parking_lot::Mutex;
use serde::Serialize;
use std::io::{self, Write};
use std::sync::Arc;

const TIME_UNIT: &str = "us";

/// Presentation options shared by every format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrinterOptions {
    pub print_intervals: bool,
    pub print_headers: bool,
    pub latency_type: LatencyType,
    /// Append a process CPU column to every interval and summary line.
    pub show_cpu: bool,
}

impl Default for PrinterOptions {
    fn default() -> Self {
        Self {
            print_intervals: true,
            print_headers: true,
            latency_type: LatencyType::OneWay,
            show_cpu: false,
        }
    }
}

/// Formats latency and throughput statistics.
pub trait ReportPrinter: Send {
    /// Set the sample length that subsequent reports refer to.
    fn set_data_length(&mut self, data_length: usize);

    fn print_initial_output(&mut self) -> io::Result<()> {
        Ok(())
    }

    fn print_latency_header(&mut self) -> io::Result<()>;
    fn print_latency_interval(&mut self, interval: &LatencyInterval) -> io::Result<()>;
    fn print_latency_summary(&mut self, summary: &LatencySummary) -> io::Result<()>;

    fn print_throughput_header(&mut self) -> io::Result<()>;
    fn print_throughput_interval(&mut self, interval: &ThroughputInterval) -> io::Result<()>;
    fn print_throughput_summary(&mut self, summary: &ThroughputSummary) -> io::Result<()>;

    fn print_final_output(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Build the printer for `format`, writing to `out`.
pub fn create_printer(
    format: OutputFormat,
    options: PrinterOptions,
    out: Box<dyn Write + Send>,
) -> Box<dyn ReportPrinter> {
    match format {
        OutputFormat::Legacy => Box::new(LegacyPrinter::new(options, out)),
        OutputFormat::Csv => Box::new(CsvPrinter::new(options, out)),
        OutputFormat::Json => Box::new(JsonPrinter::new(options, out)),
    }
}

/// Clonable in-memory sink, used to capture reports.
#[derive(Clone, Default)]
pub struct SharedBuffer(Arc<Mutex<Vec<u8>>>);

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Human-readable text.
pub struct LegacyPrinter {
    out: Box<dyn Write + Send>,
    options: PrinterOptions,
    data_length: usize,
}

impl LegacyPrinter {
    pub fn new(options: PrinterOptions, out: Box<dyn Write + Send>) -> Self {
        Self {
            out,
            options,
            data_length: 0,
        }
    }

    fn end_line(&mut self, cpu_percent: Option<f64>) -> io::Result<()> {
        if self.options.show_cpu {
            write!(self.out, " CPU {:.2} (%)", cpu_percent.unwrap_or(0.0))?;
        }
        writeln!(self.out)?;
        self.out.flush()
    }

    fn print_size_banner(&mut self) -> io::Result<()> {
        if self.options.print_headers && self.options.print_intervals {
            write!(
                self.out,
                "\n\n********** New data length is {}\n",
                self.data_length
            )?;
            self.out.flush()?;
        }
        Ok(())
    }
}

impl ReportPrinter for LegacyPrinter {
    fn set_data_length(&mut self, data_length: usize) {
        self.data_length = data_length;
    }

    fn print_latency_header(&mut self) -> io::Result<()> {
        self.print_size_banner()
    }

    fn print_latency_interval(&mut self, i: &LatencyInterval) -> io::Result<()> {
        let label = match self.options.latency_type {
            LatencyType::OneWay => "One way",
            LatencyType::RoundTrip => "Round trip",
        };
        write!(
            self.out,
            "{label} Latency: {:6} {u} Ave {:6.0} {u} Std {:6.1} {u} Min {:6} {u} Max {:6} {u}",
            i.latency_us,
            i.mean_us,
            i.stddev_us,
            i.min_us,
            i.max_us,
            u = TIME_UNIT
        )?;
        self.end_line(i.cpu_percent)
    }

    fn print_latency_summary(&mut self, s: &LatencySummary) -> io::Result<()> {
        write!(
            self.out,
            "Length: {:5} Latency: Ave {:6.0} {u} Std {:6.1} {u} Min {:6} {u} Max {:6} {u} \
             50% {:6} {u} 90% {:6} {u} 99% {:6} {u} 99.99% {:6} {u} 99.9999% {:6} {u}",
            s.data_length,
            s.mean_us,
            s.stddev_us,
            s.min_us,
            s.max_us,
            s.p50_us,
            s.p90_us,
            s.p99_us,
            s.p9999_us,
            s.p999999_us,
            u = TIME_UNIT
        )?;
        self.end_line(s.cpu_percent)
    }

    fn print_throughput_header(&mut self) -> io::Result<()> {
        self.print_size_banner()
    }

    fn print_throughput_interval(&mut self, i: &ThroughputInterval) -> io::Result<()> {
        write!(
            self.out,
            "Packets: {:8}  Packets/s: {:7}  Packets/s(ave): {:7.0}  Mbps: {:7.1}  \
             Mbps(ave): {:7.1}  Lost: {:5} ({:.2}%)",
            i.total_samples,
            i.samples_per_sec,
            i.ave_samples_per_sec,
            i.mbps,
            i.ave_mbps,
            i.lost_samples,
            i.lost_percent
        )?;
        self.end_line(i.cpu_percent)
    }

    fn print_throughput_summary(&mut self, s: &ThroughputSummary) -> io::Result<()> {
        write!(
            self.out,
            "Length: {:5}  Packets: {:8}  Packets/s(ave): {:7.0}  Mbps(ave): {:7.1}  \
             Lost: {:5} ({:.2}%)",
            s.data_length,
            s.total_samples,
            s.ave_samples_per_sec,
            s.ave_mbps,
            s.lost_samples,
            s.lost_percent
        )?;
        self.end_line(s.cpu_percent)
    }
}

/// Comma-separated columns with optional header rows.
pub struct CsvPrinter {
    out: Box<dyn Write + Send>,
    options: PrinterOptions,
    data_length: usize,
    print_summary_headers: bool,
}

impl CsvPrinter {
    pub fn new(options: PrinterOptions, out: Box<dyn Write + Send>) -> Self {
        Self {
            out,
            options,
            data_length: 0,
            print_summary_headers: true,
        }
    }

    fn end_header(&mut self) -> io::Result<()> {
        if self.options.show_cpu {
            write!(self.out, ", CPU (%)")?;
        }
        writeln!(self.out)
    }

    fn end_row(&mut self, cpu_percent: Option<f64>) -> io::Result<()> {
        if self.options.show_cpu {
            write!(self.out, ",{:8.2}", cpu_percent.unwrap_or(0.0))?;
        }
        writeln!(self.out)?;
        self.out.flush()
    }

    /// Summary headers repeat per size only when intervals are interleaved.
    fn take_summary_header(&mut self) -> bool {
        if !(self.print_summary_headers && self.options.print_headers) {
            return false;
        }
        if !self.options.print_intervals {
            self.print_summary_headers = false;
        }
        true
    }
}

impl ReportPrinter for CsvPrinter {
    fn set_data_length(&mut self, data_length: usize) {
        self.data_length = data_length;
    }

    fn print_latency_header(&mut self) -> io::Result<()> {
        if self.options.print_headers && self.options.print_intervals {
            write!(
                self.out,
                "\nIntervals {} Latency for {} Bytes:\n",
                self.options.latency_type.label(),
                self.data_length
            )?;
            write!(
                self.out,
                "Length (Bytes), Latency ({u}), Ave ({u}), Std ({u}), Min ({u}), Max ({u})",
                u = TIME_UNIT
            )?;
            self.end_header()?;
        } else {
            writeln!(self.out)?;
        }
        self.out.flush()
    }

    fn print_latency_interval(&mut self, i: &LatencyInterval) -> io::Result<()> {
        write!(
            self.out,
            "{:14},{:13},{:9.0},{:9.1},{:9},{:9}",
            self.data_length, i.latency_us, i.mean_us, i.stddev_us, i.min_us, i.max_us
        )?;
        self.end_row(i.cpu_percent)
    }

    fn print_latency_summary(&mut self, s: &LatencySummary) -> io::Result<()> {
        if self.take_summary_header() {
            write!(
                self.out,
                "\n{} Latency Summary:\n",
                self.options.latency_type.label()
            )?;
            write!(
                self.out,
                "Length (Bytes), Ave ({u}), Std ({u}), Min ({u}), Max ({u}), 50% ({u}), \
                 90% ({u}), 99% ({u}), 99.99% ({u}), 99.9999% ({u})",
                u = TIME_UNIT
            )?;
            self.end_header()?;
        }
        write!(
            self.out,
            "{:14},{:9.0},{:9.1},{:9},{:9},{:9},{:9},{:9},{:12},{:14}",
            s.data_length,
            s.mean_us,
            s.stddev_us,
            s.min_us,
            s.max_us,
            s.p50_us,
            s.p90_us,
            s.p99_us,
            s.p9999_us,
            s.p999999_us
        )?;
        self.end_row(s.cpu_percent)
    }

    fn print_throughput_header(&mut self) -> io::Result<()> {
        if self.options.print_headers && self.options.print_intervals {
            write!(
                self.out,
                "\nIntervals Throughput for {} Bytes:\n",
                self.data_length
            )?;
            write!(
                self.out,
                "Length (Bytes), Total Samples,  Samples/s, Ave Samples/s,     Mbps,  \
                 Ave Mbps, Lost Samples, Lost Samples (%)"
            )?;
            self.end_header()?;
        } else {
            writeln!(self.out)?;
        }
        self.out.flush()
    }

    fn print_throughput_interval(&mut self, i: &ThroughputInterval) -> io::Result<()> {
        writeln!(
            self.out,
            "{:14},{:14},{:11},{:14.0},{:9.1},{:10.1},{:13},{:17.2}",
            self.data_length,
            i.total_samples,
            i.samples_per_sec,
            i.ave_samples_per_sec,
            i.mbps,
            i.ave_mbps,
            i.lost_samples,
            i.lost_percent
        )?;
        self.end_row(i.cpu_percent)
    }

    fn print_throughput_summary(&mut self, s: &ThroughputSummary) -> io::Result<()> {
        if self.take_summary_header() {
            write!(self.out, "\nThroughput Summary:\n")?;
            write!(
                self.out,
                "Length (Bytes), Total Samples, Ave Samples/s,    Ave Mbps, \
                 Lost Samples, Lost Samples (%)"
            )?;
            self.end_header()?;
        }
        write!(
            self.out,
            "{:14},{:14},{:14.0},{:12.1},{:13},{:17.2}",
            s.data_length,
            s.total_samples,
            s.ave_samples_per_sec,
            s.ave_mbps,
            s.lost_samples,
            s.lost_percent
        )?;
        self.end_row(s.cpu_percent)
    }
}

/// A single JSON document spanning the run.
pub struct JsonPrinter {
    out: Box<dyn Write + Send>,
    options: PrinterOptions,
    data_length: usize,
    document_open: bool,
    blocks_written: usize,
    block_open: bool,
    intervals_open: bool,
    intervals_written: usize,
}

#[derive(Serialize)]
struct LatencyIntervalRecord {
    latency: u64,
    latency_ave: f64,
    latency_std: f64,
    latency_min: u64,
    latency_max: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cpu: Option<f64>,
}

#[derive(Serialize)]
struct LatencySummaryRecord {
    latency_ave: f64,
    latency_std: f64,
    latency_min: u64,
    latency_max: u64,
    latency_50: u64,
    latency_90: u64,
    latency_99: u64,
    #[serde(rename = "latency_99.99")]
    latency_9999: u64,
    #[serde(rename = "latency_99.9999")]
    latency_999999: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cpu: Option<f64>,
}

#[derive(Serialize)]
struct ThroughputIntervalRecord {
    length: usize,
    packets: u64,
    #[serde(rename = "packets/s")]
    packets_per_sec: u64,
    #[serde(rename = "packets/s_ave")]
    packets_per_sec_ave: f64,
    mbps: f64,
    mbps_ave: f64,
    lost: u64,
    lost_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cpu: Option<f64>,
}

#[derive(Serialize)]
struct ThroughputSummaryRecord {
    packets: u64,
    #[serde(rename = "packets/sAve")]
    packets_per_sec_ave: f64,
    #[serde(rename = "mbpsAve")]
    mbps_ave: f64,
    lost: u64,
    #[serde(rename = "lostPercent")]
    lost_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    cpu: Option<f64>,
}

/// Round to `decimals` places. JSON numbers cannot be NaN or infinite.
fn rounded(value: f64, decimals: i32) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}

impl JsonPrinter {
    pub fn new(options: PrinterOptions, out: Box<dyn Write + Send>) -> Self {
        Self {
            out,
            options,
            data_length: 0,
            document_open: false,
            blocks_written: 0,
            block_open: false,
            intervals_open: false,
            intervals_written: 0,
        }
    }

    fn cpu(&self, cpu_percent: Option<f64>) -> Option<f64> {
        self.options
            .show_cpu
            .then(|| rounded(cpu_percent.unwrap_or(0.0), 2))
    }

    fn open_document(&mut self) -> io::Result<()> {
        if !self.document_open {
            write!(self.out, "{{\"perftest\":\n\t[")?;
            self.document_open = true;
        }
        Ok(())
    }

    fn open_block(&mut self) -> io::Result<()> {
        self.open_document()?;
        if self.block_open {
            self.close_block()?;
        }
        if self.blocks_written > 0 {
            write!(self.out, ",")?;
        }
        write!(self.out, "\n\t\t{{\n\t\t\t\"length\":{}", self.data_length)?;
        self.block_open = true;
        self.blocks_written += 1;
        if self.options.print_intervals {
            write!(self.out, ",\n\t\t\t\"intervals\":[")?;
            self.intervals_open = true;
            self.intervals_written = 0;
        }
        self.out.flush()
    }

    fn close_intervals(&mut self) -> io::Result<()> {
        if self.intervals_open {
            write!(self.out, "\n\t\t\t]")?;
            self.intervals_open = false;
        }
        Ok(())
    }

    fn close_block(&mut self) -> io::Result<()> {
        self.close_intervals()?;
        write!(self.out, "\n\t\t}}")?;
        self.block_open = false;
        Ok(())
    }

    fn write_interval<T: Serialize>(&mut self, record: &T) -> io::Result<()> {
        if !self.block_open {
            self.open_block()?;
        }
        if !self.intervals_open {
            return Ok(());
        }
        if self.intervals_written > 0 {
            write!(self.out, ",")?;
        }
        self.intervals_written += 1;
        write!(self.out, "\n\t\t\t\t")?;
        serde_json::to_writer(&mut self.out, record)?;
        self.out.flush()
    }

    /// Write the size's summary object and close its block.
    fn write_summary<T: Serialize>(&mut self, record: &T) -> io::Result<()> {
        if !self.block_open {
            self.open_block()?;
        }
        self.close_intervals()?;
        write!(self.out, ",\n\t\t\t\"summary\":")?;
        serde_json::to_writer_pretty(&mut self.out, record)?;
        self.close_block()?;
        self.out.flush()
    }
}

impl ReportPrinter for JsonPrinter {
    fn set_data_length(&mut self, data_length: usize) {
        self.data_length = data_length;
    }

    fn print_initial_output(&mut self) -> io::Result<()> {
        self.open_document()?;
        self.out.flush()
    }

    fn print_latency_header(&mut self) -> io::Result<()> {
        self.open_block()
    }

    fn print_latency_interval(&mut self, i: &LatencyInterval) -> io::Result<()> {
        let record = LatencyIntervalRecord {
            latency: i.latency_us,
            latency_ave: rounded(i.mean_us, 0),
            latency_std: rounded(i.stddev_us, 1),
            latency_min: i.min_us,
            latency_max: i.max_us,
            cpu: self.cpu(i.cpu_percent),
        };
        self.write_interval(&record)
    }

    fn print_latency_summary(&mut self, s: &LatencySummary) -> io::Result<()> {
        let record = LatencySummaryRecord {
            latency_ave: rounded(s.mean_us, 1),
            latency_std: rounded(s.stddev_us, 1),
            latency_min: s.min_us,
            latency_max: s.max_us,
            latency_50: s.p50_us,
            latency_90: s.p90_us,
            latency_99: s.p99_us,
            latency_9999: s.p9999_us,
            latency_999999: s.p999999_us,
            cpu: self.cpu(s.cpu_percent),
        };
        self.write_summary(&record)
    }

    fn print_throughput_header(&mut self) -> io::Result<()> {
        self.open_block()
    }

    fn print_throughput_interval(&mut self, i: &ThroughputInterval) -> io::Result<()> {
        let record = ThroughputIntervalRecord {
            length: self.data_length,
            packets: i.total_samples,
            packets_per_sec: i.samples_per_sec,
            packets_per_sec_ave: rounded(i.ave_samples_per_sec, 2),
            mbps: rounded(i.mbps, 1),
            mbps_ave: rounded(i.ave_mbps, 1),
            lost: i.lost_samples,
            lost_percent: rounded(i.lost_percent, 2),
            cpu: self.cpu(i.cpu_percent),
        };
        self.write_interval(&record)
    }

    fn print_throughput_summary(&mut self, s: &ThroughputSummary) -> io::Result<()> {
        let record = ThroughputSummaryRecord {
            packets: s.total_samples,
            packets_per_sec_ave: rounded(s.ave_samples_per_sec, 0),
            mbps_ave: rounded(s.ave_mbps, 1),
            lost: s.lost_samples,
            lost_percent: rounded(s.lost_percent, 2),
            cpu: self.cpu(s.cpu_percent),
        };
        self.write_summary(&record)
    }

    fn print_final_output(&mut self) -> io::Result<()> {
        self.open_document()?;
        if self.block_open {
            self.close_block()?;
        }
        write!(self.out, "\n\t]\n}}\n")?;
        self.document_open = false;
        self.out.flush()
    }
}
