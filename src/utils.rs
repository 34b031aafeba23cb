//! # Utility Functions and Helper Module
//!
//! Small helpers used throughout the perftest: run identifiers, the wall
//! clock behind sample timestamps, human-readable formatting and parameter
//! validation.
//!
//! ## Usage Examples
//!
//! ```rust
//! use pubsub_perftest::utils::*;
//! use std::time::Duration;
//!
//! // Format durations for display
//! let duration_str = format_duration(Duration::from_micros(1500));
//! assert_eq!(duration_str, "1.50ms");
//!
//! // Validate configuration parameters
//! # fn main() -> anyhow::Result<()> {
//! validate_buffer_size(65536)?; // OK
//! # Ok(())
//! # }
//! ```

use anyhow::Result;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a unique identifier for test runs
///
/// Creates a UUID v4 string identifying one run in its JSON record.
pub fn generate_test_id() -> String {
    Uuid::new_v4().to_string()
}

/// Get current timestamp as microseconds since Unix epoch
///
/// Sample envelopes carry their send time at microsecond resolution, split
/// into seconds and microseconds.
///
/// ## Error Handling
///
/// If the system time is before the Unix epoch (very rare), returns 0
/// to provide a safe fallback rather than panicking.
pub fn current_timestamp_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

/// Format a duration in a human-readable way
///
/// Converts a Duration to a human-readable string, automatically selecting
/// the most appropriate unit based on the magnitude.
///
/// ## Unit Selection Logic
///
/// - **Nanoseconds**: < 1,000 ns (e.g., "500ns")
/// - **Microseconds**: < 1,000,000 ns (e.g., "1.50μs")
/// - **Milliseconds**: < 1,000,000,000 ns (e.g., "25.75ms")
/// - **Seconds**: < 60 seconds (e.g., "5.25s")
/// - **Minutes and Hours**: For longer durations (e.g., "5m 30s", "2h 15m 30s")
///
/// ## Examples
///
/// ```rust
/// # use pubsub_perftest::utils::format_duration;
/// # use std::time::Duration;
/// assert_eq!(format_duration(Duration::from_nanos(750)), "750ns");
/// assert_eq!(format_duration(Duration::from_micros(2500)), "2.50ms");
/// assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
/// ```
pub fn format_duration(duration: Duration) -> String {
    let total_ns = duration.as_nanos();

    if total_ns < 1_000 {
        format!("{}ns", total_ns)
    } else if total_ns < 1_000_000 {
        format!("{:.2}μs", total_ns as f64 / 1_000.0)
    } else if total_ns < 1_000_000_000 {
        format!("{:.2}ms", total_ns as f64 / 1_000_000.0)
    } else if total_ns < 60_000_000_000 {
        format!("{:.2}s", total_ns as f64 / 1_000_000_000.0)
    } else {
        let seconds = duration.as_secs();
        let minutes = seconds / 60;
        let remaining_seconds = seconds % 60;

        if minutes < 60 {
            format!("{}m {}s", minutes, remaining_seconds)
        } else {
            let hours = minutes / 60;
            let remaining_minutes = minutes % 60;
            format!("{}h {}m {}s", hours, remaining_minutes, remaining_seconds)
        }
    }
}

/// Format bytes with binary (1024-based) units, e.g. "1.50 KB".
pub fn format_bytes(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.2} {}", value, UNITS[unit])
}

/// Validate that a socket buffer size is reasonable
///
/// ## Validation Rules
///
/// - **Minimum**: 1024 bytes (1 KB) to ensure adequate buffering
/// - **Maximum**: 1 GB to prevent excessive memory usage
pub fn validate_buffer_size(buffer_size: usize) -> Result<()> {
    if buffer_size < 1024 {
        anyhow::bail!(
            "Buffer size {} is too small (minimum 1024 bytes)",
            buffer_size
        );
    }
    if buffer_size > 1024 * 1024 * 1024 {
        anyhow::bail!("Buffer size {} is too large (maximum 1GB)", buffer_size);
    }
    Ok(())
}
