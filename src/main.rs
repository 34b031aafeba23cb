//! # Publish/Subscribe Perftest - Main Entry Point
//!
//! The main function performs these key operations:
//! 1. **Parse arguments**: Processes command-line configuration
//! 2. **Initialize logging**: Colored terminal logs on stderr, optional log file
//! 3. **Create test configuration**: Converts and validates CLI args
//! 4. **Run the scan**: Executes every payload size for the chosen role
//! 5. **Write results**: Optional JSON run record
//!
//! Reports are written to stdout; everything else goes to stderr, so stdout
//! can be piped straight into a CSV or JSON consumer.

use anyhow::Result;
use clap::Parser;
use pubsub_perftest::{
    benchmark::{BenchmarkRunner, TestConfiguration},
    cli::Args,
    logging::init_logging,
    results::ResultsManager,
};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Held until exit so buffered log lines reach the file.
    let _log_guard = init_logging(args.verbose, args.quiet, args.log_file.as_deref())?;

    info!("Starting pubsub-perftest {}", pubsub_perftest::VERSION);

    let config = TestConfiguration::from_args(&args)?;
    let output_file = config.output_file.clone();

    let result = match BenchmarkRunner::configure(config)?.run_scan().await {
        Ok(result) => result,
        Err(e) => {
            error!("Perftest failed: {:#}", e);
            return Err(e);
        }
    };

    if result.deadline_reached {
        warn!("Execution time reached before the scan completed");
    }
    if result.lost_rounds > 0 {
        info!("{} latency round(s) were lost", result.lost_rounds);
    }

    if let Some(path) = output_file {
        ResultsManager::new(&path).write(&result)?;
    }

    info!("Perftest completed successfully");
    Ok(())
}
