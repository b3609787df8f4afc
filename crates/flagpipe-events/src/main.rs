//! flagpipe: replay recorded SDK events through the analytics pipeline.
//!
//! Usage:
//!   flagpipe [OPTIONS] --input <FILE>
//!
//! Options:
//!   -c, --config <FILE>             Config file path (default: config/flagpipe.toml)
//!   -i, --input <FILE>              JSON-lines file of recorded events
//!   --events-uri <URI>              Collector base URI (overrides config)
//!   --flush-timeout-secs <SECS>     How long to wait for the final flush (default: 30)

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{Level, info, warn};
use tracing_subscriber::FmtSubscriber;

use flagpipe_events::config::Config;
use flagpipe_events::events::EventFactory;
use flagpipe_events::processor::EventProcessor;
use flagpipe_events::replay::read_records;

/// CLI arguments for flagpipe.
#[derive(Parser, Debug)]
#[command(name = "flagpipe")]
#[command(about = "Replay recorded feature-flag events through the analytics pipeline")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/flagpipe.toml")]
    config: PathBuf,

    /// JSON-lines file of recorded events
    #[arg(short, long)]
    input: PathBuf,

    /// Collector base URI (overrides config file)
    #[arg(long)]
    events_uri: Option<String>,

    /// Seconds to wait for the final flush
    #[arg(long, default_value_t = 30)]
    flush_timeout_secs: u64,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    if let Err(e) = dotenvy::dotenv()
        && !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound)
    {
        eprintln!("Warning: Failed to load .env file: {}", e);
    }

    let args = Args::parse();

    let config_found = args.config.exists();
    let mut config = if config_found {
        Config::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        Config::default()
    };
    config.apply_env_overrides();
    config.apply_cli_overrides(args.events_uri);

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    if !config_found {
        warn!("Config file not found at {:?}, using defaults", args.config);
    }
    config.validate().context("Configuration validation failed")?;

    let file = File::open(&args.input)
        .with_context(|| format!("Failed to open input file {:?}", args.input))?;
    let records = read_records(BufReader::new(file))
        .with_context(|| format!("Failed to read events from {:?}", args.input))?;

    info!(
        records = records.len(),
        events_uri = %config.events.base_uri,
        diagnostics = config.diagnostics.enabled,
        "Starting replay"
    );

    let processor = EventProcessor::from_config(&config).context("Failed to create HTTP client")?;
    let factory = EventFactory::new(false);

    let batch = config.events.capacity.max(1);
    let mut skipped = 0usize;
    for (i, record) in records.into_iter().enumerate() {
        if i > 0 && i % batch == 0 {
            processor.flush();
        }
        match record.into_event(&factory) {
            Ok(event) => processor.submit(event).await,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable record");
                skipped += 1;
            }
        }
    }

    let flushed = processor
        .flush_and_wait(Duration::from_secs(args.flush_timeout_secs))
        .await;
    if !flushed {
        warn!("Flush did not complete before the timeout");
    }
    processor.close().await;

    let stats = processor.stats_snapshot();
    info!(
        received = stats.received,
        dropped = stats.dropped,
        skipped,
        flushes = stats.flushes,
        delivery_failures = stats.delivery_failures,
        delivery_disabled = processor.delivery_disabled(),
        "Replay finished"
    );

    Ok(())
}
