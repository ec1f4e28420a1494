//! CLI entry point for the GTFS-RT ingester.
//!
//! Each invocation handles exactly one poll; an external scheduler (cron, a
//! systemd timer, ...) decides how often to run it.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gtfs_rt_ingest::config::{IngestConfig, NullArrivalPolicy, VehicleFreshness};
use gtfs_rt_ingest::fetch::{ApiKey, BasicClient, HttpClient, fetch_bytes};
use gtfs_rt_ingest::ingest::ingest_bytes;
use gtfs_rt_ingest::output::{append_record, report, write_json};
use gtfs_rt_ingest::parser::decode;
use gtfs_rt_ingest::sink::{MemorySink, PostgresSink};
use gtfs_rt_ingest::stats::PollSummary;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Parser)]
#[command(name = "gtfs_rt_ingest")]
#[command(
    about = "Merge GTFS-RT trip updates and vehicle positions into Postgres",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch one poll and merge it into storage
    Ingest {
        #[command(flatten)]
        feed: FeedArgs,

        #[command(flatten)]
        db: DbArgs,

        /// Merge into an in-memory store instead of Postgres
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// CSV file to append the poll summary to
        #[arg(long)]
        summary_csv: Option<PathBuf>,

        /// How to key stop time events that carry no arrival time
        #[arg(
            long,
            env = "NULL_ARRIVAL_POLICY",
            value_enum,
            default_value_t = NullArrivalPolicy::Distinct
        )]
        null_arrival: NullArrivalPolicy,

        /// Whether an older vehicle report may replace a newer stored one
        #[arg(
            long,
            env = "VEHICLE_FRESHNESS",
            value_enum,
            default_value_t = VehicleFreshness::LastWriteWins
        )]
        vehicle_freshness: VehicleFreshness,
    },
    /// Decode a feed and report its contents without writing anything
    Inspect {
        #[command(flatten)]
        feed: FeedArgs,
    },
    /// Create or upgrade the realtime tables
    Migrate {
        #[command(flatten)]
        db: DbArgs,
    },
}

#[derive(Args)]
struct FeedArgs {
    /// Path to file or URL to fetch
    #[arg(value_name = "FILE_OR_URL", env = "FEED_URL")]
    source: String,

    /// API key sent with HTTP requests
    #[arg(long, env = "FEED_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Header carrying the API key
    #[arg(long, env = "FEED_API_KEY_HEADER", default_value = "x-api-key")]
    api_key_header: String,

    /// HTTP request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,
}

#[derive(Args)]
struct DbArgs {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    database_url: Option<String>,

    /// Maximum pooled connections
    #[arg(long, env = "DB_MAX_CONNECTIONS", default_value_t = 5)]
    max_connections: u32,

    /// Retries for transient storage failures
    #[arg(long, env = "SINK_MAX_RETRIES", default_value_t = 3)]
    max_retries: u32,
}

impl DbArgs {
    async fn connect(&self) -> Result<PostgresSink> {
        let url = self
            .database_url
            .as_deref()
            .context("DATABASE_URL must be set")?;
        Ok(PostgresSink::connect(url, self.max_connections, self.max_retries).await?)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok(); // Load .env file

    let _file_guard = init_tracing()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Ingest {
            feed,
            db,
            dry_run,
            summary_csv,
            null_arrival,
            vehicle_freshness,
        } => {
            let config = IngestConfig::default()
                .with_null_arrival(null_arrival)
                .with_vehicle_freshness(vehicle_freshness);
            let bytes = fetcher(&feed).await?;

            let summary = if dry_run {
                warn!("Dry run, merging into memory only");
                let sink = MemorySink::new();
                ingest_bytes(&bytes, &sink, &config).await?
            } else {
                let sink = db.connect().await?;
                let result = ingest_bytes(&bytes, &sink, &config).await;
                sink.pool().close().await;
                result?
            };
            let summary = summary.with_source(&feed.source);

            report(&summary);
            if let Some(path) = summary_csv {
                append_record(&path, &summary)?;
            }
        }
        Commands::Inspect { feed } => {
            let bytes = fetcher(&feed).await?;
            let snapshot = decode(&bytes)?;
            let summary = PollSummary::from_snapshot(&snapshot).with_source(&feed.source);

            write_json(std::io::stdout().lock(), &summary)?;
        }
        Commands::Migrate { db } => {
            let sink = db.connect().await?;
            let result = sink.migrate().await;
            sink.pool().close().await;
            result?;
            info!("Schema is up to date");
        }
    }

    Ok(())
}

/// Logging setup: colored stderr + JSON rolling log file.
fn init_tracing() -> Result<WorkerGuard> {
    let log_file_path =
        std::env::var("LOG_FILE_PATH").unwrap_or_else(|_| "logs/gtfs_rt_ingest.log".to_string());
    let log_dir = Path::new(&log_file_path)
        .parent()
        .unwrap_or(Path::new("logs"));
    let log_file_name = Path::new(&log_file_path)
        .file_name()
        .unwrap_or(OsStr::new("gtfs_rt_ingest.log"));

    let file_appender = tracing_appender::rolling::daily(log_dir, log_file_name);
    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);

    let stderr_layer = fmt::layer()
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::from_env("RUST_LOG").add_directive("info".parse()?));

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_writer(non_blocking_file)
        .with_filter(EnvFilter::from_env("RUST_LOG_JSON").add_directive("debug".parse()?));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    Ok(file_guard)
}

/// Loads feed data from a local file path or fetches it over HTTP.
#[tracing::instrument(skip(feed), fields(source = %feed.source))]
async fn fetcher(feed: &FeedArgs) -> Result<Vec<u8>> {
    if !feed.source.starts_with("http") {
        return Ok(tokio::fs::read(&feed.source).await?);
    }

    let basic = BasicClient::new(Duration::from_secs(feed.timeout_secs))?;
    let client: Box<dyn HttpClient> = match &feed.api_key {
        Some(key) => Box::new(ApiKey::new(basic, &feed.api_key_header, key)?),
        None => Box::new(basic),
    };

    let fetch_start = std::time::Instant::now();
    let bytes = fetch_bytes(client.as_ref(), &feed.source).await?;
    let elapsed = fetch_start.elapsed();
    if elapsed.as_secs() > 15 {
        warn!(elapsed_secs = elapsed.as_secs(), "Feed fetch was slow");
    }

    Ok(bytes.to_vec())
}
