use anyhow::{bail, Context, Result};
use archive_service::config::{Config, LogFormat};
use archive_service::download::{import_segment, DownloadOutcome, Downloader};
use archive_service::migrate::Migrator;
use archive_service::month::MonthReporter;
use archive_service::playlist::{PlaylistSynthesizer, UriMode};
use archive_service::progress::{Progress, ProgressFn};
use archive_service::scratch::ScratchDir;
use archive_service::segment::SegmentName;
use archive_service::store::{ObjectStore, S3Store};
use archive_service::timeline::{TimeWindow, TimelineQuery};
use archive_service::zone::ArchiveZone;
use archive_service::RecordingLocator;
use bytes::Bytes;
use chrono::{DateTime, NaiveDateTime};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Operator CLI for the recording archive
#[derive(Debug, Parser)]
#[command(name = "archive-service", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the segments covering a window
    Segments {
        #[command(flatten)]
        channel: ChannelArgs,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Print start/duration spans of a window
    Timeline {
        #[command(flatten)]
        channel: ChannelArgs,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Print an HLS VOD playlist for a window
    Playlist {
        #[command(flatten)]
        channel: ChannelArgs,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Print the per-day availability of a month
    Month {
        #[command(flatten)]
        channel: ChannelArgs,
        /// Month as yyyyMM
        #[arg(long)]
        month: String,
    },
    /// Move a channel's recordings to another archive root
    Migrate {
        #[command(flatten)]
        channel: ChannelArgs,
        /// Root the objects currently live under
        #[arg(long)]
        from: String,
        /// Root to move them to
        #[arg(long)]
        to: String,
    },
    /// Download a window into a single file
    Download {
        #[command(flatten)]
        channel: ChannelArgs,
        #[command(flatten)]
        window: WindowArgs,
        /// Destination file
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Upload local segment files under their canonical keys
    Import {
        #[command(flatten)]
        channel: ChannelArgs,
        /// Files named `<start>-<durationMs>.<ext>`
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Remove expired files from the download scratch directory
    Sweep {
        /// Keep sweeping every `download.sweep_interval_secs` until interrupted
        #[arg(long)]
        watch: bool,
    },
}

#[derive(Debug, Args)]
struct ChannelArgs {
    #[arg(long)]
    device: String,
    #[arg(long)]
    channel: String,
    /// Archive root; `archive.root` when omitted
    #[arg(long)]
    root: Option<String>,
}

#[derive(Debug, Args)]
struct WindowArgs {
    /// Window start: epoch ms, yyyyMMddHHmmss or RFC 3339
    #[arg(long)]
    start: String,
    /// Window end, inclusive
    #[arg(long)]
    end: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, config.service.log_format);

    // Initialize metrics
    if let Some(port) = config.service.metrics_port {
        init_metrics(port)?;
    }

    let store: Arc<dyn ObjectStore> = Arc::new(
        S3Store::new(&config.s3)
            .await
            .context("Failed to initialize S3 store")?,
    );
    let zone = config.archive_zone();
    info!(zone = %zone, "Archive zone");

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signal_token.cancel();
    });

    run(cli.command, &config, store, zone, &cancel).await
}

async fn run(
    command: Command,
    config: &Config,
    store: Arc<dyn ObjectStore>,
    zone: ArchiveZone,
    cancel: &CancellationToken,
) -> Result<()> {
    let query = TimelineQuery::new(store.clone(), zone)
        .with_lookback_ms(config.archive.lookback_ms())
        .with_page_size(config.s3.list_page_size);

    match command {
        Command::Segments { channel, window } => {
            let locator = channel.locator(config)?;
            let set = query
                .segments_cancellable(&locator, window.parse(zone)?, cancel)
                .await
                .context("Segment query failed")?;
            for warning in &set.warnings {
                warn!(key = %warning.key, reason = %warning.reason, "Skipped key");
            }
            print_json(&set)
        }
        Command::Timeline { channel, window } => {
            let locator = channel.locator(config)?;
            let spans = query
                .timeline(&locator, window.parse(zone)?)
                .await
                .context("Timeline query failed")?;
            print_json(&spans)
        }
        Command::Playlist { channel, window } => {
            let locator = channel.locator(config)?;
            let set = query
                .segments_cancellable(&locator, window.parse(zone)?, cancel)
                .await
                .context("Segment query failed")?;
            let synthesizer = PlaylistSynthesizer::new(store, UriMode::from_config(config))
                .with_gap_ms(config.archive.discontinuity_gap_ms);
            let playlist = synthesizer
                .synthesize_segments(&set.segments)
                .await
                .context("Failed to synthesize playlist")?;
            print!("{playlist}");
            Ok(())
        }
        Command::Month { channel, month } => {
            let locator = channel.locator(config)?;
            let reporter = MonthReporter::new(store, config.archive.month_probe_concurrency);
            let bitmap = reporter
                .month_bitmap(&locator, &month)
                .await
                .context("Month report failed")?;
            print_json(&serde_json::json!({
                "month": month,
                "bitmap": bitmap.to_string(),
                "warnings": bitmap.warnings,
            }))
        }
        Command::Migrate { channel, from, to } => {
            let locator = channel.locator(config)?;
            let migrator = Migrator::new(store, config.migration_concurrency(), config.catchup_delay());
            let report = migrator
                .move_segments(&locator, &from, &to, log_progress("migrate"), cancel)
                .await
                .context("Migration aborted")?;
            print_json(&report)
        }
        Command::Download {
            channel,
            window,
            output,
        } => {
            let locator = channel.locator(config)?;
            let scratch = Arc::new(ScratchDir::new(&config.download.scratch_dir, config.scratch_ttl()));
            let downloader = Downloader::new(
                query,
                scratch,
                std::time::Duration::from_secs(config.download.max_window_secs),
            );

            let mut file = tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("Failed to create {}", output.display()))?;
            let outcome = downloader
                .download_window(&locator, window.parse(zone)?, &mut file, log_progress("download"), cancel)
                .await;

            match outcome {
                Ok(outcome) => {
                    if let DownloadOutcome::Merged { segments, summary, .. } = &outcome {
                        info!(segments, fragments = summary.fragments, output = %output.display(), "Merged fMP4 download");
                    }
                    print_json(&outcome)
                }
                Err(e) => {
                    drop(file);
                    if let Err(remove) = tokio::fs::remove_file(&output).await {
                        warn!(path = %output.display(), error = %remove, "Failed to remove partial download");
                    }
                    Err(e).context("Download failed")
                }
            }
        }
        Command::Import { channel, files } => {
            let locator = channel.locator(config)?;
            let mut keys = Vec::with_capacity(files.len());
            for path in files {
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .with_context(|| format!("{} has no usable file name", path.display()))?;
                let name = SegmentName::parse(file_name, zone)?;
                let body = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                let key = import_segment(store.as_ref(), &locator, name, Bytes::from(body), zone).await?;
                info!(file = %path.display(), key = %key, "Imported segment");
                keys.push(key);
            }
            print_json(&keys)
        }
        Command::Sweep { watch } => {
            let scratch = Arc::new(ScratchDir::new(&config.download.scratch_dir, config.scratch_ttl()));
            if watch {
                let handle = scratch.spawn_sweeper(config.sweep_interval(), cancel.clone());
                handle.await.context("Sweeper task failed")?;
                Ok(())
            } else {
                let report = scratch.sweep().await.context("Sweep failed")?;
                print_json(&report)
            }
        }
    }
}

impl ChannelArgs {
    fn locator(&self, config: &Config) -> Result<RecordingLocator> {
        let root = self.root.as_deref().unwrap_or(&config.archive.root);
        Ok(RecordingLocator::new(root, &self.device, &self.channel)?)
    }
}

impl WindowArgs {
    fn parse(&self, zone: ArchiveZone) -> Result<TimeWindow> {
        let start = parse_time(&self.start, zone).context("Invalid --start")?;
        let end = parse_time(&self.end, zone).context("Invalid --end")?;
        Ok(TimeWindow::new(start, end))
    }
}

/// Epoch milliseconds from epoch-ms digits, `yyyyMMddHHmmss` in `zone`, or RFC 3339.
fn parse_time(value: &str, zone: ArchiveZone) -> Result<i64> {
    let value = value.trim();
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        if value.len() == 14 {
            let naive = NaiveDateTime::parse_from_str(value, "%Y%m%d%H%M%S")
                .with_context(|| format!("'{value}' is not a valid yyyyMMddHHmmss time"))?;
            let Some(at) = zone.to_epoch_ms(&naive) else {
                bail!("'{value}' does not exist in the archive zone ({zone})");
            };
            return Ok(at);
        }
        return value
            .parse::<i64>()
            .with_context(|| format!("'{value}' is out of range"));
    }
    let at = DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("'{value}' is neither epoch ms, yyyyMMddHHmmss nor RFC 3339"))?;
    Ok(at.timestamp_millis())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Progress callback that logs each event.
fn log_progress(operation: &'static str) -> ProgressFn {
    Arc::new(move |event: Progress| match &event.error {
        Some(message) => error!(
            operation,
            total = event.total,
            current = event.current,
            id = %event.id,
            error = %message,
            "Item failed"
        ),
        None => info!(
            operation,
            total = event.total,
            current = event.current,
            id = %event.id,
            "Progress"
        ),
    })
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    // stdout carries command output
    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_writer(std::io::stderr))
            .init(),
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, cancelling");
        }
        _ = terminate => {
            info!("Received SIGTERM signal, cancelling");
        }
    }
}
