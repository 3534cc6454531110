use crate::zone::ArchiveZone;
use chrono::FixedOffset;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the archive service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Archive layout and query configuration
    #[serde(default)]
    pub archive: ArchiveConfig,
    /// Storage migration configuration
    #[serde(default)]
    pub migration: MigrationConfig,
    /// Bulk download configuration
    #[serde(default)]
    pub download: DownloadConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
    /// Prometheus exporter port; metrics are not exported when unset
    pub metrics_port: Option<u16>,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// S3 bucket holding the recording archive
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Static access key; the default credential chain is used when unset
    pub access_key: Option<String>,
    /// Static secret key
    pub secret_key: Option<String>,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
    /// Keys requested per list call
    #[serde(default = "default_list_page_size")]
    pub list_page_size: i32,
}

/// How playlist entries are addressed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UriModeConfig {
    /// Time-limited presigned GET URLs
    #[default]
    Presigned,
    /// Raw object keys, optionally behind `raw_base_url`
    RawKey,
}

/// Archive layout and query configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveConfig {
    /// Root prefix of every recording key
    #[serde(default = "default_archive_root")]
    pub root: String,
    /// Fixed UTC offset for day partitions
    pub utc_offset_secs: Option<i32>,
    /// IANA zone for day partitions, e.g. `Europe/Berlin`; host local zone
    /// when neither this nor `utc_offset_secs` is set
    pub timezone: Option<String>,
    /// Cross-midnight lookback distance in seconds
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: u64,
    /// Gap above which playlists get a discontinuity marker
    #[serde(default = "default_discontinuity_gap_ms")]
    pub discontinuity_gap_ms: i64,
    /// Parallel day probes for month availability
    #[serde(default = "default_month_probe_concurrency")]
    pub month_probe_concurrency: usize,
    /// Playlist addressing mode
    #[serde(default)]
    pub uri_mode: UriModeConfig,
    /// Prefix for raw-key URIs
    pub raw_base_url: Option<String>,
}

/// Storage migration configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MigrationConfig {
    /// Copy/delete workers; CPU count when unset
    pub concurrency: Option<usize>,
    /// Delay before the catch-up listing pass
    #[serde(default = "default_catchup_delay_secs")]
    pub catchup_delay_secs: u64,
}

/// Bulk download configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadConfig {
    /// Scratch directory for fragment downloads and merged output
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Age after which scratch files are swept
    #[serde(default = "default_scratch_ttl_secs")]
    pub scratch_ttl_secs: u64,
    /// Interval between sweeps
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Longest window accepted for a download
    #[serde(default = "default_max_window_secs")]
    pub max_window_secs: u64,
}

// Default value functions
fn default_service_name() -> String {
    "archive-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_list_page_size() -> i32 {
    1000
}

fn default_archive_root() -> String {
    "r".to_string()
}

fn default_lookback_secs() -> u64 {
    30
}

fn default_discontinuity_gap_ms() -> i64 {
    2000
}

fn default_month_probe_concurrency() -> usize {
    31
}

fn default_catchup_delay_secs() -> u64 {
    10
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("temporary/cloud_record_download")
}

fn default_scratch_ttl_secs() -> u64 {
    8 * 60 * 60
}

fn default_sweep_interval_secs() -> u64 {
    10 * 60
}

fn default_max_window_secs() -> u64 {
    3 * 24 * 60 * 60
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            // Start with default values
            .set_default("service.name", "archive-service")?
            .set_default("service.log_level", "info")?
            // Add config file if present
            .add_source(config::File::with_name("config/archive").required(false))
            .add_source(config::File::with_name("/etc/nier/archive").required(false))
            // Override with environment variables
            // ARCHIVE__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("ARCHIVE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the loaded configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.s3.bucket.trim().is_empty() {
            return Err(ConfigValidationError::MissingField("s3.bucket".to_string()));
        }
        if self.archive.root.trim_matches('/').is_empty() {
            return Err(ConfigValidationError::MissingField("archive.root".to_string()));
        }
        if self.archive.month_probe_concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "archive.month_probe_concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.migration.concurrency == Some(0) {
            return Err(ConfigValidationError::InvalidValue {
                field: "migration.concurrency".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.download.scratch_ttl_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "download.scratch_ttl_secs".to_string(),
                message: "must be positive".to_string(),
            });
        }
        if self.archive.uri_mode == UriModeConfig::Presigned && self.s3.presigned_url_expiry_secs == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "s3.presigned_url_expiry_secs".to_string(),
                message: "must be positive in presigned mode".to_string(),
            });
        }
        if let Some(secs) = self.archive.utc_offset_secs {
            if FixedOffset::east_opt(secs).is_none() {
                return Err(ConfigValidationError::InvalidValue {
                    field: "archive.utc_offset_secs".to_string(),
                    message: format!("{secs} is out of range"),
                });
            }
            if self.archive.timezone.is_some() {
                return Err(ConfigValidationError::InvalidValue {
                    field: "archive.timezone".to_string(),
                    message: "cannot be combined with archive.utc_offset_secs".to_string(),
                });
            }
        }
        if let Some(name) = &self.archive.timezone {
            if ArchiveZone::named(name).is_none() {
                return Err(ConfigValidationError::InvalidValue {
                    field: "archive.timezone".to_string(),
                    message: format!("unknown zone '{name}'"),
                });
            }
        }
        Ok(())
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.s3.presigned_url_expiry_secs)
    }

    /// Get migration catch-up delay as Duration
    pub fn catchup_delay(&self) -> Duration {
        Duration::from_secs(self.migration.catchup_delay_secs)
    }

    /// Get migration worker count
    pub fn migration_concurrency(&self) -> usize {
        self.migration.concurrency.unwrap_or_else(num_cpus::get).max(1)
    }

    /// Get scratch TTL as Duration
    pub fn scratch_ttl(&self) -> Duration {
        Duration::from_secs(self.download.scratch_ttl_secs)
    }

    /// Get sweep interval as Duration
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.download.sweep_interval_secs)
    }

    /// Get the zone used for day partitions
    pub fn archive_zone(&self) -> ArchiveZone {
        self.archive.zone()
    }
}

impl ArchiveConfig {
    /// Zone used for day partitions and 14-digit segment names
    pub fn zone(&self) -> ArchiveZone {
        if let Some(offset) = self.utc_offset_secs.and_then(FixedOffset::east_opt) {
            return ArchiveZone::Fixed(offset);
        }
        self.timezone
            .as_deref()
            .and_then(ArchiveZone::named)
            .unwrap_or(ArchiveZone::Local)
    }

    /// Cross-midnight lookback in milliseconds
    pub fn lookback_ms(&self) -> i64 {
        (self.lookback_secs as i64).saturating_mul(1000)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            metrics_port: None,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: default_archive_root(),
            utc_offset_secs: None,
            timezone: None,
            lookback_secs: default_lookback_secs(),
            discontinuity_gap_ms: default_discontinuity_gap_ms(),
            month_probe_concurrency: default_month_probe_concurrency(),
            uri_mode: UriModeConfig::default(),
            raw_base_url: None,
        }
    }
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            catchup_delay_secs: default_catchup_delay_secs(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            scratch_ttl_secs: default_scratch_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            max_window_secs: default_max_window_secs(),
        }
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
