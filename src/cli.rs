//! Command Line Interface (CLI) arguments.

use byte_unit::Byte;
use clap::{Parser, ValueEnum};

/// Backend used to persist upload status records.
#[derive(Clone, Copy, Debug, PartialEq, ValueEnum)]
pub enum StatusBackend {
    /// Amazon DynamoDB table
    Dynamodb,
    /// Embedded sled database on local disk
    Sled,
}

/// det-ingest command line interface
#[derive(Clone, Debug, Parser)]
pub struct CommandLineArgs {
    /// The IP address on which the server should listen
    #[arg(long, default_value = "0.0.0.0", env = "DET_INGEST_HOST")]
    pub host: String,
    /// The port to which the server should bind
    #[arg(long, default_value_t = 8080, env = "DET_INGEST_PORT")]
    pub port: u16,
    /// Flag indicating whether HTTPS should be used
    #[arg(long, default_value_t = false, env = "DET_INGEST_HTTPS")]
    pub https: bool,
    /// Path to the certificate file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/det-ingest/certs/cert.pem",
        env = "DET_INGEST_CERT_FILE"
    )]
    pub cert_file: String,
    /// Path to the key file to be used for HTTPS encryption
    #[arg(
        long,
        default_value = "~/.config/det-ingest/certs/key.pem",
        env = "DET_INGEST_KEY_FILE"
    )]
    pub key_file: String,
    /// Maximum time in seconds to wait for operations to complete upon receiving `ctrl+c` signal.
    #[arg(long, default_value_t = 60, env = "DET_INGEST_SHUTDOWN_TIMEOUT")]
    pub graceful_shutdown_timeout: u64,
    /// Whether to enable sending traces to Jaeger.
    #[arg(long, default_value_t = false, env = "DET_INGEST_ENABLE_JAEGER")]
    pub enable_jaeger: bool,
    /// Whether to use Rayon for execution of CPU-bound tasks.
    #[arg(long, default_value_t = false, env = "DET_INGEST_USE_RAYON")]
    pub use_rayon: bool,
    /// Bucket holding templates and processed outputs
    #[arg(long, default_value = "benchmark-vv-data", env = "DET_INGEST_DATA_BUCKET")]
    pub data_bucket: String,
    /// Optional S3-compatible endpoint URL, e.g. for MinIO. Defaults to AWS.
    #[arg(long, env = "DET_INGEST_S3_ENDPOINT")]
    pub s3_endpoint: Option<url::Url>,
    /// Backend used for the upload status table
    #[arg(long, value_enum, default_value_t = StatusBackend::Dynamodb, env = "DET_INGEST_STATUS_BACKEND")]
    pub status_backend: StatusBackend,
    /// Name of the DynamoDB upload status table
    #[arg(long, default_value = "DETFileProcessingStatus", env = "TABLE_NAME")]
    pub status_table: String,
    /// Path of the sled database used when the status backend is `sled`
    #[arg(
        long,
        default_value = "~/.local/share/det-ingest/status",
        env = "DET_INGEST_STATUS_PATH"
    )]
    pub status_path: String,
    /// Number of days after which status records expire
    #[arg(long, default_value_t = 30, env = "DET_INGEST_STATUS_TTL_DAYS")]
    pub status_ttl_days: u64,
    /// Number of nearest neighbours used when regridding
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(1..), env = "DET_INGEST_REGRID_NEIGHBOURS")]
    pub regrid_neighbours: u32,
    /// Inverse distance weighting power used when regridding. 0 gives uniform weights.
    #[arg(long, default_value_t = 1.0, value_parser = parse_regrid_power, env = "DET_INGEST_REGRID_POWER")]
    pub regrid_power: f64,
    /// Maximum time in seconds allowed for processing a single upload
    #[arg(long, default_value_t = 600, env = "DET_INGEST_PROCESSING_TIMEOUT")]
    pub processing_timeout: u64,
    /// Maximum number of attempts at processing an upload after transient failures
    #[arg(long, default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..), env = "DET_INGEST_MAX_ATTEMPTS")]
    pub max_attempts: u32,
    /// Delay in seconds between processing attempts
    #[arg(long, default_value_t = 5, env = "DET_INGEST_RETRY_INTERVAL")]
    pub retry_interval: u64,
    /// Lifespan in seconds of memoised templates and dataset listings. 0 disables caching.
    #[arg(long, default_value_t = 300, env = "DET_INGEST_TEMPLATE_CACHE_TTL")]
    pub template_cache_ttl: u64,
    /// Maximum size of an uploaded archive, e.g. "512MiB"
    #[arg(long, default_value = "1GiB", value_parser = parse_byte_size, env = "DET_INGEST_MAX_ARCHIVE_SIZE")]
    pub max_archive_size: u64,
    /// Maximum uncompressed size of a single archive entry, e.g. "256MiB"
    #[arg(long, default_value = "256MiB", value_parser = parse_byte_size, env = "DET_INGEST_MAX_ENTRY_SIZE")]
    pub max_entry_size: u64,
    /// Maximum number of concurrent dataset fetches per query
    #[arg(long, default_value_t = 8, env = "DET_INGEST_FETCH_CONCURRENCY")]
    pub fetch_concurrency: usize,
    /// Maximum number of concurrent S3 requests
    #[arg(long, env = "DET_INGEST_S3_CONNECTION_LIMIT")]
    pub s3_connection_limit: Option<usize>,
    /// Maximum number of concurrent CPU-bound tasks. Defaults to the number of CPUs minus one.
    #[arg(long, env = "DET_INGEST_THREAD_LIMIT")]
    pub thread_limit: Option<usize>,
    /// Value of the Access-Control-Allow-Origin header on status responses
    #[arg(long, default_value = "*", env = "DET_INGEST_CORS_ALLOW_ORIGIN")]
    pub cors_allow_origin: String,
}

/// Parse a human readable size such as "512MiB" into a number of bytes.
fn parse_byte_size(size: &str) -> Result<u64, String> {
    Byte::parse_str(size, /* ignore case */ true)
        .map(|bytes| bytes.as_u64())
        .map_err(|err| err.to_string())
}

/// Parse an inverse distance weighting power, which must be finite and non-negative.
fn parse_regrid_power(power: &str) -> Result<f64, String> {
    let power: f64 = power.parse().map_err(|err| format!("{err}"))?;
    if power.is_finite() && power >= 0.0 {
        Ok(power)
    } else {
        Err(format!("{power} is not a finite, non-negative number"))
    }
}

/// Returns parsed command line arguments.
pub fn parse() -> CommandLineArgs {
    CommandLineArgs::parse()
}
