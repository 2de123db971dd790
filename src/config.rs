//! Configuration Module
//!
//! Handles configuration loading from command-line arguments, including
//! human-readable cache size parsing and range validation of numeric options.

use crate::{FsError, Result};
use clap::{Arg, Command};
use std::path::PathBuf;

/// Default cache capacity: 16 GiB
pub const DEFAULT_CACHE_SIZE: u64 = 16 * 1024 * 1024 * 1024;
/// Default number of fetcher workers
pub const DEFAULT_WORKER_COUNT: usize = 8;
/// Default prefetch lookahead
pub const DEFAULT_LOOKAHEAD: usize = 3;
/// Default Prometheus metrics port
pub const DEFAULT_METRICS_PORT: u16 = 9090;

/// Runtime configuration assembled from the command line
#[derive(Debug, Clone)]
pub struct Config {
    /// Mount point for the filesystem
    pub mount_point: PathBuf,
    /// S3 bucket name
    pub bucket: String,
    /// AWS region
    pub region: String,
    /// Optional S3 key prefix (no trailing slash)
    pub s3_prefix: String,
    /// Cache capacity in bytes
    pub cache_size: u64,
    /// Number of fetcher workers (1-128)
    pub workers: usize,
    /// Prefetch lookahead count (1-256)
    pub lookahead: usize,
    /// Optional manifest file listing keys in read order
    pub manifest: Option<PathBuf>,
    /// Prometheus metrics port (1024-65535)
    pub metrics_port: u16,
}

impl Config {
    /// Parse configuration from process arguments.
    pub fn load() -> Result<Self> {
        Self::from_args(std::env::args())
    }

    /// Parse configuration from an explicit argument iterator.
    pub fn from_args<I, T>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let matches = Self::command()
            .try_get_matches_from(args)
            .map_err(|e| FsError::ConfigError(e.to_string()))?;

        let config = Config {
            mount_point: PathBuf::from(
                matches
                    .get_one::<String>("mount")
                    .expect("--mount is required by clap"),
            ),
            bucket: matches
                .get_one::<String>("bucket")
                .expect("--bucket is required by clap")
                .clone(),
            region: matches
                .get_one::<String>("region")
                .expect("--region is required by clap")
                .clone(),
            s3_prefix: matches
                .get_one::<String>("s3-prefix")
                .cloned()
                .unwrap_or_default()
                .trim_end_matches('/')
                .to_string(),
            cache_size: match matches.get_one::<String>("cache-size") {
                Some(s) => parse_size(s)?,
                None => DEFAULT_CACHE_SIZE,
            },
            workers: match matches.get_one::<String>("workers") {
                Some(s) => s
                    .parse()
                    .map_err(|_| FsError::ConfigError(format!("invalid --workers value: {}", s)))?,
                None => DEFAULT_WORKER_COUNT,
            },
            lookahead: match matches.get_one::<String>("lookahead") {
                Some(s) => s.parse().map_err(|_| {
                    FsError::ConfigError(format!("invalid --lookahead value: {}", s))
                })?,
                None => DEFAULT_LOOKAHEAD,
            },
            manifest: matches.get_one::<String>("manifest").map(PathBuf::from),
            metrics_port: match matches.get_one::<String>("metrics-port") {
                Some(s) => s.parse().map_err(|_| {
                    FsError::ConfigError(format!("invalid --metrics-port value: {}", s))
                })?,
                None => DEFAULT_METRICS_PORT,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn command() -> Command {
        Command::new("shardfs")
            .about("Mount a read-only S3 prefix as a local filesystem with predictive prefetch")
            .arg(
                Arg::new("mount")
                    .long("mount")
                    .value_name("PATH")
                    .required(true)
                    .help("Mount point for the filesystem"),
            )
            .arg(
                Arg::new("bucket")
                    .long("bucket")
                    .value_name("NAME")
                    .required(true)
                    .help("S3 bucket name"),
            )
            .arg(
                Arg::new("region")
                    .long("region")
                    .value_name("REGION")
                    .required(true)
                    .help("AWS region (e.g., us-west-2)"),
            )
            .arg(
                Arg::new("s3-prefix")
                    .long("s3-prefix")
                    .value_name("PREFIX")
                    .help("S3 key prefix (default: empty)"),
            )
            .arg(
                Arg::new("cache-size")
                    .long("cache-size")
                    .value_name("SIZE")
                    .help("Cache capacity, with K/M/G suffix (default: 16G)"),
            )
            .arg(
                Arg::new("workers")
                    .long("workers")
                    .value_name("COUNT")
                    .help("Number of fetcher workers, 1-128 (default: 8)"),
            )
            .arg(
                Arg::new("lookahead")
                    .long("lookahead")
                    .value_name("COUNT")
                    .help("Prefetch lookahead count, 1-256 (default: 3)"),
            )
            .arg(
                Arg::new("manifest")
                    .long("manifest")
                    .value_name("FILE")
                    .help("File listing S3 keys in expected read order"),
            )
            .arg(
                Arg::new("metrics-port")
                    .long("metrics-port")
                    .value_name("PORT")
                    .help("Prometheus metrics port, 1024-65535 (default: 9090)"),
            )
    }

    /// Validate option ranges. Called by the parsers; public for tests.
    pub fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            return Err(FsError::ConfigError("bucket must not be empty".to_string()));
        }
        if self.region.is_empty() {
            return Err(FsError::ConfigError("region must not be empty".to_string()));
        }
        if self.cache_size < 1024 * 1024 {
            return Err(FsError::ConfigError(
                "cache size must be at least 1M".to_string(),
            ));
        }
        if !(1..=128).contains(&self.workers) {
            return Err(FsError::ConfigError(
                "workers must be between 1 and 128".to_string(),
            ));
        }
        if !(1..=256).contains(&self.lookahead) {
            return Err(FsError::ConfigError(
                "lookahead must be between 1 and 256".to_string(),
            ));
        }
        if self.metrics_port < 1024 {
            return Err(FsError::ConfigError(
                "metrics port must be between 1024 and 65535".to_string(),
            ));
        }
        Ok(())
    }

    /// Full S3 key for a filesystem-relative key, applying the prefix.
    pub fn full_key(&self, key: &str) -> String {
        if self.s3_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.s3_prefix, key)
        }
    }
}

/// Parse a human-readable size string such as "16G", "512M", or "4096".
///
/// Bare numbers are interpreted as bytes. Suffixes are case-insensitive.
pub fn parse_size(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(FsError::ConfigError("empty size string".to_string()));
    }

    let (num, multiplier) = match s.chars().last() {
        Some('K') | Some('k') => (&s[..s.len() - 1], 1024u64),
        Some('M') | Some('m') => (&s[..s.len() - 1], 1024 * 1024),
        Some('G') | Some('g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        _ => (s, 1),
    };

    let value: u64 = num
        .parse()
        .map_err(|_| FsError::ConfigError(format!("invalid size: {}", s)))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| FsError::ConfigError(format!("size overflows: {}", s)))
}
