//! Server configuration
//!
//! All configuration comes from environment variables with sensible
//! defaults, read once at startup into an explicitly passed-down
//! [`Config`]; no ambient globals.
//!
//! - `LOGHOUSE_ADDR`: bind address (default `0.0.0.0:8080`)
//! - `LOGHOUSE_URL`: base URL used in response URIs (default
//!   `http://localhost:8080`)
//! - `LOGHOUSE_DB`: SQLite database path (default `./data/loghouse.db`)
//! - `LOGHOUSE_BUCKET`: S3 bucket for the object-store tier (unset
//!   disables the tier unless local storage is selected)
//! - `USE_LOCAL_STORAGE` / `LOCAL_STORAGE_PATH`: back the object-store
//!   tier with a local directory instead of S3 (development)
//! - `LOGHOUSE_MAX_REQUEST_SIZE`: request body limit in bytes
//! - `LOGHOUSE_RETENTION_DAYS`, `LOGHOUSE_CLEANUP_INTERVAL_SECS`,
//!   `LOGHOUSE_CLEANUP_WORKERS`, `LOGHOUSE_CLEANUP_BATCH`: retention
//!   sweep tuning

use std::time::Duration;

/// Maximum serialized size of one stored chunk; also the bound a single
/// log line may never exceed.
pub const MAX_LOG_BYTES: usize = 4 * 1024 * 1024;

/// Default bound on a whole append request body.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 32 * 1024 * 1024;

const DEFAULT_RETENTION_DAYS: u64 = 30;
const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 600;
const DEFAULT_CLEANUP_WORKERS: usize = 4;
const DEFAULT_CLEANUP_BATCH: usize = 1000;

/// Retries per delete job before it is reported as a permanent failure.
pub const CLEANUP_JOB_RETRIES: usize = 3;

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: String,
    pub url: String,
    pub db_path: String,
    pub bucket: Option<String>,
    pub use_local_storage: bool,
    pub local_storage_path: String,
    pub max_request_size: usize,
    pub retention: Duration,
    pub cleanup_interval: Duration,
    pub cleanup_workers: usize,
    pub cleanup_batch_size: usize,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            addr: env_or("LOGHOUSE_ADDR", "0.0.0.0:8080"),
            url: env_or("LOGHOUSE_URL", "http://localhost:8080"),
            db_path: env_or("LOGHOUSE_DB", "./data/loghouse.db"),
            bucket: std::env::var("LOGHOUSE_BUCKET").ok().filter(|s| !s.is_empty()),
            use_local_storage: std::env::var("USE_LOCAL_STORAGE").is_ok(),
            local_storage_path: env_or("LOCAL_STORAGE_PATH", "./data/storage"),
            max_request_size: env_parse("LOGHOUSE_MAX_REQUEST_SIZE", DEFAULT_MAX_REQUEST_SIZE),
            retention: Duration::from_secs(
                env_parse("LOGHOUSE_RETENTION_DAYS", DEFAULT_RETENTION_DAYS) * 24 * 60 * 60,
            ),
            cleanup_interval: Duration::from_secs(env_parse(
                "LOGHOUSE_CLEANUP_INTERVAL_SECS",
                DEFAULT_CLEANUP_INTERVAL_SECS,
            )),
            cleanup_workers: env_parse("LOGHOUSE_CLEANUP_WORKERS", DEFAULT_CLEANUP_WORKERS),
            cleanup_batch_size: env_parse("LOGHOUSE_CLEANUP_BATCH", DEFAULT_CLEANUP_BATCH),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8080".to_string(),
            url: "http://localhost:8080".to_string(),
            db_path: "./data/loghouse.db".to_string(),
            bucket: None,
            use_local_storage: false,
            local_storage_path: "./data/storage".to_string(),
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
            retention: Duration::from_secs(DEFAULT_RETENTION_DAYS * 24 * 60 * 60),
            cleanup_interval: Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS),
            cleanup_workers: DEFAULT_CLEANUP_WORKERS,
            cleanup_batch_size: DEFAULT_CLEANUP_BATCH,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
