//! CLI and config handling.

use crate::sync::scheduler::{SchedulerConfig, MAX_REQUESTS_PER_SECOND};
use clap::{ArgAction, Args};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BLOCKS_QUEUE_MAX: usize = 32;
pub const DEFAULT_IMPORT_SLACK: u64 = 40;
pub const DEFAULT_IMPORTED_CACHE_SIZE: usize = 4096;
pub const DEFAULT_PROPAGATION_CACHE_SIZE: usize = 1024;
pub const DEFAULT_HEADER_REQUEST_INTERVAL_MS: u64 = 500;
pub const DEFAULT_STATUS_REQUEST_INTERVAL_MS: u64 = 2000;
pub const DEFAULT_STATUS_LOG_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_HEADER_EXPIRY_SECS: u64 = 60;
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

/// Sync engine configuration.
#[derive(Args, Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SyncConfig {
    /// Preferred number of batches held in memory before far batches go to
    /// the pending store.
    #[arg(long, default_value_t = DEFAULT_BLOCKS_QUEUE_MAX)]
    pub blocks_queue_max: usize,
    /// Batches starting within this many blocks of the local best may
    /// overshoot the preferred queue size.
    #[arg(long, default_value_t = DEFAULT_IMPORT_SLACK)]
    pub import_slack: u64,
    /// Capacity of the imported-hash recency cache.
    #[arg(long, default_value_t = DEFAULT_IMPORTED_CACHE_SIZE)]
    pub imported_cache_size: usize,
    /// Capacity of the propagated-block recency cache.
    #[arg(long, default_value_t = DEFAULT_PROPAGATION_CACHE_SIZE)]
    pub propagation_cache_size: usize,
    /// Interval between header scheduling passes.
    #[arg(long, default_value_t = DEFAULT_HEADER_REQUEST_INTERVAL_MS)]
    pub header_request_interval_ms: u64,
    /// Interval between status requests to every peer.
    #[arg(long, default_value_t = DEFAULT_STATUS_REQUEST_INTERVAL_MS)]
    pub status_request_interval_ms: u64,
    /// Interval between status log lines when `--show-status` is set.
    #[arg(long, default_value_t = DEFAULT_STATUS_LOG_INTERVAL_MS)]
    pub status_log_interval_ms: u64,
    /// Header batches waiting for bodies longer than this are dropped.
    #[arg(long, default_value_t = DEFAULT_HEADER_EXPIRY_SECS)]
    pub header_expiry_secs: u64,
    /// Upper bound on how long shutdown waits for each task.
    #[arg(long, default_value_t = DEFAULT_SHUTDOWN_TIMEOUT_MS)]
    pub shutdown_timeout_ms: u64,
    /// Header requests allowed per peer in any one-second window.
    #[arg(long, default_value_t = MAX_REQUESTS_PER_SECOND)]
    pub max_requests_per_second: usize,
    /// Reconstruct state from a pivot block instead of replaying history.
    #[arg(long, default_value_t = false)]
    pub fast_sync: bool,
    /// Never forward blocks to other peers.
    #[arg(long, default_value_t = false)]
    pub sync_only_node: bool,
    /// Periodically log sync progress.
    #[arg(long, default_value_t = false)]
    pub show_status: bool,
    /// Directory for the on-disk pending block log. In memory when unset.
    #[arg(long)]
    pub pending_dir: Option<PathBuf>,
    /// Seed for peer selection. Random when unset.
    #[arg(long)]
    pub seed: Option<u64>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            blocks_queue_max: DEFAULT_BLOCKS_QUEUE_MAX,
            import_slack: DEFAULT_IMPORT_SLACK,
            imported_cache_size: DEFAULT_IMPORTED_CACHE_SIZE,
            propagation_cache_size: DEFAULT_PROPAGATION_CACHE_SIZE,
            header_request_interval_ms: DEFAULT_HEADER_REQUEST_INTERVAL_MS,
            status_request_interval_ms: DEFAULT_STATUS_REQUEST_INTERVAL_MS,
            status_log_interval_ms: DEFAULT_STATUS_LOG_INTERVAL_MS,
            header_expiry_secs: DEFAULT_HEADER_EXPIRY_SECS,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            max_requests_per_second: MAX_REQUESTS_PER_SECOND,
            fast_sync: false,
            sync_only_node: false,
            show_status: false,
            pending_dir: None,
            seed: None,
        }
    }
}

impl SyncConfig {
    pub fn header_request_interval(&self) -> Duration {
        Duration::from_millis(self.header_request_interval_ms.max(1))
    }

    pub fn status_request_interval(&self) -> Duration {
        Duration::from_millis(self.status_request_interval_ms.max(1))
    }

    pub fn status_log_interval(&self) -> Duration {
        Duration::from_millis(self.status_log_interval_ms.max(1))
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn scheduler_config(&self, seed: u64) -> SchedulerConfig {
        SchedulerConfig {
            max_requests_per_second: self.max_requests_per_second.max(1),
            header_expiry: Duration::from_secs(self.header_expiry_secs),
            seed,
        }
    }
}

/// Logging flags.
#[derive(Args, Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbosity: u8,
    /// Emit logs as JSON lines.
    #[arg(long, default_value_t = false)]
    pub log_json: bool,
}
