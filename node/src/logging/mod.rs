//! Tracing subscriber setup.

use crate::cli::LogConfig;
use eyre::{eyre, Result};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Filter directive for a `-v` count when `RUST_LOG` is unset.
pub fn default_filter(verbosity: u8) -> String {
    let (global, local) = match verbosity {
        0 => ("warn", "info"),
        1 => ("warn", "debug"),
        _ => ("warn", "trace"),
    };
    format!("{global},block_sync={local},sync_sim={local}")
}

/// Installs the global subscriber: plain text to stdout, or JSON lines with
/// `log_json`.
pub fn init_tracing(config: &LogConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config.verbosity)));
    let layer = if config.log_json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(false)
            .with_writer(std::io::stdout)
            .with_filter(filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stdout)
            .with_filter(filter)
            .boxed()
    };
    tracing_subscriber::registry()
        .with(layer)
        .try_init()
        .map_err(|err| eyre!("failed to install tracing subscriber: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_crate_level_only() {
        assert_eq!(default_filter(0), "warn,block_sync=info,sync_sim=info");
        assert_eq!(default_filter(1), "warn,block_sync=debug,sync_sim=debug");
        assert_eq!(default_filter(5), "warn,block_sync=trace,sync_sim=trace");
    }
}
