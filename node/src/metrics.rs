//! Progress arithmetic shared by the stats collector and status snapshots.

use std::time::Duration;

/// Blocks between the local best and the best height any peer reported.
/// `None` until some peer has reported a height.
pub fn lag_behind(network_best: u64, local_best: u64) -> Option<u64> {
    (network_best > 0).then(|| network_best.saturating_sub(local_best))
}

/// Average blocks imported per second since `start_block`.
pub fn import_rate(start_block: u64, best_block: u64, elapsed: Duration) -> Option<f64> {
    let secs = elapsed.as_secs_f64();
    (secs > 0.0).then(|| best_block.saturating_sub(start_block) as f64 / secs)
}

/// Time left to close `lag` at `blocks_per_sec`.
pub fn eta(lag: Option<u64>, blocks_per_sec: Option<f64>) -> Option<Duration> {
    match (lag, blocks_per_sec) {
        (Some(0), _) => Some(Duration::ZERO),
        (Some(lag), Some(rate)) if rate > 0.0 => Some(Duration::from_secs_f64(lag as f64 / rate)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lag_unknown_until_a_peer_reports() {
        assert_eq!(lag_behind(0, 5), None);
        assert_eq!(lag_behind(100, 40), Some(60));
        assert_eq!(lag_behind(40, 100), Some(0));
    }

    #[test]
    fn import_rate_counts_from_start_block() {
        assert_eq!(import_rate(10, 30, Duration::ZERO), None);
        let rate = import_rate(10, 30, Duration::from_secs(4)).expect("rate");
        assert!((rate - 5.0).abs() < 1e-6);
        assert_eq!(import_rate(30, 10, Duration::from_secs(1)), Some(0.0));
    }

    #[test]
    fn eta_needs_progress() {
        assert_eq!(eta(Some(0), None), Some(Duration::ZERO));
        assert_eq!(eta(Some(50), Some(0.0)), None);
        assert_eq!(eta(None, Some(3.0)), None);
        assert_eq!(eta(Some(50), Some(10.0)), Some(Duration::from_secs(5)));
    }
}
