use std::time::Duration;

use rand::Rng;

use super::WorkerPoolConfig;

/// The delay scheduled after failed attempt `attempt` (1-indexed):
/// `min(base * multiplier^(attempt-1), max)` with uniform jitter of
/// `jitter_percent` applied on top.
pub(super) fn retry_delay(config: &WorkerPoolConfig, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let raw = config.base_backoff.as_secs_f64() * config.backoff_multiplier.powi(exponent as i32);
    let capped = raw.min(config.max_backoff.as_secs_f64());

    let jitter_span = capped * config.jitter_percent;
    let jitter = if jitter_span > 0.0 {
        rand::thread_rng().gen_range(-jitter_span..=jitter_span)
    } else {
        0.0
    };

    Duration::from_secs_f64((capped + jitter).max(0.0))
}
