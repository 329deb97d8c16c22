use std::time::Duration;

use rand::Rng;

/// Retry shaping shared by `DownloadManager` and `UploadManager` (spec
/// §4.4 step 6, §6.4 `retry_*` options): exponential backoff with jitter.
#[derive(Clone, Copy, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_ms: u64,
    pub multiplier: f64,
    pub max_ms: u64,
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_ms: 200,
            multiplier: 2.0,
            max_ms: 10_000,
            jitter: 0.2,
        }
    }
}

impl RetryConfig {
    /// Backoff delay before attempt number `attempt` (1-indexed), including
    /// +/- `jitter` fraction of randomness, capped at `max_ms`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_ms as f64 * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_ms as f64);
        let jitter_span = capped * self.jitter;
        let jittered = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        let final_ms = (capped + jittered).max(0.0);
        Duration::from_millis(final_ms as u64)
    }
}
