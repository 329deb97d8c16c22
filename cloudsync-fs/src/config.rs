use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use cloudsync_sync::ConflictStrategy;
use cloudsync_types::OverlayPolicy;

/// Recognized runtime options (spec §6.4). Constructed from TOML via
/// [`Config::load`] or built directly with [`Config::default`] for tests
/// and embedders that do their own configuration layering.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache_dir: PathBuf,
    /// 0 = unbounded.
    pub cache_size_bytes: u64,
    /// 0 disables TTL eviction; only the LRU/budget eviction in
    /// `ContentCache` applies.
    pub cache_ttl_seconds: u64,
    pub cache_cleanup_interval_secs: u64,
    pub download_workers: usize,
    pub upload_workers: usize,
    pub download_queue_depth: usize,
    pub upload_queue_depth: usize,
    pub chunk_size_bytes: u64,
    pub retry_max_attempts: u32,
    pub retry_initial_ms: u64,
    pub retry_multiplier: f64,
    pub retry_max_ms: u64,
    pub retry_jitter: f64,
    pub fallback_poll_interval_secs: u64,
    pub default_overlay_policy: OverlayPolicy,
    pub conflict_strategy: ConflictStrategy,
    pub offline_mode_allow_cached_stale: bool,
    /// Names rejected by `FsOps` name validation in addition to the
    /// built-in path-separator and reserved-sequence checks (spec §4.8:
    /// "operator-configurable denylist for server-invalid names").
    pub name_denylist: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("."),
            cache_size_bytes: 0,
            cache_ttl_seconds: 0,
            cache_cleanup_interval_secs: 60,
            download_workers: 4,
            upload_workers: 4,
            download_queue_depth: 256,
            upload_queue_depth: 256,
            chunk_size_bytes: 4 * 1024 * 1024,
            retry_max_attempts: 5,
            retry_initial_ms: 200,
            retry_multiplier: 2.0,
            retry_max_ms: 10_000,
            retry_jitter: 0.2,
            fallback_poll_interval_secs: 300,
            default_overlay_policy: OverlayPolicy::RemoteWins,
            conflict_strategy: ConflictStrategy::KeepBoth,
            offline_mode_allow_cached_stale: false,
            name_denylist: vec![
                "CON".into(), "PRN".into(), "AUX".into(), "NUL".into(),
                "COM1".into(), "COM2".into(), "COM3".into(), "COM4".into(),
                "LPT1".into(), "LPT2".into(), "LPT3".into(), "LPT4".into(),
            ],
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    pub fn metadata_db_path(&self) -> PathBuf {
        self.cache_dir.join("catalog.sqlite3")
    }

    pub fn retry_config(&self) -> cloudsync_transfer::RetryConfig {
        cloudsync_transfer::RetryConfig {
            max_attempts: self.retry_max_attempts,
            initial_ms: self.retry_initial_ms,
            multiplier: self.retry_multiplier,
            max_ms: self.retry_max_ms,
            jitter: self.retry_jitter,
        }
    }

    pub fn fallback_poll_interval(&self) -> Duration {
        Duration::from_secs(self.fallback_poll_interval_secs)
    }

    pub fn cache_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache_cleanup_interval_secs)
    }
}
