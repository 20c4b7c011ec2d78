use crate::ad::AdFormat;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Maximum number of simultaneous asset fetches.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 4;

/// Fetch attempts per asset before it is reported unavailable.
pub const DEFAULT_MAX_DOWNLOAD_ATTEMPTS: u32 = 3;

/// First retry delay; doubles on every further attempt.
pub const DEFAULT_BACKOFF_BASE_MS: u64 = 250;

/// Per-request network timeout.
pub const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;

/// Maximum number of VAST wrappers followed before giving up.
pub const DEFAULT_MAX_WRAPPER_DEPTH: usize = 5;

/// Total bytes the asset cache may hold on disk (256 MB).
pub const DEFAULT_CACHE_BUDGET_BYTES: u64 = 256 * 1024 * 1024;

/// Extra delivery attempts per event and sink.
pub const DEFAULT_SINK_RETRIES: u32 = 2;

/// How waiting downloads are ordered when the queue is saturated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityPolicy {
    /// Formats shown full screen are fetched before banners
    ByFormat,
    /// Strict submission order
    Fifo,
}

/// Media file selection preferences for VAST linear creatives
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaPreference {
    /// MIME types in order of preference; unlisted types rank last
    pub mime_types: Vec<String>,

    /// Bitrate (kbps) to aim for; the closest file at or below it wins
    pub target_bitrate: Option<u32>,
}

impl Default for MediaPreference {
    fn default() -> Self {
        Self {
            mime_types: vec![
                "video/mp4".to_string(),
                "video/webm".to_string(),
                "video/3gpp".to_string(),
            ],
            target_bitrate: None,
        }
    }
}

/// Top-level configuration for the ad-session engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding cached creative files and the cache index.
    pub cache_dir: PathBuf,
    /// Byte budget of the asset cache.
    pub cache_budget_bytes: u64,
    /// Maximum number of in-flight fetches.
    pub max_concurrent_downloads: usize,
    /// Attempts per asset, first one included.
    pub max_download_attempts: u32,
    /// Base of the exponential retry backoff, in milliseconds.
    pub backoff_base_ms: u64,
    /// Network timeout for a single fetch, in seconds.
    pub fetch_timeout_secs: u64,
    /// Maximum VAST wrapper chain length.
    pub max_wrapper_depth: usize,
    /// Retries for a failed sink delivery.
    pub sink_retries: u32,
    pub priority_policy: PriorityPolicy,
    pub media: MediaPreference,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("ad-session-cache"),
            cache_budget_bytes: DEFAULT_CACHE_BUDGET_BYTES,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            max_download_attempts: DEFAULT_MAX_DOWNLOAD_ATTEMPTS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            fetch_timeout_secs: DEFAULT_FETCH_TIMEOUT_SECS,
            max_wrapper_depth: DEFAULT_MAX_WRAPPER_DEPTH,
            sink_retries: DEFAULT_SINK_RETRIES,
            priority_policy: PriorityPolicy::ByFormat,
            media: MediaPreference::default(),
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&raw)?;
        Ok(config)
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    /// Download priority for a session of the given format. Higher is fetched first.
    pub fn priority_for(&self, format: AdFormat) -> u8 {
        match self.priority_policy {
            PriorityPolicy::Fifo => 0,
            PriorityPolicy::ByFormat => match format {
                AdFormat::Interstitial => 3,
                AdFormat::Rewarded | AdFormat::Video => 2,
                AdFormat::Banner => 1,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{ "max_concurrent_downloads": 2, "priority_policy": "fifo" }"#)
                .unwrap();
        assert_eq!(config.max_concurrent_downloads, 2);
        assert_eq!(config.max_download_attempts, DEFAULT_MAX_DOWNLOAD_ATTEMPTS);
        assert_eq!(config.priority_policy, PriorityPolicy::Fifo);
        assert_eq!(config.priority_for(AdFormat::Interstitial), 0);
    }

    #[test]
    fn full_screen_formats_outrank_banners() {
        let config = EngineConfig::default();
        assert!(config.priority_for(AdFormat::Interstitial) > config.priority_for(AdFormat::Banner));
        assert!(config.priority_for(AdFormat::Rewarded) > config.priority_for(AdFormat::Banner));
    }
}
