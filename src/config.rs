use crate::error::SyncError;
use crate::retry::RetryConfig;
use crate::similarity::{SimilarityEngine, DEFAULT_THRESHOLD};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Run configuration, read from a TOML file. Every field is optional.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct Config {
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f64,
    #[serde(default)]
    pub plan_mode: bool,

    // Retry policy
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_true")]
    pub retry_jitter: bool,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,

    /// In-flight calls per provider.
    #[serde(default = "default_concurrency_limit")]
    pub concurrency_limit: usize,

    // Web fallback
    #[serde(default = "default_web_search_url")]
    pub web_search_url: String,
    #[serde(default = "default_web_search_throttle_ms")]
    pub web_search_throttle_ms: u64,
    #[serde(default = "default_web_search_max_results")]
    pub web_search_max_results: usize,

    /// Override provider endpoints (tests, proxies).
    #[serde(default)]
    pub spotify_api_base: Option<String>,
    #[serde(default)]
    pub youtube_api_base: Option<String>,

    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    // path to the credential database
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
}

fn default_threshold() -> f64 { DEFAULT_THRESHOLD }
fn default_max_retry_attempts() -> u32 { 5 }
fn default_retry_base_delay_ms() -> u64 { 500 }
fn default_retry_max_delay_ms() -> u64 { 30_000 }
fn default_true() -> bool { true }
fn default_call_timeout_secs() -> u64 { 20 }
fn default_concurrency_limit() -> usize { 4 }
fn default_web_search_url() -> String { crate::fallback::DEFAULT_SEARCH_URL.into() }
fn default_web_search_throttle_ms() -> u64 { 200 }
fn default_web_search_max_results() -> usize { 8 }
fn default_log_dir() -> PathBuf { "logs".into() }
fn default_db_path() -> PathBuf { "playlist-reconcile.db".into() }

impl Default for Config {
    fn default() -> Self {
        Self {
            similarity_threshold: default_threshold(),
            plan_mode: false,
            max_retry_attempts: default_max_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter: true,
            call_timeout_secs: default_call_timeout_secs(),
            concurrency_limit: default_concurrency_limit(),
            web_search_url: default_web_search_url(),
            web_search_throttle_ms: default_web_search_throttle_ms(),
            web_search_max_results: default_web_search_max_results(),
            spotify_api_base: None,
            youtube_api_base: None,
            log_dir: default_log_dir(),
            db_path: default_db_path(),
        }
    }
}

impl Config {
    pub fn from_path(path: &std::path::Path) -> anyhow::Result<Self> {
        let s = std::fs::read_to_string(path)?;
        let cfg: Config = toml::from_str(&s)?;
        Ok(cfg)
    }

    pub fn validate(&self) -> crate::error::Result<()> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(SyncError::InvalidConfig(format!(
                "similarity_threshold must be within [0, 1], got {}",
                self.similarity_threshold
            )));
        }
        if self.max_retry_attempts == 0 {
            return Err(SyncError::InvalidConfig("max_retry_attempts must be at least 1".into()));
        }
        if self.concurrency_limit == 0 {
            return Err(SyncError::InvalidConfig("concurrency_limit must be at least 1".into()));
        }
        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new()
            .with_max_attempts(self.max_retry_attempts)
            .with_base_delay(Duration::from_millis(self.retry_base_delay_ms))
            .with_max_delay(Duration::from_millis(self.retry_max_delay_ms))
            .with_jitter(self.retry_jitter)
            .with_call_timeout(Duration::from_secs(self.call_timeout_secs))
    }

    pub fn similarity(&self) -> SimilarityEngine {
        SimilarityEngine::new(self.similarity_threshold)
    }
}
