//! Pipeline configuration and TOML loading.
//!
//! [`PipelineConfig`] is the in-code form used to build an
//! [`ApiClient`](crate::ApiClient). [`ClientConfig`] is the on-disk form: a
//! TOML file named by `--config <path>` or `INKWELL_CONFIG`. The base URL,
//! client version and bearer token are required; every section has
//! defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use inkwell_core::ConfigError;
use inkwell_storage::{CacheConfig, EvictionStrategy, Partition, StorageOptions};
use serde::Deserialize;

use crate::batch::{BatchConfig, DEFAULT_BATCH_WINDOW, DEFAULT_MAX_BATCH_SIZE};
use crate::dedup::DEFAULT_DEDUP_GRACE;
use crate::envelope::EnvelopeMode;
use crate::metrics::DEFAULT_LOG_CAPACITY;
use crate::rate_limit::{RateLimitConfig, DEFAULT_MAX_REQUESTS, DEFAULT_WINDOW};
use crate::response_cache::{ResponseCacheConfig, DEFAULT_MAX_RESPONSES, DEFAULT_RESPONSE_TTL};
use crate::retry::{
    RetryPolicy, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
    DEFAULT_MAX_JITTER, DEFAULT_MULTIPLIER,
};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "INKWELL_CONFIG";

#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    /// Relative request paths are joined onto this.
    pub base_url: String,
    pub bearer_token: Option<String>,
    /// Sent as `X-Client-Version`.
    pub client_version: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
    pub response_cache: ResponseCacheConfig,
    pub dedup_grace: Duration,
    pub batch: BatchConfig,
    pub envelope: EnvelopeMode,
    pub log_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost/".to_string(),
            bearer_token: None,
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            response_cache: ResponseCacheConfig::default(),
            dedup_grace: DEFAULT_DEDUP_GRACE,
            batch: BatchConfig::default(),
            envelope: EnvelopeMode::default(),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl PipelineConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn with_client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimitConfig) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    pub fn with_response_cache(mut self, response_cache: ResponseCacheConfig) -> Self {
        self.response_cache = response_cache;
        self
    }

    pub fn with_dedup_grace(mut self, grace: Duration) -> Self {
        self.dedup_grace = grace;
        self
    }

    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_envelope(mut self, envelope: EnvelopeMode) -> Self {
        self.envelope = envelope;
        self
    }

    pub fn with_log_capacity(mut self, capacity: usize) -> Self {
        self.log_capacity = capacity;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "api_base_url".to_string(),
            });
        }
        if let Err(e) = reqwest::Url::parse(&self.base_url) {
            return Err(ConfigError::invalid("api_base_url", e.to_string()));
        }
        if self.client_version.trim().is_empty() {
            return Err(ConfigError::invalid("client_version", "must not be empty"));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::invalid("request_timeout_ms", "must be > 0"));
        }
        if self.log_capacity == 0 {
            return Err(ConfigError::invalid("log_capacity", "must be > 0"));
        }
        self.retry.validate()?;
        self.rate_limit.validate()?;
        self.response_cache.validate()?;
        self.batch.validate()?;
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Missing configuration file path (use --config or INKWELL_CONFIG)")]
    MissingConfigPath,
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClientConfig {
    pub api_base_url: String,
    pub client_version: String,
    pub auth: AuthSection,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub envelope: EnvelopeMode,
    #[serde(default = "default_log_capacity")]
    pub log_capacity: usize,
    #[serde(default = "default_dedup_grace_ms")]
    pub dedup_grace_ms: u64,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub rate_limit: RateLimitSection,
    #[serde(default)]
    pub request_cache: RequestCacheSection,
    #[serde(default)]
    pub batch: BatchSection,
    #[serde(default)]
    pub cache: CacheSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthSection {
    pub bearer_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub max_jitter_ms: u64,
    pub retry_on: Vec<String>,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay_ms: millis(DEFAULT_INITIAL_DELAY),
            max_delay_ms: millis(DEFAULT_MAX_DELAY),
            multiplier: DEFAULT_MULTIPLIER,
            max_jitter_ms: millis(DEFAULT_MAX_JITTER),
            retry_on: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitSection {
    pub max_requests: u32,
    pub window_ms: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            max_requests: DEFAULT_MAX_REQUESTS,
            window_ms: millis(DEFAULT_WINDOW),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RequestCacheSection {
    pub ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for RequestCacheSection {
    fn default() -> Self {
        Self {
            ttl_ms: millis(DEFAULT_RESPONSE_TTL),
            max_entries: DEFAULT_MAX_RESPONSES,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchSection {
    pub window_ms: u64,
    pub max_batch_size: usize,
}

impl Default for BatchSection {
    fn default() -> Self {
        Self {
            window_ms: millis(DEFAULT_BATCH_WINDOW),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    pub strategy: EvictionStrategy,
    pub max_cache_size: u64,
    pub version: String,
    /// `global`, `user:<id>`, `session:<id>` or `tenant:<id>`.
    pub partition: String,
    pub persistence: bool,
    /// Directory for the durable store. Unset means memory-only.
    pub persistence_path: Option<PathBuf>,
    pub cross_tab: bool,
    pub stale_while_revalidate: bool,
    pub default_ttl_ms: u64,
    pub cleanup_interval_ms: u64,
    pub channel_name: String,
}

impl Default for CacheSection {
    fn default() -> Self {
        let cache = CacheConfig::default();
        Self {
            strategy: cache.strategy,
            max_cache_size: cache.max_cache_size,
            version: cache.version,
            partition: cache.partition.to_string(),
            persistence: cache.persistence,
            persistence_path: None,
            cross_tab: cache.cross_tab,
            stale_while_revalidate: cache.stale_while_revalidate,
            default_ttl_ms: millis(cache.default_ttl),
            cleanup_interval_ms: millis(cache.cleanup_interval),
            channel_name: cache.channel_name,
        }
    }
}

fn millis(duration: Duration) -> u64 {
    duration.as_millis() as u64
}

fn default_request_timeout_ms() -> u64 {
    millis(DEFAULT_REQUEST_TIMEOUT)
}

fn default_log_capacity() -> usize {
    DEFAULT_LOG_CAPACITY
}

fn default_dedup_grace_ms() -> u64 {
    millis(DEFAULT_DEDUP_GRACE)
}

impl ClientConfig {
    pub fn load() -> Result<Self, ConfigLoadError> {
        let path = config_path_from_args().or_else(config_path_from_env);
        let path = path.ok_or(ConfigLoadError::MissingConfigPath)?;
        let config = Self::from_path(&path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self, ConfigLoadError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigLoadError> {
        let config: ClientConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.auth.bearer_token.as_deref() {
            Some(token) if !token.trim().is_empty() => {}
            _ => {
                return Err(ConfigError::MissingRequired {
                    field: "auth.bearer_token".to_string(),
                })
            }
        }
        if self.cache.persistence && self.cache.persistence_path.is_none() {
            tracing::warn!("cache.persistence is on but no persistence_path is set, cache is memory-only");
        }
        self.pipeline_config().validate()?;
        self.cache_config()?.validate()?;
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        let mut retry = RetryPolicy::default()
            .with_max_attempts(self.retry.max_attempts)
            .with_delays(
                Duration::from_millis(self.retry.initial_delay_ms),
                Duration::from_millis(self.retry.max_delay_ms),
            )
            .with_multiplier(self.retry.multiplier)
            .with_jitter(Duration::from_millis(self.retry.max_jitter_ms));
        retry.retry_on = self.retry.retry_on.clone();

        PipelineConfig {
            base_url: self.api_base_url.clone(),
            bearer_token: self.auth.bearer_token.clone(),
            client_version: self.client_version.clone(),
            timeout: Duration::from_millis(self.request_timeout_ms),
            retry,
            rate_limit: RateLimitConfig::new(
                self.rate_limit.max_requests,
                Duration::from_millis(self.rate_limit.window_ms),
            ),
            response_cache: ResponseCacheConfig {
                ttl: Duration::from_millis(self.request_cache.ttl_ms),
                max_entries: self.request_cache.max_entries,
            },
            dedup_grace: Duration::from_millis(self.dedup_grace_ms),
            batch: BatchConfig {
                window: Duration::from_millis(self.batch.window_ms),
                max_batch_size: self.batch.max_batch_size,
            },
            envelope: self.envelope,
            log_capacity: self.log_capacity,
        }
    }

    pub fn cache_config(&self) -> Result<CacheConfig, ConfigError> {
        let partition: Partition = self.cache.partition.parse()?;
        Ok(CacheConfig::new()
            .with_strategy(self.cache.strategy)
            .with_max_size(self.cache.max_cache_size)
            .with_version(self.cache.version.clone())
            .with_partition(partition)
            .with_persistence(self.cache.persistence)
            .with_cross_tab(self.cache.cross_tab)
            .with_stale_while_revalidate(self.cache.stale_while_revalidate)
            .with_default_ttl(Duration::from_millis(self.cache.default_ttl_ms))
            .with_cleanup_interval(Duration::from_millis(self.cache.cleanup_interval_ms))
            .with_channel_name(self.cache.channel_name.clone()))
    }

    /// Durable store location, or memory-only when persistence is off.
    pub fn storage_options(&self) -> StorageOptions {
        match (&self.cache.persistence_path, self.cache.persistence) {
            (Some(path), true) => StorageOptions::at(path),
            _ => StorageOptions::default(),
        }
    }
}

fn config_path_from_env() -> Option<PathBuf> {
    std::env::var(CONFIG_ENV_VAR).ok().map(PathBuf::from)
}

fn config_path_from_args() -> Option<PathBuf> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            return args.next().map(PathBuf::from);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        api_base_url = "https://blog.example.com/"
        client_version = "2.4.0"

        [auth]
        bearer_token = "secret"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = ClientConfig::from_toml(MINIMAL).unwrap();
        assert!(config.validate().is_ok());

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.timeout, DEFAULT_REQUEST_TIMEOUT);
        assert_eq!(pipeline.retry, RetryPolicy::default());
        assert_eq!(pipeline.rate_limit, RateLimitConfig::default());
        assert_eq!(pipeline.batch, BatchConfig::default());
        assert_eq!(pipeline.envelope, EnvelopeMode::Wrapped);
        assert_eq!(pipeline.bearer_token.as_deref(), Some("secret"));

        assert_eq!(config.cache_config().unwrap(), CacheConfig::default());
        assert_eq!(config.storage_options(), StorageOptions::default());
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            api_base_url = "https://blog.example.com/"
            client_version = "2.4.0"
            request_timeout_ms = 5000
            envelope = "raw"

            [auth]
            bearer_token = "secret"

            [retry]
            max_attempts = 5
            initial_delay_ms = 200
            max_delay_ms = 2000
            retry_on = ["RATE_LIMITED"]

            [rate_limit]
            max_requests = 10
            window_ms = 1000

            [cache]
            strategy = "lfu"
            partition = "tenant:shop-7"
            persistence_path = "/tmp/inkwell"
        "#;
        let config = ClientConfig::from_toml(toml).unwrap();
        assert!(config.validate().is_ok());

        let pipeline = config.pipeline_config();
        assert_eq!(pipeline.timeout, Duration::from_secs(5));
        assert_eq!(pipeline.envelope, EnvelopeMode::Raw);
        assert_eq!(pipeline.retry.max_attempts, 5);
        assert_eq!(pipeline.retry.retry_on, vec!["RATE_LIMITED".to_string()]);
        assert_eq!(pipeline.rate_limit.max_requests, 10);

        let cache = config.cache_config().unwrap();
        assert_eq!(cache.strategy, EvictionStrategy::Lfu);
        assert_eq!(cache.partition, Partition::Tenant("shop-7".into()));
        assert_eq!(config.storage_options(), StorageOptions::at("/tmp/inkwell"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let toml = format!("{}\nsurprise = 1\n", MINIMAL);
        assert!(matches!(
            ClientConfig::from_toml(&toml),
            Err(ConfigLoadError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_token_rejected() {
        let toml = r#"
            api_base_url = "https://blog.example.com/"
            client_version = "2.4.0"
            [auth]
        "#;
        let config = ClientConfig::from_toml(toml).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let toml = format!("{}\n[retry]\nmultiplier = 0.5\n", MINIMAL);
        let config = ClientConfig::from_toml(&toml).unwrap();
        assert!(config.validate().is_err());

        let toml = format!("{}\n[cache]\npartition = \"planet:x\"\n", MINIMAL);
        let config = ClientConfig::from_toml(&toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pipeline_validation() {
        assert!(PipelineConfig::default().validate().is_ok());
        assert!(PipelineConfig::new("not a url").validate().is_err());
        assert!(PipelineConfig::default()
            .with_timeout(Duration::ZERO)
            .validate()
            .is_err());
    }

    #[test]
    fn test_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("inkwell.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = ClientConfig::from_path(&path).unwrap();
        assert_eq!(config.client_version, "2.4.0");

        let missing = ClientConfig::from_path(&dir.path().join("nope.toml"));
        assert!(matches!(missing, Err(ConfigLoadError::Io(_))));
    }
}
