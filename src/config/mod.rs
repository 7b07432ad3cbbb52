use std::time::Duration;

use serde::Deserialize;

use crate::services::lifecycle::{RetryPolicy, TimeLimits};

/// Settings shared by the API server and the worker, read from the
/// environment (and `.env` when present).
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:8000"). Unused by workers.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Redis connection string for the job queue and result store
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_queue_prefix")]
    pub queue_prefix: String,

    /// How long job records stay queryable, in seconds
    #[serde(default = "default_result_ttl_secs")]
    pub result_ttl_secs: u64,

    /// S3-compatible endpoint (MinIO, R2, AWS)
    #[serde(default = "default_s3_endpoint")]
    pub s3_endpoint: String,

    #[serde(default = "default_s3_region")]
    pub s3_region: String,

    #[serde(default = "default_s3_bucket")]
    pub s3_bucket: String,

    #[serde(default = "default_s3_access_key")]
    pub s3_access_key: String,

    #[serde(default = "default_s3_secret_key")]
    pub s3_secret_key: String,

    /// MinIO needs path-style addressing
    #[serde(default = "default_true")]
    pub s3_path_style: bool,

    /// Lifetime of presigned upload and download URLs, in seconds
    #[serde(default = "default_presigned_ttl_secs")]
    pub presigned_url_ttl_secs: u64,

    /// Shared HMAC secret for request signing
    #[serde(default)]
    pub api_secret: String,

    /// `API_AUTH_ENABLED=false` turns request signing off (development only)
    #[serde(default = "default_true")]
    pub api_auth_enabled: bool,

    /// Accepted clock skew for signed requests, in seconds
    #[serde(default = "default_auth_window_secs")]
    pub auth_window_secs: u64,

    /// Reject a signature seen before within the window
    #[serde(default)]
    pub replay_guard: bool,

    /// Converter command line; the input path is appended
    #[serde(default = "default_converter_command")]
    pub converter_command: String,

    /// Flag passed to the converter when a job asks for images
    #[serde(default)]
    pub converter_image_flag: Option<String>,

    #[serde(default = "default_soft_time_limit_secs")]
    pub soft_time_limit_secs: u64,

    #[serde(default = "default_hard_time_limit_secs")]
    pub hard_time_limit_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_base_delay_secs")]
    pub retry_base_delay_secs: u64,

    /// Jobs one worker process runs at the same time
    #[serde(default = "default_worker_concurrency")]
    pub worker_concurrency: usize,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// How often expired leases are swept back onto the queue, in seconds
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_redis_url() -> String {
    "redis://localhost:6379/0".to_string()
}

fn default_queue_prefix() -> String {
    crate::services::queue::DEFAULT_KEY_PREFIX.to_string()
}

fn default_result_ttl_secs() -> u64 {
    3600
}

fn default_s3_endpoint() -> String {
    "http://localhost:9000".to_string()
}

fn default_s3_region() -> String {
    "us-east-1".to_string()
}

fn default_s3_bucket() -> String {
    "markdown-converter".to_string()
}

fn default_s3_access_key() -> String {
    "minioadmin".to_string()
}

fn default_s3_secret_key() -> String {
    "minioadmin".to_string()
}

fn default_true() -> bool {
    true
}

fn default_presigned_ttl_secs() -> u64 {
    3600
}

fn default_auth_window_secs() -> u64 {
    crate::services::auth::DEFAULT_WINDOW_SECS
}

fn default_converter_command() -> String {
    "markitdown".to_string()
}

fn default_soft_time_limit_secs() -> u64 {
    25 * 60
}

fn default_hard_time_limit_secs() -> u64 {
    30 * 60
}

fn default_max_retries() -> u32 {
    crate::models::job::MAX_RETRIES
}

fn default_retry_base_delay_secs() -> u64 {
    60
}

fn default_worker_concurrency() -> usize {
    1
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_reaper_interval_secs() -> u64 {
    30
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read environment: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: Self = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api_auth_enabled && self.api_secret.is_empty() {
            return Err(ConfigError::Invalid(
                "API_SECRET must be set when API_AUTH_ENABLED is true".into(),
            ));
        }
        if self.soft_time_limit_secs >= self.hard_time_limit_secs {
            return Err(ConfigError::Invalid(
                "SOFT_TIME_LIMIT_SECS must be below HARD_TIME_LIMIT_SECS".into(),
            ));
        }
        if self.max_retries > crate::models::job::MAX_RETRIES {
            return Err(ConfigError::Invalid(format!(
                "MAX_RETRIES may not exceed {}",
                crate::models::job::MAX_RETRIES
            )));
        }
        Ok(())
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn presigned_ttl(&self) -> Duration {
        Duration::from_secs(self.presigned_url_ttl_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_secs(self.retry_base_delay_secs),
        }
    }

    pub fn time_limits(&self) -> TimeLimits {
        TimeLimits {
            soft: Duration::from_secs(self.soft_time_limit_secs),
            hard: Duration::from_secs(self.hard_time_limit_secs),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs.max(1))
    }
}
