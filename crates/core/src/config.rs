use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::queue::QueueLimits;
use crate::retry::RetryPolicy;

const CONFIG_FILE_NAME: &str = "config.toml";
const ENV_DATA_DIR: &str = "REELQUEUE_DATA_DIR";
const ENV_PROJECT_ID: &str = "GOOGLE_PROJECT_ID";
const ENV_LOCATION: &str = "GOOGLE_LOCATION";
const ENV_STORAGE_BUCKET: &str = "GOOGLE_STORAGE_BUCKET";
const STORAGE_BUCKET_PREFIX: &str = "veo2-videos/";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub upstream: UpstreamConfig,
    pub auth: AuthConfig,
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub ledger: LedgerConfig,
    pub signer: SignerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL override; the regional Vertex AI host is used when unset.
    pub endpoint: Option<String>,
    pub project_id: String,
    pub location: String,
    pub model: String,
    /// `gs://bucket/prefix/` the provider writes results under.
    pub storage_uri: Option<String>,
    pub duration_seconds: u32,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Env,
    Gcloud,
    Metadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub token_env: String,
    pub gcloud_bin: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QueueConfig {
    pub min_interval_ms: u64,
    pub max_per_minute: u32,
    /// Submissions are refused once more than this many jobs are waiting.
    pub busy_threshold: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_jitter_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LedgerConfig {
    pub ttl_secs: u64,
    pub fingerprint_bucket_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SignerConfig {
    pub url_ttl_secs: u64,
    pub access_id_env: String,
    pub secret_env: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            host: "0.0.0.0".to_string(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            project_id: String::new(),
            location: "us-central1".to_string(),
            model: "veo-2.0-generate-001".to_string(),
            storage_uri: None,
            duration_seconds: 6,
            request_timeout_secs: 60,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Gcloud,
            token_env: "REELQUEUE_ACCESS_TOKEN".to_string(),
            gcloud_bin: "gcloud".to_string(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            min_interval_ms: 2000,
            max_per_minute: 10,
            busy_threshold: 5,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_jitter_ms: 1000,
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 600,
            fingerprint_bucket_secs: 1,
        }
    }
}

impl Default for SignerConfig {
    fn default() -> Self {
        Self {
            url_ttl_secs: 3600,
            access_id_env: "GCS_HMAC_ACCESS_ID".to_string(),
            secret_env: "GCS_HMAC_SECRET".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn limits(&self) -> QueueLimits {
        QueueLimits {
            min_interval: Duration::from_millis(self.min_interval_ms),
            max_per_window: self.max_per_minute,
            ..QueueLimits::default()
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_jitter: Duration::from_millis(self.max_jitter_ms),
        }
    }
}

impl LedgerConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn fingerprint_bucket(&self) -> Duration {
        Duration::from_secs(self.fingerprint_bucket_secs.max(1))
    }
}

impl SignerConfig {
    pub fn url_ttl(&self) -> Duration {
        Duration::from_secs(self.url_ttl_secs)
    }
}

impl AppConfig {
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;

        if raw.trim().is_empty() {
            return Ok(Self::default());
        }

        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config TOML: {}", path.display()))
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        let parent = path
            .parent()
            .context("config path does not have a parent directory")?;
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config directory: {}", parent.display()))?;

        let encoded = toml::to_string_pretty(self).context("failed to serialize config TOML")?;
        fs::write(path, encoded)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;

        Ok(())
    }

    /// Apply deployment environment variables on top of the file values.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|name| env::var(name).ok());
    }

    fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        if let Some(project_id) = read(ENV_PROJECT_ID) {
            self.upstream.project_id = project_id;
        }
        if let Some(location) = read(ENV_LOCATION) {
            self.upstream.location = location;
        }
        if self.upstream.storage_uri.is_none() {
            if let Some(bucket) = read(ENV_STORAGE_BUCKET) {
                self.upstream.storage_uri = Some(format!("gs://{bucket}/{STORAGE_BUCKET_PREFIX}"));
            }
        }
    }
}

/// Resolve the data directory with 3-tier priority:
/// 1. CLI override if provided
/// 2. REELQUEUE_DATA_DIR environment variable
/// 3. Default: ./data
pub fn data_dir(cli_override: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_override {
        return path.to_path_buf();
    }

    if let Some(env_dir) = env::var_os(ENV_DATA_DIR) {
        return PathBuf::from(env_dir);
    }

    PathBuf::from("data")
}

/// Returns the path to config.toml within the given data directory.
pub fn config_path(data_dir: &Path) -> PathBuf {
    data_dir.join(CONFIG_FILE_NAME)
}

/// Create the data directory and write a default config.toml if none exists.
pub fn initialize_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))?;
    }

    let cfg_path = config_path(data_dir);
    if !cfg_path.exists() {
        AppConfig::default().save_to_path(&cfg_path)?;
    }

    Ok(())
}
