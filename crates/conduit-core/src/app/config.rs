//! GatewayConfig - 起動時に一度だけ読み込む設定
//!
//! TOML から読み込み、欠けている項目はすべて Default で埋めます。
//! `App` 構築後は変更しません。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use super::bridge::BridgeSettings;
use super::retry::RetryPolicy;
use super::selector::{BackendChoice, BackendFlags};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub retention_cap: usize,
    pub history_page_size: usize,
    pub context_limit: usize,
    pub handler_timeout_ms: u64,
    pub storage: StorageConfig,
    pub security: SecurityConfig,
    pub bridge: BridgeConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            retention_cap: 5,
            history_page_size: 10,
            context_limit: 3,
            handler_timeout_ms: 30_000,
            storage: StorageConfig::default(),
            security: SecurityConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub use_document_store: bool,
    pub use_proxy: bool,
    pub sqlite_path: PathBuf,
    pub document_store_url: Option<String>,
    pub proxy_url: Option<String>,
    pub proxy_health_path: String,
    pub timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            use_document_store: false,
            use_proxy: false,
            sqlite_path: PathBuf::from("data/context.db"),
            document_store_url: None,
            proxy_url: None,
            proxy_health_path: "/system/health".to_string(),
            timeout_ms: 5_000,
        }
    }
}

impl StorageConfig {
    pub fn flags(&self) -> BackendFlags {
        BackendFlags {
            use_document_store: self.use_document_store,
            use_proxy: self.use_proxy,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub enabled: bool,
    pub drift_seconds: i64,
    pub require_caller_header: bool,
    pub rate_limit_per_minute: Option<u32>,
    pub nonce_reap_interval_secs: u64,
    pub nonce_db_path: Option<PathBuf>,
    /// caller_id → hex-encoded Ed25519 public key
    pub trusted_keys: HashMap<String, String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            drift_seconds: 300,
            require_caller_header: true,
            rate_limit_per_minute: None,
            nonce_reap_interval_secs: 60,
            nonce_db_path: None,
            trusted_keys: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub name: String,
    pub base_url: Option<String>,
    pub timeout_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub health_path: String,
    pub health_timeout_ms: u64,
    pub health_cache_ms: u64,
    pub degraded_ok: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            name: "content".to_string(),
            base_url: None,
            timeout_ms: 5_000,
            max_attempts: 3,
            backoff_base_ms: 500,
            backoff_multiplier: 2.0,
            health_path: "/system/health".to_string(),
            health_timeout_ms: 1_000,
            health_cache_ms: 5_000,
            degraded_ok: false,
        }
    }
}

impl BridgeConfig {
    /// Settings for the bridge, or `None` when it is disabled.
    pub fn settings(&self) -> Option<BridgeSettings> {
        if !self.enabled {
            return None;
        }
        let base_url = self.base_url.clone()?;
        Some(BridgeSettings {
            name: self.name.clone(),
            base_url,
            timeout: Duration::from_millis(self.timeout_ms),
            retry: RetryPolicy {
                max_attempts: self.max_attempts,
                base_delay: Duration::from_millis(self.backoff_base_ms),
                multiplier: self.backoff_multiplier,
            },
            health_path: self.health_path.clone(),
            health_timeout: Duration::from_millis(self.health_timeout_ms),
            health_cache: Duration::from_millis(self.health_cache_ms),
            degraded_ok: self.degraded_ok,
        })
    }
}

impl GatewayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.retention_cap == 0 {
            return invalid("retention_cap must be at least 1");
        }
        if self.history_page_size == 0 {
            return invalid("history_page_size must be at least 1");
        }
        if self.handler_timeout_ms == 0 {
            return invalid("handler_timeout_ms must be positive");
        }
        if self.security.drift_seconds < 0 {
            return invalid("security.drift_seconds must not be negative");
        }
        if self.bridge.max_attempts == 0 {
            return invalid("bridge.max_attempts must be at least 1");
        }
        if self.bridge.enabled && self.bridge.base_url.is_none() {
            return invalid("bridge.base_url is required when the bridge is enabled");
        }
        match BackendChoice::from_flags(self.storage.flags()) {
            BackendChoice::DocumentStore if self.storage.document_store_url.is_none() => {
                invalid("storage.document_store_url is required for the document store backend")
            }
            BackendChoice::Proxy if self.storage.proxy_url.is_none() => {
                invalid("storage.proxy_url is required for the proxy backend")
            }
            _ => Ok(()),
        }
    }
}
