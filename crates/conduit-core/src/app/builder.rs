//! GatewayBuilder - 起動時のワイヤリング
//!
//! # Fail-fast
//! - `expect_handlers()` で必要な handler を宣言し、`build()` で
//!   「期待集合 ⊆ 登録済み集合」をチェック
//! - 設定の検証、backend の接続、trusted key の decode もここで行い、
//!   失敗したら `BuildError` で起動を止める
//!
//! 構築後の `App` は設定を変更しません。

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::admission::{Admission, RateLimiter};
use super::bridge::ResilientBridge;
use super::config::{ConfigError, GatewayConfig, SecurityConfig};
use super::gateway::{Gateway, GatewayLimits};
use super::handler::Handler;
use super::readiness::ReadinessAggregator;
use super::reaper::NonceReaper;
use super::registry::{HandlerRegistry, RegistryError};
use super::security::{SecurityPolicy, SecurityValidator};
use super::selector::RetentionBackend;
use crate::domain::envelope::{CallerId, HandlerName};
use crate::impls::handlers::{CreatorHandler, MathHandler, SampleHandler};
use crate::impls::http_transport::ReqwestTransport;
use crate::impls::nonce_store::{InMemoryNonceStore, SqliteNonceStore};
use crate::ports::clock::{Clock, SystemClock};
use crate::ports::http::{HttpTransport, TransportError};
use crate::ports::nonce_store::NonceStore;
use crate::ports::retention_store::{RetentionStore, StorageError};

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("missing handlers: {0:?}. These handlers were expected but not registered.")]
    MissingHandlers(Vec<HandlerName>),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("retention backend unavailable: {0}")]
    Storage(#[from] StorageError),

    #[error("http client could not be created: {0}")]
    Transport(#[from] TransportError),
}

/// # 使用例
/// ```ignore
/// let app = GatewayBuilder::new(config)
///     .with_builtin_handlers()
///     .expect_handlers(&[HandlerName::Sample, HandlerName::Math])
///     .build()?;
/// ```
pub struct GatewayBuilder {
    config: GatewayConfig,
    registry: HandlerRegistry,
    expected: Option<Vec<HandlerName>>,
    builtin: bool,
    transport: Option<Arc<dyn HttpTransport>>,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn RetentionStore>>,
    nonces: Option<Arc<dyn NonceStore>>,
}

impl GatewayBuilder {
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            registry: HandlerRegistry::new(),
            expected: None,
            builtin: false,
            transport: None,
            clock: None,
            store: None,
            nonces: None,
        }
    }

    pub fn register<H: Handler>(mut self, handler: H) -> Result<Self, RegistryError> {
        self.registry.register(handler)?;
        Ok(self)
    }

    pub fn expect_handlers(mut self, handlers: &[HandlerName]) -> Self {
        self.expected = Some(handlers.to_vec());
        self
    }

    /// `sample`, `math` and `creator` (wired to the configured bridge).
    pub fn with_builtin_handlers(mut self) -> Self {
        self.builtin = true;
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn HttpTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Use `store` instead of the backend selected by `[storage]`.
    pub fn with_store(mut self, store: Arc<dyn RetentionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_nonce_store(mut self, nonces: Arc<dyn NonceStore>) -> Self {
        self.nonces = Some(nonces);
        self
    }

    pub fn build(self) -> Result<App, BuildError> {
        let config = self.config;
        config.validate()?;

        let transport: Arc<dyn HttpTransport> = match self.transport {
            Some(t) => t,
            None => Arc::new(ReqwestTransport::new()?),
        };
        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = match self.store {
            Some(store) => store,
            None => RetentionBackend::connect(&config.storage, config.retention_cap, transport.clone())?
                .shared(),
        };
        let nonces: Arc<dyn NonceStore> = match (self.nonces, &config.security.nonce_db_path) {
            (Some(nonces), _) => nonces,
            (None, Some(path)) => Arc::new(SqliteNonceStore::open(path)?),
            (None, None) => Arc::new(InMemoryNonceStore::new()),
        };
        let bridge = config
            .bridge
            .settings()
            .map(|settings| Arc::new(ResilientBridge::new(settings, transport.clone())));

        let mut registry = self.registry;
        if self.builtin {
            registry.register(SampleHandler)?;
            registry.register(MathHandler)?;
            registry.register(CreatorHandler::new(bridge.clone()))?;
        }
        if let Some(expected) = &self.expected {
            let registered = registry.registered();
            let missing: Vec<HandlerName> = expected
                .iter()
                .filter(|h| !registered.contains(h))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingHandlers(missing));
            }
        }

        let policy = security_policy(&config.security)?;
        let validator = SecurityValidator::new(policy, nonces.clone(), clock.clone());
        let admission = Admission::new(
            config.security.require_caller_header,
            config.security.rate_limit_per_minute.map(RateLimiter::per_minute),
            validator,
        );
        let limits = GatewayLimits {
            context_limit: config.context_limit,
            history_page_size: config.history_page_size,
            handler_timeout: config.handler_timeout(),
        };
        let gateway = Arc::new(
            Gateway::new(registry, store, admission, limits)
                .with_bridge(bridge.clone())
                .with_clock(clock.clone()),
        );
        let readiness = ReadinessAggregator::new(gateway.clone(), bridge.iter().cloned().collect());

        tracing::info!(
            handlers = ?gateway.registered_handlers(),
            backend = %gateway.store().kind(),
            security = config.security.enabled,
            bridge = bridge.is_some(),
            "gateway built"
        );
        Ok(App {
            config,
            gateway,
            readiness,
            bridge,
            nonces,
            clock,
        })
    }
}

fn security_policy(config: &SecurityConfig) -> Result<SecurityPolicy, ConfigError> {
    let mut trusted_keys = HashMap::new();
    for (caller, key) in &config.trusted_keys {
        let caller_id = CallerId::new(caller.clone())
            .map_err(|e| ConfigError::Invalid(format!("security.trusted_keys: {e}")))?;
        let key: [u8; 32] = hex::decode(key)
            .ok()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| {
                ConfigError::Invalid(format!(
                    "security.trusted_keys.{caller} must be a 32-byte hex key"
                ))
            })?;
        trusted_keys.insert(caller_id, key);
    }
    Ok(SecurityPolicy {
        enabled: config.enabled,
        drift: chrono::Duration::seconds(config.drift_seconds),
        trusted_keys,
    })
}

/// Everything a front end needs, built once.
pub struct App {
    pub config: GatewayConfig,
    pub gateway: Arc<Gateway>,
    pub readiness: ReadinessAggregator,
    pub bridge: Option<Arc<ResilientBridge>>,
    nonces: Arc<dyn NonceStore>,
    clock: Arc<dyn Clock>,
}

impl App {
    /// Background pruning of nonces older than the freshness window.
    pub fn spawn_reaper(&self) -> NonceReaper {
        let security = &self.config.security;
        NonceReaper::spawn(
            self.nonces.clone(),
            self.clock.clone(),
            chrono::Duration::seconds(security.drift_seconds),
            std::time::Duration::from_secs(security.nonce_reap_interval_secs.max(1)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::admission::RequestContext;
    use crate::ports::retention_store::BackendKind;
    use crate::testing::{FlakyStore, ScriptedTransport, caller};
    use serde_json::json;

    fn builder(config: GatewayConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
            .with_transport(Arc::new(ScriptedTransport::new(vec![])))
            .with_store(Arc::new(FlakyStore::new(5)))
    }

    #[test]
    fn builtin_handlers_satisfy_expectations() {
        let app = builder(GatewayConfig::default())
            .with_builtin_handlers()
            .expect_handlers(&[HandlerName::Sample, HandlerName::Math, HandlerName::Creator])
            .build()
            .unwrap();
        assert_eq!(
            app.gateway.registered_handlers(),
            vec![HandlerName::Creator, HandlerName::Sample, HandlerName::Math]
        );
        assert!(app.bridge.is_none());
    }

    #[test]
    fn missing_handlers_fail_the_build() {
        let err = builder(GatewayConfig::default())
            .register(SampleHandler)
            .unwrap()
            .expect_handlers(&[HandlerName::Sample, HandlerName::Finance])
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, BuildError::MissingHandlers(m) if m == vec![HandlerName::Finance]));
    }

    #[test]
    fn duplicate_registration_fails_the_build() {
        let err = builder(GatewayConfig::default())
            .register(MathHandler)
            .unwrap()
            .with_builtin_handlers()
            .build()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            BuildError::Registry(RegistryError::AlreadyRegistered(HandlerName::Math))
        ));
    }

    #[test]
    fn invalid_config_fails_the_build() {
        let config = GatewayConfig {
            retention_cap: 0,
            ..GatewayConfig::default()
        };
        assert!(matches!(builder(config).build(), Err(BuildError::Config(_))));

        let mut config = GatewayConfig::default();
        config.security.trusted_keys.insert("u1".to_string(), "zz".to_string());
        assert!(matches!(builder(config).build(), Err(BuildError::Config(_))));
    }

    #[tokio::test]
    async fn local_backend_is_opened_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = GatewayConfig::default();
        config.storage.sqlite_path = dir.path().join("nested").join("context.db");

        let app = GatewayBuilder::new(config)
            .with_transport(Arc::new(ScriptedTransport::new(vec![])))
            .with_builtin_handlers()
            .build()
            .unwrap();
        assert_eq!(app.gateway.store().kind(), BackendKind::Local);

        let response = app
            .gateway
            .handle_value(
                json!({"handler": "math", "action": "analyze", "caller_id": "u1",
                       "payload": {"operation": "add", "numbers": [1, 2]}}),
                &RequestContext::for_caller(&caller("u1")),
            )
            .await
            .unwrap();
        assert!(response.is_success());
        assert!(app.readiness.readiness().await.ready);
    }

    #[tokio::test]
    async fn reaper_can_be_started_and_stopped() {
        let app = builder(GatewayConfig::default()).build().unwrap();
        app.spawn_reaper().shutdown_and_join().await;
    }
}
