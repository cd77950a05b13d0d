//! Backend Selector - 起動時に retention backend を 1 つ選ぶ
//!
//! 優先順位は DocumentStore → Proxy → Local（最初に true のフラグが勝つ）。
//! 選ばれた backend は `Arc<dyn RetentionStore>` として共有され、実行中に
//! 差し替える手段はありません。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::config::StorageConfig;
use crate::domain::envelope::{CallerId, HandlerName};
use crate::domain::ids::GenerationId;
use crate::domain::record::{FeedbackRecord, GenerationMapping, InteractionRecord};
use crate::impls::document_store::DocumentRetentionStore;
use crate::impls::proxy_store::ProxyRetentionStore;
use crate::impls::remote::RemoteJson;
use crate::impls::sqlite_store::SqliteRetentionStore;
use crate::ports::http::HttpTransport;
use crate::ports::retention_store::{
    BackendKind, RetentionGuarantee, RetentionStore, StorageError, StoreStats,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendFlags {
    pub use_document_store: bool,
    pub use_proxy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendChoice {
    Local,
    DocumentStore,
    Proxy,
}

impl BackendChoice {
    pub fn from_flags(flags: BackendFlags) -> Self {
        if flags.use_document_store {
            Self::DocumentStore
        } else if flags.use_proxy {
            Self::Proxy
        } else {
            Self::Local
        }
    }
}

pub enum RetentionBackend {
    Local(SqliteRetentionStore),
    DocumentStore(DocumentRetentionStore),
    Proxy(ProxyRetentionStore),
}

impl RetentionBackend {
    /// Build the selected backend. Remote backends get `transport`.
    pub fn connect(
        config: &StorageConfig,
        cap: usize,
        transport: Arc<dyn HttpTransport>,
    ) -> Result<Self, StorageError> {
        let choice = BackendChoice::from_flags(config.flags());
        let missing_url =
            |what: &str| StorageError::Backend(format!("{what} url is not configured"));

        let backend = match choice {
            BackendChoice::Local => Self::Local(SqliteRetentionStore::open(&config.sqlite_path, cap)?),
            BackendChoice::DocumentStore => {
                let url = config
                    .document_store_url
                    .clone()
                    .ok_or_else(|| missing_url("document store"))?;
                let remote = RemoteJson::new(transport, url, config.timeout());
                Self::DocumentStore(DocumentRetentionStore::new(remote, cap))
            }
            BackendChoice::Proxy => {
                let url = config
                    .proxy_url
                    .clone()
                    .ok_or_else(|| missing_url("proxy"))?;
                let remote = RemoteJson::new(transport, url, config.timeout());
                Self::Proxy(ProxyRetentionStore::new(remote, config.proxy_health_path.clone()))
            }
        };
        tracing::info!(backend = %backend.kind(), "retention backend selected");
        Ok(backend)
    }

    fn inner(&self) -> &dyn RetentionStore {
        match self {
            Self::Local(s) => s,
            Self::DocumentStore(s) => s,
            Self::Proxy(s) => s,
        }
    }

    pub fn shared(self) -> Arc<dyn RetentionStore> {
        Arc::new(self)
    }
}

#[async_trait]
impl RetentionStore for RetentionBackend {
    fn kind(&self) -> BackendKind {
        self.inner().kind()
    }

    fn retention(&self) -> RetentionGuarantee {
        self.inner().retention()
    }

    async fn append(&self, record: InteractionRecord) -> Result<(), StorageError> {
        self.inner().append(record).await
    }

    async fn history(
        &self,
        caller_id: &CallerId,
        handler: Option<HandlerName>,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, StorageError> {
        self.inner().history(caller_id, handler, limit).await
    }

    async fn find_generation(
        &self,
        generation_id: GenerationId,
    ) -> Result<Option<GenerationMapping>, StorageError> {
        self.inner().find_generation(generation_id).await
    }

    async fn record_feedback(&self, record: FeedbackRecord) -> Result<(), StorageError> {
        self.inner().record_feedback(record).await
    }

    async fn probe(&self) -> Result<(), StorageError> {
        self.inner().probe().await
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        self.inner().stats().await
    }
}
