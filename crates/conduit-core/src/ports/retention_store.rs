//! RetentionStore port - interaction 履歴の保存先
//!
//! (caller_id, handler) ごとに最大 N 件を保持します。append は prune と同じ
//! 論理操作で行われ、読み出しは常に新しい順（timestamp desc, insertion desc）です。
//!
//! # 実装
//! - `impls::sqlite_store`: ローカル SQLite
//! - `impls::document_store`: リモートの document API
//! - `impls::proxy_store`: リモートの context service（履歴はそのまま返す）

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::envelope::{CallerId, HandlerName};
use crate::domain::errors::GatewayError;
use crate::domain::ids::GenerationId;
use crate::domain::record::{FeedbackRecord, GenerationMapping, InteractionRecord};

/// StorageError は backend の I/O 失敗
///
/// リトライも fallback もしません。呼び出し側へそのまま返します。
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("backend error: {0}")]
    Backend(String),

    #[error("record encoding failed: {0}")]
    Encoding(String),

    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    #[error("remote store rejected the request with status {status}")]
    Rejected { status: u16 },
}

impl StorageError {
    pub fn backend(err: impl fmt::Display) -> Self {
        Self::Backend(err.to_string())
    }

    pub fn encoding(err: impl fmt::Display) -> Self {
        Self::Encoding(err.to_string())
    }
}

impl From<StorageError> for GatewayError {
    fn from(err: StorageError) -> Self {
        GatewayError::storage(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Local,
    DocumentStore,
    Proxy,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::DocumentStore => "document_store",
            Self::Proxy => "proxy",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How strictly a backend honors the retention cap on reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetentionGuarantee {
    /// Cap and ordering enforced by this process.
    Enforced,
    /// History comes back exactly as the remote service returns it.
    RemoteVerbatim,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub interactions: Option<u64>,
    pub callers: Option<u64>,
}

#[async_trait]
pub trait RetentionStore: Send + Sync {
    fn kind(&self) -> BackendKind;

    fn retention(&self) -> RetentionGuarantee {
        RetentionGuarantee::Enforced
    }

    /// Insert and prune the record's (caller, handler) key in one step.
    async fn append(&self, record: InteractionRecord) -> Result<(), StorageError>;

    /// Most recent first, at most `limit` records.
    async fn history(
        &self,
        caller_id: &CallerId,
        handler: Option<HandlerName>,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, StorageError>;

    async fn recent(
        &self,
        caller_id: &CallerId,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, StorageError> {
        self.history(caller_id, None, limit).await
    }

    async fn find_generation(
        &self,
        generation_id: GenerationId,
    ) -> Result<Option<GenerationMapping>, StorageError>;

    async fn record_feedback(&self, record: FeedbackRecord) -> Result<(), StorageError>;

    /// Trivial read used by readiness.
    async fn probe(&self) -> Result<(), StorageError>;

    async fn stats(&self) -> Result<StoreStats, StorageError>;
}
