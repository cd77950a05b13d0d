//! ProxyRetentionStore - 外部の context service に保存を任せる backend
//!
//! 履歴は remote が返したものをそのまま返します（ローカルでの並べ替えや上限の
//! 適用はしない）。この緩和は `RetentionGuarantee::RemoteVerbatim` として公開します。
//!
//! # Remote API
//! - `POST /interactions`, `GET /history?caller_id=&handler=&limit=`
//! - `GET | PUT /generations/{generation_id}`, `POST /feedback`
//! - health path（設定値）を probe に使う

use async_trait::async_trait;
use serde::Deserialize;

use crate::domain::envelope::{CallerId, HandlerName};
use crate::domain::ids::GenerationId;
use crate::domain::record::{FeedbackRecord, GenerationMapping, InteractionRecord};
use crate::impls::remote::RemoteJson;
use crate::ports::http::HttpMethod;
use crate::ports::retention_store::{
    BackendKind, RetentionGuarantee, RetentionStore, StorageError, StoreStats,
};

pub struct ProxyRetentionStore {
    remote: RemoteJson,
    health_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HistoryReply {
    Bare(Vec<InteractionRecord>),
    Wrapped { items: Vec<InteractionRecord> },
}

impl ProxyRetentionStore {
    pub fn new(remote: RemoteJson, health_path: impl Into<String>) -> Self {
        Self {
            remote,
            health_path: health_path.into(),
        }
    }
}

#[async_trait]
impl RetentionStore for ProxyRetentionStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Proxy
    }

    fn retention(&self) -> RetentionGuarantee {
        RetentionGuarantee::RemoteVerbatim
    }

    async fn append(&self, record: InteractionRecord) -> Result<(), StorageError> {
        let mapping = record.generation_mapping();
        let body = serde_json::to_value(&record).map_err(StorageError::encoding)?;
        self.remote
            .send_ok(self.remote.request(HttpMethod::Post, "/interactions").json(body))
            .await?;

        if let Some(mapping) = mapping {
            let path = format!("/generations/{}", mapping.generation_id);
            let body = serde_json::to_value(&mapping).map_err(StorageError::encoding)?;
            self.remote
                .send_ok(self.remote.request(HttpMethod::Put, &path).json(body))
                .await?;
        }
        Ok(())
    }

    async fn history(
        &self,
        caller_id: &CallerId,
        handler: Option<HandlerName>,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, StorageError> {
        let mut request = self
            .remote
            .request(HttpMethod::Get, "/history")
            .query("caller_id", caller_id)
            .query("limit", limit);
        if let Some(handler) = handler {
            request = request.query("handler", handler);
        }
        let reply: HistoryReply = self.remote.send_json(request).await?;
        let mut records = match reply {
            HistoryReply::Bare(items) | HistoryReply::Wrapped { items } => items,
        };
        records.truncate(limit);
        Ok(records)
    }

    async fn find_generation(
        &self,
        generation_id: GenerationId,
    ) -> Result<Option<GenerationMapping>, StorageError> {
        let path = format!("/generations/{generation_id}");
        self.remote
            .send_optional(self.remote.request(HttpMethod::Get, &path))
            .await
    }

    async fn record_feedback(&self, record: FeedbackRecord) -> Result<(), StorageError> {
        let body = serde_json::to_value(&record).map_err(StorageError::encoding)?;
        self.remote
            .send_ok(self.remote.request(HttpMethod::Post, "/feedback").json(body))
            .await
            .map(|_| ())
    }

    async fn probe(&self) -> Result<(), StorageError> {
        self.remote
            .send_ok(self.remote.request(HttpMethod::Get, &self.health_path))
            .await
            .map(|_| ())
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        Ok(StoreStats::default())
    }
}
