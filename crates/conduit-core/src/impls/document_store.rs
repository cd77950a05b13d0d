//! DocumentRetentionStore - リモート document API を backend にする
//!
//! # Remote API
//! - `POST   /interactions`                    record を 1 件保存
//! - `GET    /interactions?caller_id=&handler=` record 一覧（順序は保証されない）
//! - `DELETE /interactions/{id}`
//! - `GET | PUT | DELETE /generations/{generation_id}`
//! - `POST   /feedback`
//! - `GET    /ping`, `GET /stats`
//!
//! prune は client 側で行います。(caller, handler) ごとの KeyedLocks で append を
//! 直列化し、insert → 一覧取得 → 上限を超えた分を削除、の順に実行します。
//! 並び順は timestamp desc, ULID desc（単調増加 ID なので insertion 順と一致）。
//!
//! insert は最初に行うので、後続（generation の登録や prune）が失敗すると
//! `append` は `StorageError` を返しても record 自体は remote に残ります。
//! 読み出し側でも上限を適用するため、観測される件数は上限を超えません。

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;

use crate::app::locks::KeyedLocks;
use crate::domain::envelope::{CallerId, HandlerName};
use crate::domain::ids::GenerationId;
use crate::domain::record::{FeedbackRecord, GenerationMapping, InteractionRecord};
use crate::impls::remote::RemoteJson;
use crate::ports::http::HttpMethod;
use crate::ports::retention_store::{
    BackendKind, RetentionStore, StorageError, StoreStats,
};

pub struct DocumentRetentionStore {
    remote: RemoteJson,
    cap: usize,
    locks: KeyedLocks<(CallerId, HandlerName)>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RecordList {
    Bare(Vec<InteractionRecord>),
    Wrapped { items: Vec<InteractionRecord> },
}

impl RecordList {
    fn into_vec(self) -> Vec<InteractionRecord> {
        match self {
            Self::Bare(items) | Self::Wrapped { items } => items,
        }
    }
}

impl DocumentRetentionStore {
    pub fn new(remote: RemoteJson, cap: usize) -> Self {
        Self {
            remote,
            cap: cap.max(1),
            locks: KeyedLocks::new(),
        }
    }

    async fn list(
        &self,
        caller_id: &CallerId,
        handler: Option<HandlerName>,
    ) -> Result<Vec<InteractionRecord>, StorageError> {
        let mut request = self
            .remote
            .request(HttpMethod::Get, "/interactions")
            .query("caller_id", caller_id);
        if let Some(handler) = handler {
            request = request.query("handler", handler);
        }
        let list: RecordList = self.remote.send_json(request).await?;
        let mut records = list.into_vec();
        records.sort_by(InteractionRecord::newest_first);
        Ok(records)
    }

    async fn lookup(&self, generation_id: GenerationId) -> Result<Option<GenerationMapping>, StorageError> {
        let path = format!("/generations/{generation_id}");
        self.remote
            .send_optional(self.remote.request(HttpMethod::Get, &path))
            .await
    }

    async fn prune(&self, caller_id: &CallerId, handler: HandlerName) -> Result<(), StorageError> {
        let records = self.list(caller_id, Some(handler)).await?;
        for stale in records.into_iter().skip(self.cap) {
            let path = format!("/interactions/{}", stale.id.as_ulid());
            self.remote
                .send_ok(self.remote.request(HttpMethod::Delete, &path))
                .await?;

            if let Some(generation_id) = stale.generation_id
                && let Some(mapping) = self.lookup(generation_id).await?
                && mapping.interaction_id == stale.id
            {
                let path = format!("/generations/{generation_id}");
                self.remote
                    .send_ok(self.remote.request(HttpMethod::Delete, &path))
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl RetentionStore for DocumentRetentionStore {
    fn kind(&self) -> BackendKind {
        BackendKind::DocumentStore
    }

    async fn append(&self, record: InteractionRecord) -> Result<(), StorageError> {
        let key = (record.caller_id.clone(), record.handler);
        let _guard = self.locks.lock(&key).await;

        let body = serde_json::to_value(&record).map_err(StorageError::encoding)?;
        self.remote
            .send_ok(self.remote.request(HttpMethod::Post, "/interactions").json(body))
            .await?;

        if let Some(mapping) = record.generation_mapping()
            && self.lookup(mapping.generation_id).await?.is_none()
        {
            let path = format!("/generations/{}", mapping.generation_id);
            let body = serde_json::to_value(&mapping).map_err(StorageError::encoding)?;
            self.remote
                .send_ok(self.remote.request(HttpMethod::Put, &path).json(body))
                .await?;
        }

        let pruned = self.prune(&key.0, key.1).await;
        self.locks.compact();
        pruned
    }

    async fn history(
        &self,
        caller_id: &CallerId,
        handler: Option<HandlerName>,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, StorageError> {
        let records = self.list(caller_id, handler).await?;

        // 削除が途中で失敗していても読み出しでは上限を超えない
        let mut per_key: HashMap<HandlerName, usize> = HashMap::new();
        let mut kept: Vec<InteractionRecord> = records
            .into_iter()
            .filter(|r| {
                let seen = per_key.entry(r.handler).or_insert(0);
                *seen += 1;
                *seen <= self.cap
            })
            .collect();
        kept.truncate(limit);
        Ok(kept)
    }

    async fn find_generation(
        &self,
        generation_id: GenerationId,
    ) -> Result<Option<GenerationMapping>, StorageError> {
        self.lookup(generation_id).await
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
            .send_ok(self.remote.request(HttpMethod::Get, "/ping"))
            .await
            .map(|_| ())
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        let stats: Option<StoreStats> = self
            .remote
            .send_optional(self.remote.request(HttpMethod::Get, "/stats"))
            .await?;
        Ok(stats.unwrap_or_default())
    }
}
