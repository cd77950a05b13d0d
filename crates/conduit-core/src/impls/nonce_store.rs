//! NonceStore 実装
//!
//! - `InMemoryNonceStore`: DashMap。caller 単位の entry lock の中で check-and-insert
//! - `SqliteNonceStore`: `INSERT OR IGNORE` の変更件数で replay を判定

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rusqlite::{Connection, params};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::domain::envelope::CallerId;
use crate::domain::record::NonceRecord;
use crate::ports::nonce_store::{NonceClaim, NonceStore};
use crate::ports::retention_store::StorageError;

#[derive(Default)]
pub struct InMemoryNonceStore {
    seen: DashMap<CallerId, HashMap<String, DateTime<Utc>>>,
}

impl InMemoryNonceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.seen.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl NonceStore for InMemoryNonceStore {
    async fn claim(
        &self,
        record: NonceRecord,
        cutoff: DateTime<Utc>,
    ) -> Result<NonceClaim, StorageError> {
        let mut nonces = self.seen.entry(record.caller_id).or_default();
        nonces.retain(|_, ts| *ts >= cutoff);
        if nonces.contains_key(&record.nonce) {
            return Ok(NonceClaim::Replayed);
        }
        nonces.insert(record.nonce, record.timestamp);
        Ok(NonceClaim::Fresh)
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let mut removed = 0;
        self.seen.retain(|_, nonces| {
            let before = nonces.len();
            nonces.retain(|_, ts| *ts >= cutoff);
            removed += before - nonces.len();
            !nonces.is_empty()
        });
        Ok(removed)
    }
}

pub struct SqliteNonceStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteNonceStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(StorageError::backend)?;
        }
        let conn = Connection::open(path).map_err(StorageError::backend)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS nonces (
                caller_id TEXT NOT NULL,
                nonce TEXT NOT NULL,
                ts_nanos INTEGER NOT NULL,
                PRIMARY KEY (caller_id, nonce)
            );",
        )
        .map_err(StorageError::backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StorageError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| StorageError::Backend("connection lock poisoned".to_string()))?;
            f(&mut guard)
        })
        .await
        .map_err(StorageError::backend)?
    }
}

fn nanos(ts: DateTime<Utc>) -> Result<i64, StorageError> {
    ts.timestamp_nanos_opt()
        .ok_or_else(|| StorageError::Encoding("timestamp out of range".to_string()))
}

#[async_trait]
impl NonceStore for SqliteNonceStore {
    async fn claim(
        &self,
        record: NonceRecord,
        cutoff: DateTime<Utc>,
    ) -> Result<NonceClaim, StorageError> {
        let ts = nanos(record.timestamp)?;
        let cutoff = nanos(cutoff)?;
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(StorageError::backend)?;
            tx.execute(
                "DELETE FROM nonces WHERE caller_id = ?1 AND ts_nanos < ?2",
                params![record.caller_id.as_str(), cutoff],
            )
            .map_err(StorageError::backend)?;
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO nonces (caller_id, nonce, ts_nanos) VALUES (?1, ?2, ?3)",
                    params![record.caller_id.as_str(), record.nonce, ts],
                )
                .map_err(StorageError::backend)?;
            tx.commit().map_err(StorageError::backend)?;
            Ok(if inserted == 1 {
                NonceClaim::Fresh
            } else {
                NonceClaim::Replayed
            })
        })
        .await
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let cutoff = nanos(cutoff)?;
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM nonces WHERE ts_nanos < ?1", params![cutoff])
                .map_err(StorageError::backend)
        })
        .await
    }
}
