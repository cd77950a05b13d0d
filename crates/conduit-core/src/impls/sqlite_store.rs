//! SqliteRetentionStore - ローカル backend
//!
//! # 実装詳細
//! - 1 接続を `Arc<Mutex<Connection>>` で共有し、処理は spawn_blocking で実行
//! - append = insert + prune を 1 トランザクションで実行（single writer）
//! - insertion 順は `seq`（AUTOINCREMENT）で表現

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use ulid::Ulid;

use crate::domain::envelope::{Action, CallerId, HandlerName};
use crate::domain::ids::{GenerationId, InteractionId};
use crate::domain::record::{FeedbackRecord, GenerationMapping, InteractionRecord};
use crate::domain::response::NormalizedResponse;
use crate::ports::retention_store::{
    BackendKind, RetentionStore, StorageError, StoreStats,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS interactions (
        seq INTEGER PRIMARY KEY AUTOINCREMENT,
        interaction_id TEXT NOT NULL UNIQUE,
        caller_id TEXT NOT NULL,
        handler TEXT NOT NULL,
        action TEXT NOT NULL,
        ts_nanos INTEGER NOT NULL,
        input_json TEXT NOT NULL,
        output_json TEXT NOT NULL,
        generation_id INTEGER
    );
    CREATE INDEX IF NOT EXISTS idx_interactions_key
        ON interactions (caller_id, handler, ts_nanos DESC, seq DESC);
    CREATE TABLE IF NOT EXISTS generations (
        generation_id INTEGER PRIMARY KEY,
        caller_id TEXT NOT NULL,
        interaction_id TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS feedback (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        generation_id INTEGER NOT NULL,
        caller_id TEXT NOT NULL,
        command TEXT NOT NULL,
        comment TEXT,
        submitted_at TEXT NOT NULL,
        forwarded INTEGER NOT NULL
    );
";

const SELECT_COLUMNS: &str = "interaction_id, caller_id, handler, action, ts_nanos, \
                              input_json, output_json, generation_id";

pub struct SqliteRetentionStore {
    conn: Arc<Mutex<Connection>>,
    cap: usize,
}

impl SqliteRetentionStore {
    /// Open (or create) the database file. Parent directories are created.
    pub fn open(path: impl AsRef<Path>, cap: usize) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(StorageError::backend)?;
        }
        let conn = Connection::open(path).map_err(StorageError::backend)?;
        Self::init(conn, cap)
    }

    pub fn open_in_memory(cap: usize) -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory().map_err(StorageError::backend)?;
        Self::init(conn, cap)
    }

    fn init(conn: Connection, cap: usize) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA).map_err(StorageError::backend)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            cap: cap.max(1),
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

fn to_nanos(ts: DateTime<Utc>) -> Result<i64, StorageError> {
    ts.timestamp_nanos_opt()
        .ok_or_else(|| StorageError::Encoding("timestamp out of range".to_string()))
}

fn generation_to_sql(id: GenerationId) -> Result<i64, StorageError> {
    i64::try_from(id.get()).map_err(StorageError::encoding)
}

fn generation_from_sql(raw: i64) -> Result<GenerationId, StorageError> {
    u64::try_from(raw)
        .ok()
        .and_then(GenerationId::new)
        .ok_or_else(|| StorageError::Encoding(format!("invalid generation_id {raw}")))
}

fn parse_interaction_id(raw: &str) -> Result<InteractionId, StorageError> {
    Ulid::from_string(raw)
        .map(InteractionId::from_ulid)
        .map_err(StorageError::encoding)
}

fn parse_caller(raw: String) -> Result<CallerId, StorageError> {
    CallerId::new(raw).map_err(StorageError::Encoding)
}

/// Raw row as stored; decoding happens outside the rusqlite closure.
struct StoredRow {
    interaction_id: String,
    caller_id: String,
    handler: String,
    action: String,
    ts_nanos: i64,
    input_json: String,
    output_json: String,
    generation_id: Option<i64>,
}

impl StoredRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            interaction_id: row.get(0)?,
            caller_id: row.get(1)?,
            handler: row.get(2)?,
            action: row.get(3)?,
            ts_nanos: row.get(4)?,
            input_json: row.get(5)?,
            output_json: row.get(6)?,
            generation_id: row.get(7)?,
        })
    }

    fn decode(self) -> Result<InteractionRecord, StorageError> {
        let handler = HandlerName::parse(&self.handler)
            .ok_or_else(|| StorageError::Encoding(format!("unknown handler {}", self.handler)))?;
        let action = Action::parse(&self.action)
            .ok_or_else(|| StorageError::Encoding(format!("unknown action {}", self.action)))?;
        let input_payload: serde_json::Value =
            serde_json::from_str(&self.input_json).map_err(StorageError::encoding)?;
        let output_payload: NormalizedResponse =
            serde_json::from_str(&self.output_json).map_err(StorageError::encoding)?;
        Ok(InteractionRecord {
            id: parse_interaction_id(&self.interaction_id)?,
            caller_id: parse_caller(self.caller_id)?,
            handler,
            action,
            timestamp: Utc.timestamp_nanos(self.ts_nanos),
            input_payload,
            output_payload,
            generation_id: self.generation_id.map(generation_from_sql).transpose()?,
        })
    }
}

#[async_trait]
impl RetentionStore for SqliteRetentionStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn append(&self, record: InteractionRecord) -> Result<(), StorageError> {
        let cap = i64::try_from(self.cap).map_err(StorageError::encoding)?;
        let ts = to_nanos(record.timestamp)?;
        let input_json = serde_json::to_string(&record.input_payload).map_err(StorageError::encoding)?;
        let output_json =
            serde_json::to_string(&record.output_payload).map_err(StorageError::encoding)?;
        let generation = record.generation_id.map(generation_to_sql).transpose()?;

        self.with_conn(move |conn| {
            let id = record.id.as_ulid().to_string();
            let caller = record.caller_id.as_str();
            let handler = record.handler.as_str();

            let tx = conn.transaction().map_err(StorageError::backend)?;
            tx.execute(
                "INSERT INTO interactions
                    (interaction_id, caller_id, handler, action, ts_nanos, input_json, output_json, generation_id)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    id,
                    caller,
                    handler,
                    record.action.as_str(),
                    ts,
                    input_json,
                    output_json,
                    generation
                ],
            )
            .map_err(StorageError::backend)?;

            if let Some(generation_id) = generation {
                tx.execute(
                    "INSERT OR IGNORE INTO generations (generation_id, caller_id, interaction_id)
                     VALUES (?1, ?2, ?3)",
                    params![generation_id, caller, id],
                )
                .map_err(StorageError::backend)?;
            }

            tx.execute(
                "DELETE FROM interactions
                 WHERE caller_id = ?1 AND handler = ?2 AND seq NOT IN (
                     SELECT seq FROM interactions
                     WHERE caller_id = ?1 AND handler = ?2
                     ORDER BY ts_nanos DESC, seq DESC
                     LIMIT ?3
                 )",
                params![caller, handler, cap],
            )
            .map_err(StorageError::backend)?;

            tx.execute(
                "DELETE FROM generations
                 WHERE caller_id = ?1 AND interaction_id NOT IN (
                     SELECT interaction_id FROM interactions WHERE caller_id = ?1
                 )",
                params![caller],
            )
            .map_err(StorageError::backend)?;

            tx.commit().map_err(StorageError::backend)
        })
        .await
    }

    async fn history(
        &self,
        caller_id: &CallerId,
        handler: Option<HandlerName>,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, StorageError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let caller = caller_id.as_str().to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let rows = self
            .with_conn(move |conn| {
                let rows = match handler {
                    Some(handler) => {
                        let mut stmt = conn
                            .prepare(&format!(
                                "SELECT {SELECT_COLUMNS} FROM interactions
                                 WHERE caller_id = ?1 AND handler = ?2
                                 ORDER BY ts_nanos DESC, seq DESC LIMIT ?3"
                            ))
                            .map_err(StorageError::backend)?;
                        let rows = stmt
                            .query_map(params![caller, handler.as_str(), limit], StoredRow::from_row)
                            .map_err(StorageError::backend)?
                            .collect::<rusqlite::Result<Vec<_>>>();
                        rows
                    }
                    None => {
                        let mut stmt = conn
                            .prepare(&format!(
                                "SELECT {SELECT_COLUMNS} FROM interactions
                                 WHERE caller_id = ?1
                                 ORDER BY ts_nanos DESC, seq DESC LIMIT ?2"
                            ))
                            .map_err(StorageError::backend)?;
                        let rows = stmt
                            .query_map(params![caller, limit], StoredRow::from_row)
                            .map_err(StorageError::backend)?
                            .collect::<rusqlite::Result<Vec<_>>>();
                        rows
                    }
                };
                rows.map_err(StorageError::backend)
            })
            .await?;

        rows.into_iter().map(StoredRow::decode).collect()
    }

    async fn find_generation(
        &self,
        generation_id: GenerationId,
    ) -> Result<Option<GenerationMapping>, StorageError> {
        let key = generation_to_sql(generation_id)?;
        let row: Option<(String, String)> = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT caller_id, interaction_id FROM generations WHERE generation_id = ?1",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(StorageError::backend)
            })
            .await?;

        row.map(|(caller, interaction)| {
            Ok(GenerationMapping {
                generation_id,
                caller_id: parse_caller(caller)?,
                interaction_id: parse_interaction_id(&interaction)?,
            })
        })
        .transpose()
    }

    async fn record_feedback(&self, record: FeedbackRecord) -> Result<(), StorageError> {
        let generation = generation_to_sql(record.generation_id)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO feedback (generation_id, caller_id, command, comment, submitted_at, forwarded)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    generation,
                    record.caller_id.as_str(),
                    record.command.as_str(),
                    record.comment,
                    record.submitted_at.to_rfc3339(),
                    record.forwarded as i64
                ],
            )
            .map(|_| ())
            .map_err(StorageError::backend)
        })
        .await
    }

    async fn probe(&self) -> Result<(), StorageError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map(|_| ())
                .map_err(StorageError::backend)
        })
        .await
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        self.with_conn(|conn| {
            let (interactions, callers): (i64, i64) = conn
                .query_row(
                    "SELECT COUNT(*), COUNT(DISTINCT caller_id) FROM interactions",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .map_err(StorageError::backend)?;
            Ok(StoreStats {
                interactions: Some(interactions.max(0) as u64),
                callers: Some(callers.max(0) as u64),
            })
        })
        .await
    }
}

#[cfg(test)]
impl SqliteRetentionStore {
    pub(crate) fn feedback_count(&self) -> usize {
        self.conn
            .lock()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM feedback", [], |row| row.get::<_, i64>(0))
            .unwrap() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::feedback::FeedbackCommand;
    use crate::testing::{caller, record_at};
    use chrono::Duration;

    #[tokio::test]
    async fn cap_is_enforced_per_caller_and_handler() {
        let store = SqliteRetentionStore::open_in_memory(5).unwrap();
        let t0 = Utc::now();
        for i in 0..7 {
            store
                .append(record_at("u1", HandlerName::Sample, t0 + Duration::seconds(i)))
                .await
                .unwrap();
        }
        store
            .append(record_at("u1", HandlerName::Math, t0))
            .await
            .unwrap();

        let sample = store
            .history(&caller("u1"), Some(HandlerName::Sample), 100)
            .await
            .unwrap();
        assert_eq!(sample.len(), 5);
        assert_eq!(sample[0].timestamp, t0 + Duration::seconds(6));
        assert_eq!(sample[4].timestamp, t0 + Duration::seconds(2));

        let all = store.history(&caller("u1"), None, 100).await.unwrap();
        assert_eq!(all.len(), 6);
        assert_eq!(store.stats().await.unwrap().interactions, Some(6));
    }

    #[tokio::test]
    async fn equal_timestamps_keep_the_latest_insert() {
        let store = SqliteRetentionStore::open_in_memory(2).unwrap();
        let ts = Utc::now();
        let a = record_at("u1", HandlerName::Sample, ts);
        let b = record_at("u1", HandlerName::Sample, ts);
        let c = record_at("u1", HandlerName::Sample, ts);
        for r in [&a, &b, &c] {
            store.append(r.clone()).await.unwrap();
        }

        let got = store.history(&caller("u1"), None, 10).await.unwrap();
        let ids: Vec<_> = got.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![c.id, b.id]);
    }

    #[tokio::test]
    async fn records_round_trip_exactly() {
        let store = SqliteRetentionStore::open_in_memory(5).unwrap();
        let mut r = record_at("u9", HandlerName::Creator, Utc::now());
        r.generation_id = GenerationId::new(77);
        store.append(r.clone()).await.unwrap();

        let got = store.recent(&caller("u9"), 3).await.unwrap();
        assert_eq!(got, vec![r]);
    }

    #[tokio::test]
    async fn pruned_records_take_their_generation_mapping_with_them() {
        let store = SqliteRetentionStore::open_in_memory(1).unwrap();
        let t0 = Utc::now();
        let mut first = record_at("u1", HandlerName::Creator, t0);
        first.generation_id = GenerationId::new(5);
        store.append(first.clone()).await.unwrap();

        let mapping = store
            .find_generation(GenerationId::new(5).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mapping.interaction_id, first.id);

        store
            .append(record_at("u1", HandlerName::Creator, t0 + Duration::seconds(1)))
            .await
            .unwrap();
        let gone = store
            .find_generation(GenerationId::new(5).unwrap())
            .await
            .unwrap();
        assert!(gone.is_none());
    }

    #[tokio::test]
    async fn feedback_is_persisted_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("context.db");
        let store = SqliteRetentionStore::open(&path, 5).unwrap();
        store
            .record_feedback(FeedbackRecord {
                generation_id: GenerationId::new(1).unwrap(),
                caller_id: caller("u1"),
                command: FeedbackCommand::Up,
                comment: Some("nice".to_string()),
                submitted_at: Utc::now(),
                forwarded: false,
            })
            .await
            .unwrap();
        assert_eq!(store.feedback_count(), 1);
        assert!(path.exists());
        store.probe().await.unwrap();
    }
}
