//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex};
use std::time::Duration;

use crate::domain::envelope::{Action, CallerId, HandlerName};
use crate::domain::ids::GenerationId;
use crate::domain::record::{FeedbackRecord, GenerationMapping, InteractionRecord};
use crate::domain::response::NormalizedResponse;
use crate::ports::http::{HttpMethod, HttpReply, HttpRequest, HttpTransport, TransportError};
use crate::ports::retention_store::{BackendKind, RetentionStore, StorageError, StoreStats};
use crate::ports::{IdGenerator, SystemClock, UlidGenerator};

static IDS: LazyLock<UlidGenerator<SystemClock>> = LazyLock::new(|| UlidGenerator::new(SystemClock));

pub fn caller(id: &str) -> CallerId {
    CallerId::new(id).unwrap()
}

/// Successful record; ids come from one monotonic generator so insertion order = id order.
pub fn record_at(caller_id: &str, handler: HandlerName, timestamp: DateTime<Utc>) -> InteractionRecord {
    InteractionRecord {
        id: IDS.generate_interaction_id(),
        caller_id: caller(caller_id),
        handler,
        action: Action::Analyze,
        timestamp,
        input_payload: json!({}),
        output_payload: NormalizedResponse::success("", json!({})),
        generation_id: None,
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|p| p.into_inner())
}

fn path_of(url: &str) -> String {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    rest.find('/').map(|i| rest[i..].to_string()).unwrap_or_else(|| "/".to_string())
}

fn reply(status: u16, body: Value) -> Result<HttpReply, TransportError> {
    Ok(HttpReply {
        status,
        body: body.to_string(),
    })
}

/// Replies in script order and records every request. Empty script → connect error.
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Result<HttpReply, TransportError>>>,
    requests: Mutex<Vec<HttpRequest>>,
    delay: Option<Duration>,
}

impl ScriptedTransport {
    pub fn new(replies: Vec<Result<HttpReply, TransportError>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
            delay: None,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        lock(&self.requests).clone()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpReply, TransportError> {
        lock(&self.requests).push(request);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.replies)
            .pop_front()
            .unwrap_or_else(|| Err(TransportError::Connect("script exhausted".to_string())))
    }
}

/// In-memory stand-in for the remote document API.
#[derive(Default)]
pub struct FakeDocumentApi {
    interactions: Mutex<Vec<InteractionRecord>>,
    generations: Mutex<HashMap<u64, Value>>,
    feedback: Mutex<Vec<Value>>,
    down: AtomicBool,
    listing_down: AtomicBool,
}

impl FakeDocumentApi {
    pub fn stored_count(&self) -> usize {
        lock(&self.interactions).len()
    }

    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Only `GET /interactions` fails; writes still succeed.
    pub fn set_listing_down(&self, down: bool) {
        self.listing_down.store(down, Ordering::SeqCst);
    }

    fn query<'a>(request: &'a HttpRequest, key: &str) -> Option<&'a str> {
        request
            .query
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[async_trait]
impl HttpTransport for FakeDocumentApi {
    async fn send(&self, request: HttpRequest) -> Result<HttpReply, TransportError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(TransportError::Connect("connection refused".to_string()));
        }
        // 並行 append の interleave を起こしやすくする
        tokio::task::yield_now().await;

        let path = path_of(&request.url);
        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match (request.method, segments.as_slice()) {
            (HttpMethod::Post, ["interactions"]) => {
                let body = request.body.clone().unwrap_or(Value::Null);
                let Ok(record) = serde_json::from_value::<InteractionRecord>(body) else {
                    return reply(422, json!({"detail": "bad record"}));
                };
                lock(&self.interactions).push(record);
                reply(201, json!({"ok": true}))
            }
            (HttpMethod::Get, ["interactions"]) => {
                if self.listing_down.load(Ordering::SeqCst) {
                    return reply(503, json!({"detail": "listing unavailable"}));
                }
                let caller_id = Self::query(&request, "caller_id");
                let handler = Self::query(&request, "handler");
                let items: Vec<InteractionRecord> = lock(&self.interactions)
                    .iter()
                    .filter(|r| caller_id.is_none_or(|c| r.caller_id.as_str() == c))
                    .filter(|r| handler.is_none_or(|h| r.handler.as_str() == h))
                    .cloned()
                    .collect();
                reply(200, json!({ "items": items }))
            }
            (HttpMethod::Delete, ["interactions", id]) => {
                lock(&self.interactions).retain(|r| r.id.as_ulid().to_string() != *id);
                reply(204, Value::Null)
            }
            (method, ["generations", id]) => {
                let Ok(id) = id.parse::<u64>() else {
                    return reply(400, json!({}));
                };
                let mut generations = lock(&self.generations);
                match method {
                    HttpMethod::Get => match generations.get(&id) {
                        Some(mapping) => reply(200, mapping.clone()),
                        None => reply(404, json!({"detail": "not found"})),
                    },
                    HttpMethod::Put => {
                        generations.insert(id, request.body.clone().unwrap_or(Value::Null));
                        reply(200, json!({"ok": true}))
                    }
                    HttpMethod::Delete => {
                        generations.remove(&id);
                        reply(204, Value::Null)
                    }
                    HttpMethod::Post => reply(405, json!({})),
                }
            }
            (HttpMethod::Post, ["feedback"]) => {
                lock(&self.feedback).push(request.body.clone().unwrap_or(Value::Null));
                reply(201, json!({"ok": true}))
            }
            (HttpMethod::Get, ["ping"]) => reply(200, json!({"ok": true})),
            (HttpMethod::Get, ["stats"]) => {
                let interactions = lock(&self.interactions);
                let mut callers: Vec<&str> = interactions.iter().map(|r| r.caller_id.as_str()).collect();
                callers.sort_unstable();
                callers.dedup();
                reply(
                    200,
                    json!({"interactions": interactions.len(), "callers": callers.len()}),
                )
            }
            _ => reply(404, json!({"detail": "no route"})),
        }
    }
}

/// Capped in-memory store whose operations can be made to fail on demand.
pub struct FlakyStore {
    cap: usize,
    records: Mutex<Vec<InteractionRecord>>,
    generations: Mutex<HashMap<GenerationId, GenerationMapping>>,
    feedback: Mutex<Vec<FeedbackRecord>>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl FlakyStore {
    pub fn new(cap: usize) -> Self {
        Self {
            cap,
            records: Mutex::new(Vec::new()),
            generations: Mutex::new(HashMap::new()),
            feedback: Mutex::new(Vec::new()),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        lock(&self.records).len()
    }

    pub fn feedback(&self) -> Vec<FeedbackRecord> {
        lock(&self.feedback).clone()
    }

    fn check_reads(&self) -> Result<(), StorageError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("disk I/O error".to_string()));
        }
        Ok(())
    }

    fn check_writes(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("database is locked".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RetentionStore for FlakyStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn append(&self, record: InteractionRecord) -> Result<(), StorageError> {
        self.check_writes()?;
        let mut records = lock(&self.records);
        let mut generations = lock(&self.generations);
        if let Some(mapping) = record.generation_mapping() {
            generations.entry(mapping.generation_id).or_insert(mapping);
        }
        let key = (record.caller_id.clone(), record.handler);
        records.push(record);
        records.sort_by(InteractionRecord::newest_first);

        let mut seen = 0;
        records.retain(|r| {
            if (r.caller_id.clone(), r.handler) != key {
                return true;
            }
            seen += 1;
            seen <= self.cap
        });
        generations.retain(|_, m| records.iter().any(|r| r.id == m.interaction_id));
        Ok(())
    }

    async fn history(
        &self,
        caller_id: &CallerId,
        handler: Option<HandlerName>,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, StorageError> {
        self.check_reads()?;
        Ok(lock(&self.records)
            .iter()
            .filter(|r| &r.caller_id == caller_id && handler.is_none_or(|h| r.handler == h))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn find_generation(
        &self,
        generation_id: GenerationId,
    ) -> Result<Option<GenerationMapping>, StorageError> {
        self.check_reads()?;
        Ok(lock(&self.generations).get(&generation_id).cloned())
    }

    async fn record_feedback(&self, record: FeedbackRecord) -> Result<(), StorageError> {
        self.check_writes()?;
        lock(&self.feedback).push(record);
        Ok(())
    }

    async fn probe(&self) -> Result<(), StorageError> {
        self.check_reads()
    }

    async fn stats(&self) -> Result<StoreStats, StorageError> {
        self.check_reads()?;
        Ok(StoreStats {
            interactions: Some(lock(&self.records).len() as u64),
            callers: None,
        })
    }
}
