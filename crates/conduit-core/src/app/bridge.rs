//! ResilientBridge - 外部 collaborator 呼び出しのラッパー
//!
//! # 失敗の分類
//! - network: 接続失敗、timeout、5xx → `RetryPolicy` に従ってリトライ
//! - schema: JSON として読めない、object でない、`status` が不正、400 / 422 → リトライしない
//! - unexpected: その他の 4xx / 3xx → リトライしない
//!
//! 失敗は必ず fallback（通常のレスポンスと同じ形、`fallback_used = true`）になり、
//! 呼び出し側にエラーとして伝播することはありません。
//! health probe は独自の短い timeout を持ち、結果は `health_cache` の間キャッシュされます。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::retry::RetryPolicy;
use crate::domain::errors::BridgeErrorKind;
use crate::domain::response::{NormalizedResponse, ResponseStatus};
use crate::ports::http::{HttpMethod, HttpReply, HttpRequest, HttpTransport, join_url};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeOperation {
    Generate,
    Feedback,
    History,
    Log,
    Context,
}

impl BridgeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Feedback => "feedback",
            Self::History => "history",
            Self::Log => "log",
            Self::Context => "context",
        }
    }

    fn route(&self) -> (HttpMethod, &'static str) {
        match self {
            Self::Generate => (HttpMethod::Post, "/generate"),
            Self::Feedback => (HttpMethod::Post, "/feedback"),
            Self::History => (HttpMethod::Get, "/history"),
            Self::Log => (HttpMethod::Post, "/core/log"),
            Self::Context => (HttpMethod::Get, "/core/context"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BridgeSettings {
    /// Name used in logs, readiness and diagnostics.
    pub name: String,
    pub base_url: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
    pub health_path: String,
    pub health_timeout: Duration,
    pub health_cache: Duration,
    pub degraded_ok: bool,
}

impl BridgeSettings {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into(),
            timeout: Duration::from_secs(5),
            retry: RetryPolicy::default(),
            health_path: "/system/health".to_string(),
            health_timeout: Duration::from_secs(1),
            health_cache: Duration::from_secs(5),
            degraded_ok: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub status: ResponseStatus,
    pub message: String,
    pub result: Value,
    pub fallback_used: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<BridgeErrorKind>,
}

impl BridgeResponse {
    fn fallback(bridge: &str, operation: BridgeOperation, kind: BridgeErrorKind) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: format!("{bridge} unavailable ({kind}); fallback response used"),
            result: json!({
                "operation": operation.as_str(),
                "error_type": kind.as_str(),
            }),
            fallback_used: true,
            error_kind: Some(kind),
        }
    }

    pub fn is_success(&self) -> bool {
        !self.fallback_used && self.status == ResponseStatus::Success
    }

    pub fn to_normalized(&self) -> NormalizedResponse {
        match self.status {
            ResponseStatus::Success => NormalizedResponse::success(&self.message, self.result.clone()),
            ResponseStatus::Error => NormalizedResponse::error(&self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct HealthProbe {
    pub healthy: bool,
    #[serde(rename = "latency_ms", serialize_with = "as_millis")]
    pub latency: Duration,
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis().min(u64::MAX as u128) as u64)
}

struct AttemptFailure {
    kind: BridgeErrorKind,
    retryable: bool,
    detail: String,
}

impl AttemptFailure {
    fn network(detail: impl Into<String>) -> Self {
        Self {
            kind: BridgeErrorKind::Network,
            retryable: true,
            detail: detail.into(),
        }
    }

    fn schema(detail: impl Into<String>) -> Self {
        Self {
            kind: BridgeErrorKind::Schema,
            retryable: false,
            detail: detail.into(),
        }
    }

    fn unexpected(detail: impl Into<String>) -> Self {
        Self {
            kind: BridgeErrorKind::Unexpected,
            retryable: false,
            detail: detail.into(),
        }
    }
}

pub struct ResilientBridge {
    settings: BridgeSettings,
    transport: Arc<dyn HttpTransport>,
    health: Mutex<Option<(Instant, HealthProbe)>>,
}

impl ResilientBridge {
    pub fn new(settings: BridgeSettings, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            settings,
            transport,
            health: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn degraded_ok(&self) -> bool {
        self.settings.degraded_ok
    }

    /// Call the collaborator. Never fails; failures come back as a fallback.
    pub async fn call(&self, operation: BridgeOperation, payload: Value) -> BridgeResponse {
        let started = Instant::now();
        let mut attempt = 1;
        loop {
            match self.attempt(operation, &payload).await {
                Ok(response) => {
                    tracing::debug!(
                        dependency = %self.settings.name,
                        operation = operation.as_str(),
                        attempt,
                        latency_ms = started.elapsed().as_millis() as u64,
                        "collaborator call succeeded"
                    );
                    return response;
                }
                Err(failure) => {
                    tracing::warn!(
                        dependency = %self.settings.name,
                        operation = operation.as_str(),
                        attempt,
                        error_type = failure.kind.as_str(),
                        error = %failure.detail,
                        "collaborator call failed"
                    );
                    if !failure.retryable || !self.settings.retry.should_retry(attempt) {
                        tracing::error!(
                            dependency = %self.settings.name,
                            operation = operation.as_str(),
                            error_type = failure.kind.as_str(),
                            latency_ms = started.elapsed().as_millis() as u64,
                            "collaborator fallback used"
                        );
                        return BridgeResponse::fallback(&self.settings.name, operation, failure.kind);
                    }
                    tokio::time::sleep(self.settings.retry.next_delay(attempt)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn attempt(
        &self,
        operation: BridgeOperation,
        payload: &Value,
    ) -> Result<BridgeResponse, AttemptFailure> {
        let (method, path) = operation.route();
        let mut request = HttpRequest::new(
            method,
            join_url(&self.settings.base_url, path),
            self.settings.timeout,
        );
        match method {
            HttpMethod::Get => {
                if let Value::Object(map) = payload {
                    for (key, value) in map {
                        match value {
                            Value::Null => {}
                            Value::String(s) => request = request.query(key, s),
                            other => request = request.query(key, other),
                        }
                    }
                }
            }
            _ => request = request.json(payload.clone()),
        }

        let reply = match tokio::time::timeout(self.settings.timeout, self.transport.send(request)).await {
            Err(_) => return Err(AttemptFailure::network("attempt timed out")),
            Ok(Err(e)) => return Err(AttemptFailure::network(e.to_string())),
            Ok(Ok(reply)) => reply,
        };
        parse_reply(&reply)
    }

    /// Cached health of the collaborator.
    pub async fn health_probe(&self) -> HealthProbe {
        let mut cache = self.health.lock().await;
        if let Some((checked_at, probe)) = *cache
            && checked_at.elapsed() < self.settings.health_cache
        {
            return probe;
        }

        let started = Instant::now();
        let request = HttpRequest::new(
            HttpMethod::Get,
            join_url(&self.settings.base_url, &self.settings.health_path),
            self.settings.health_timeout,
        );
        let healthy = match tokio::time::timeout(self.settings.health_timeout, self.transport.send(request)).await {
            Ok(Ok(reply)) => reply_is_healthy(&reply),
            Ok(Err(e)) => {
                tracing::warn!(dependency = %self.settings.name, error = %e, "health probe failed");
                false
            }
            Err(_) => {
                tracing::warn!(dependency = %self.settings.name, "health probe timed out");
                false
            }
        };
        let probe = HealthProbe {
            healthy,
            latency: started.elapsed(),
        };
        *cache = Some((Instant::now(), probe));
        probe
    }
}

fn parse_reply(reply: &HttpReply) -> Result<BridgeResponse, AttemptFailure> {
    match reply.status {
        200..=299 => {}
        500..=599 => return Err(AttemptFailure::network(format!("status {}", reply.status))),
        400 | 422 => return Err(AttemptFailure::schema(format!("status {}", reply.status))),
        other => return Err(AttemptFailure::unexpected(format!("status {other}"))),
    }

    let body: Value = serde_json::from_str(&reply.body)
        .map_err(|e| AttemptFailure::schema(format!("invalid JSON: {e}")))?;
    let Value::Object(mut map) = body else {
        return Err(AttemptFailure::schema("response body is not an object"));
    };

    let status = match map.remove("status") {
        None => ResponseStatus::Success,
        Some(Value::String(s)) => match s.to_ascii_lowercase().as_str() {
            "success" | "ok" => ResponseStatus::Success,
            "error" => ResponseStatus::Error,
            _ => return Err(AttemptFailure::schema(format!("unknown status '{s}'"))),
        },
        Some(_) => return Err(AttemptFailure::schema("status is not a string")),
    };
    let message = match map.remove("message") {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(_) => return Err(AttemptFailure::schema("message is not a string")),
    };
    let result = match map.remove("result") {
        Some(result) => result,
        None => Value::Object(map),
    };

    Ok(BridgeResponse {
        status,
        message,
        result,
        fallback_used: false,
        error_kind: None,
    })
}

fn reply_is_healthy(reply: &HttpReply) -> bool {
    if !reply.is_success() {
        return false;
    }
    match serde_json::from_str::<Map<String, Value>>(&reply.body) {
        Ok(body) => match body.get("status").and_then(Value::as_str) {
            Some(status) => matches!(status, "healthy" | "ok" | "success"),
            None => true,
        },
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::http::TransportError;
    use crate::testing::ScriptedTransport;

    fn ok(body: &str) -> Result<HttpReply, TransportError> {
        Ok(HttpReply {
            status: 200,
            body: body.to_string(),
        })
    }

    fn status(code: u16) -> Result<HttpReply, TransportError> {
        Ok(HttpReply {
            status: code,
            body: String::new(),
        })
    }

    fn bridge(transport: &Arc<ScriptedTransport>) -> ResilientBridge {
        ResilientBridge::new(BridgeSettings::new("content", "http://content.test"), transport.clone())
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_returned_without_fallback() {
        let transport = Arc::new(ScriptedTransport::new(vec![ok(
            r#"{"status":"success","message":"done","result":{"generation_id":7}}"#,
        )]));
        let resp = bridge(&transport).call(BridgeOperation::Generate, json!({"topic": "x"})).await;

        assert!(resp.is_success());
        assert_eq!(resp.result, json!({"generation_id": 7}));
        let sent = transport.requests();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].url, "http://content.test/generate");
        assert_eq!(sent[0].body, Some(json!({"topic": "x"})));
    }

    #[tokio::test(start_paused = true)]
    async fn network_failures_are_retried_then_fall_back() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(TransportError::Connect("refused".into())),
            status(503),
            Err(TransportError::Timeout),
        ]));
        let started = Instant::now();
        let resp = bridge(&transport).call(BridgeOperation::Generate, json!({})).await;

        assert!(resp.fallback_used);
        assert_eq!(resp.error_kind, Some(BridgeErrorKind::Network));
        assert_eq!(resp.status, ResponseStatus::Error);
        assert_eq!(resp.result, json!({"operation": "generate", "error_type": "network"}));
        assert_eq!(transport.requests().len(), 3);
        // 500ms + 1s のバックオフ
        assert!(started.elapsed() >= Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_before_the_limit() {
        let transport = Arc::new(ScriptedTransport::new(vec![status(502), ok(r#"{"items":[]}"#)]));
        let resp = bridge(&transport).call(BridgeOperation::History, json!({"topic": "ai"})).await;

        assert!(resp.is_success());
        assert_eq!(resp.result, json!({"items": []}));
        let sent = transport.requests();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].query, vec![("topic".to_string(), "ai".to_string())]);
        assert!(sent[1].body.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn protocol_errors_are_not_retried() {
        for (reply, kind) in [
            (ok("not json"), BridgeErrorKind::Schema),
            (ok("[1,2]"), BridgeErrorKind::Schema),
            (ok(r#"{"status": 3}"#), BridgeErrorKind::Schema),
            (status(400), BridgeErrorKind::Schema),
            (status(422), BridgeErrorKind::Schema),
            (status(404), BridgeErrorKind::Unexpected),
        ] {
            let transport = Arc::new(ScriptedTransport::new(vec![reply]));
            let resp = bridge(&transport).call(BridgeOperation::Feedback, json!({})).await;
            assert!(resp.fallback_used);
            assert_eq!(resp.error_kind, Some(kind));
            assert_eq!(transport.requests().len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_is_deterministic() {
        let a = Arc::new(ScriptedTransport::new(vec![status(400)]));
        let b = Arc::new(ScriptedTransport::new(vec![ok("<html>")]));
        let ra = bridge(&a).call(BridgeOperation::Log, json!({"x": 1})).await;
        let rb = bridge(&b).call(BridgeOperation::Log, json!({"y": 2})).await;
        assert_eq!(ra, rb);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_collaborator_hits_the_attempt_timeout() {
        let transport = Arc::new(
            ScriptedTransport::new(vec![ok("{}"), ok("{}"), ok("{}")]).with_delay(Duration::from_secs(60)),
        );
        let resp = bridge(&transport).call(BridgeOperation::Generate, json!({})).await;
        assert_eq!(resp.error_kind, Some(BridgeErrorKind::Network));
        assert_eq!(transport.requests().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn health_probe_is_cached() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            ok(r#"{"status":"healthy"}"#),
            status(503),
        ]));
        let bridge = bridge(&transport);

        assert!(bridge.health_probe().await.healthy);
        assert!(bridge.health_probe().await.healthy);
        assert_eq!(transport.requests().len(), 1);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(!bridge.health_probe().await.healthy);
        assert_eq!(transport.requests().len(), 2);
        assert!(transport.requests()[0].url.ends_with("/system/health"));
    }
}
