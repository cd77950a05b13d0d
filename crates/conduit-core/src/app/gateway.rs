//! Gateway - リクエスト 1 件の処理パイプライン
//!
//! # フロー
//! 1. admission（identity header → rate limit → 署名 / 時刻 / nonce）
//! 2. registry から handler を解決（未登録なら error レスポンス、record なし）
//! 3. prior context を取得（失敗したら空として続行）
//! 4. handler を隔離して実行（panic / error / timeout → error レスポンス）
//! 5. generation_id の付与（まだ mapping がない場合のみ）
//! 6. 正規化 → append（保存失敗は handler の成功より優先）
//!
//! admission で拒否されたリクエストは store に一切触れません。

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::admission::{Admission, RequestContext};
use super::bridge::{BridgeOperation, ResilientBridge};
use super::handler::{DynHandler, HandlerContext, HandlerOutput};
use super::registry::HandlerRegistry;
use crate::domain::envelope::{CallerId, HandlerName, TaskEnvelope};
use crate::domain::errors::{GatewayError, Rejection};
use crate::domain::feedback::FeedbackSubmission;
use crate::domain::ids::{GenerationId, InteractionId};
use crate::domain::record::{FeedbackRecord, InteractionRecord};
use crate::domain::response::NormalizedResponse;
use crate::observability::RequestCounters;
use crate::ports::clock::{Clock, SystemClock};
use crate::ports::id_generator::{IdGenerator, UlidGenerator};
use crate::ports::retention_store::RetentionStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GatewayLimits {
    /// Prior interactions handed to a handler.
    pub context_limit: usize,
    pub history_page_size: usize,
    pub handler_timeout: Duration,
}

impl Default for GatewayLimits {
    fn default() -> Self {
        Self {
            context_limit: 3,
            history_page_size: 10,
            handler_timeout: Duration::from_secs(30),
        }
    }
}

/// Result of a stored feedback submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackReceipt {
    pub generation_id: GenerationId,
    pub interaction_id: InteractionId,
    /// Whether the content collaborator accepted the forwarded feedback.
    pub forwarded: bool,
}

pub struct Gateway {
    registry: HandlerRegistry,
    store: Arc<dyn RetentionStore>,
    admission: Admission,
    bridge: Option<Arc<ResilientBridge>>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    counters: Arc<RequestCounters>,
    limits: GatewayLimits,
}

impl Gateway {
    pub fn new(
        registry: HandlerRegistry,
        store: Arc<dyn RetentionStore>,
        admission: Admission,
        limits: GatewayLimits,
    ) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self {
            registry,
            store,
            admission,
            bridge: None,
            ids: Arc::new(UlidGenerator::new(clock.clone())),
            clock,
            counters: Arc::new(RequestCounters::new()),
            limits,
        }
    }

    pub fn with_bridge(mut self, bridge: Option<Arc<ResilientBridge>>) -> Self {
        self.bridge = bridge;
        self
    }

    /// Record timestamps and interaction ids both follow `clock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = Arc::new(UlidGenerator::new(clock.clone()));
        self.clock = clock;
        self
    }

    pub fn registered_handlers(&self) -> Vec<HandlerName> {
        self.registry.registered()
    }

    pub fn store(&self) -> &Arc<dyn RetentionStore> {
        &self.store
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    pub fn counters(&self) -> &Arc<RequestCounters> {
        &self.counters
    }

    /// Parse the wire envelope, then [`Gateway::handle`].
    pub async fn handle_value(
        &self,
        value: Value,
        ctx: &RequestContext,
    ) -> Result<NormalizedResponse, Rejection> {
        let envelope = TaskEnvelope::from_value(value).inspect_err(|rejection| {
            self.counters.rejected();
            tracing::warn!(error_type = rejection.code().as_str(), "request rejected");
        })?;
        self.handle(&envelope, ctx).await
    }

    pub async fn handle(
        &self,
        envelope: &TaskEnvelope,
        ctx: &RequestContext,
    ) -> Result<NormalizedResponse, Rejection> {
        let caller_id = envelope.caller_id();
        let handler_name = envelope.handler();
        let action = envelope.action();

        if let Err(rejection) = self.admission.admit(envelope, ctx).await {
            self.counters.rejected();
            tracing::warn!(
                caller_id = %caller_id,
                handler = %handler_name,
                action = %action,
                error_type = rejection.code().as_str(),
                "request rejected"
            );
            return Err(rejection);
        }
        self.counters.accepted();
        let started = Instant::now();

        let Some(handler) = self.registry.get(handler_name) else {
            let err = GatewayError::HandlerUnavailable(handler_name);
            tracing::warn!(caller_id = %caller_id, handler = %handler_name, "handler not registered");
            self.counters.failed();
            return Ok(NormalizedResponse::error(err.public_message()));
        };

        let prior = match self
            .store
            .history(caller_id, Some(handler_name), self.limits.context_limit)
            .await
        {
            Ok(prior) => prior,
            Err(e) => {
                tracing::warn!(caller_id = %caller_id, handler = %handler_name, error = %e, "prior context unavailable");
                Vec::new()
            }
        };
        let handler_ctx = HandlerContext {
            caller_id: caller_id.clone(),
            action,
            prior,
        };

        let (response, generation_id) =
            match self.invoke(handler.as_ref(), envelope.payload().clone(), &handler_ctx).await {
                Ok(output) => {
                    let response = NormalizedResponse::from_output(output.value);
                    let generation_id = match output.generation {
                        Some(id) if response.is_success() => self.unmapped(id).await,
                        _ => None,
                    };
                    (response, generation_id)
                }
                Err(err) => {
                    tracing::warn!(
                        caller_id = %caller_id,
                        handler = %handler_name,
                        action = %action,
                        error_type = err.code(),
                        error = %err,
                        "handler failed"
                    );
                    (NormalizedResponse::error(err.public_message()), None)
                }
            };

        let record = InteractionRecord {
            id: self.ids.generate_interaction_id(),
            caller_id: caller_id.clone(),
            handler: handler_name,
            action,
            timestamp: self.clock.now(),
            input_payload: envelope.payload().clone(),
            output_payload: response.clone(),
            generation_id,
        };
        if let Err(e) = self.store.append(record).await {
            let err = GatewayError::from(e);
            tracing::error!(
                caller_id = %caller_id,
                handler = %handler_name,
                error_type = err.code(),
                error = %err,
                "interaction could not be persisted"
            );
            self.counters.failed();
            return Ok(NormalizedResponse::error(err.public_message()));
        }

        if response.is_success() {
            self.counters.succeeded();
        } else {
            self.counters.failed();
        }
        tracing::info!(
            caller_id = %caller_id,
            handler = %handler_name,
            action = %action,
            status = ?response.status,
            latency_ms = started.elapsed().as_millis() as u64,
            "request handled"
        );
        Ok(response)
    }

    async fn invoke(
        &self,
        handler: &dyn DynHandler,
        payload: Value,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, GatewayError> {
        let call = AssertUnwindSafe(handler.handle_dyn(payload, ctx)).catch_unwind();
        match tokio::time::timeout(self.limits.handler_timeout, call).await {
            Err(_) => Err(GatewayError::handler(
                "handler timed out",
                format!("timed out after {} ms", self.limits.handler_timeout.as_millis()),
            )),
            Ok(Err(_panic)) => Err(GatewayError::handler("handler panicked", "handler panicked")),
            Ok(Ok(Err(e))) => Err(GatewayError::handler(e.public_message(), e.to_string())),
            Ok(Ok(Ok(output))) => Ok(output),
        }
    }

    /// `Some(id)` only when no record maps `id` yet.
    async fn unmapped(&self, id: GenerationId) -> Option<GenerationId> {
        match self.store.find_generation(id).await {
            Ok(None) => Some(id),
            Ok(Some(existing)) => {
                tracing::debug!(generation_id = %id, interaction_id = %existing.interaction_id, "generation already mapped");
                None
            }
            Err(e) => {
                tracing::warn!(generation_id = %id, error = %e, "generation lookup failed");
                None
            }
        }
    }

    /// Validate, correlate, forward and persist one feedback submission.
    pub async fn record_feedback(
        &self,
        submission: &FeedbackSubmission,
        ctx: &RequestContext,
    ) -> Result<FeedbackReceipt, GatewayError> {
        let feedback = submission.validate()?;
        self.admission
            .check_identity(&feedback.caller_id, ctx)
            .map_err(|r| GatewayError::Security(r.code()))?;

        let mapping = self
            .store
            .find_generation(feedback.generation_id)
            .await?
            .ok_or(GatewayError::UnknownGeneration(feedback.generation_id))?;

        let forwarded = match &self.bridge {
            Some(bridge) => {
                bridge
                    .call(
                        BridgeOperation::Feedback,
                        json!({
                            "generation_id": feedback.generation_id,
                            "command": feedback.command.as_str(),
                            "score": feedback.command.score(),
                            "caller_id": feedback.caller_id.as_str(),
                            "comment": feedback.comment,
                        }),
                    )
                    .await
                    .is_success()
            }
            None => false,
        };

        let record = FeedbackRecord {
            generation_id: feedback.generation_id,
            caller_id: feedback.caller_id.clone(),
            command: feedback.command,
            comment: feedback.comment.clone(),
            submitted_at: feedback.timestamp.unwrap_or_else(|| self.clock.now()),
            forwarded,
        };
        self.store.record_feedback(record).await?;

        tracing::info!(
            caller_id = %feedback.caller_id,
            generation_id = %feedback.generation_id,
            command = feedback.command.as_str(),
            forwarded,
            "feedback recorded"
        );
        Ok(FeedbackReceipt {
            generation_id: feedback.generation_id,
            interaction_id: mapping.interaction_id,
            forwarded,
        })
    }

    /// Most recent first, one page.
    pub async fn history(
        &self,
        caller_id: &CallerId,
        handler: Option<HandlerName>,
        ctx: &RequestContext,
    ) -> Result<Vec<InteractionRecord>, GatewayError> {
        self.admission
            .check_identity(caller_id, ctx)
            .map_err(|r| GatewayError::Security(r.code()))?;
        Ok(self
            .store
            .history(caller_id, handler, self.limits.history_page_size)
            .await?)
    }

    /// Recent interactions across all handlers for one caller.
    pub async fn context(&self, caller_id: &CallerId) -> Result<Vec<InteractionRecord>, GatewayError> {
        Ok(self.store.recent(caller_id, self.limits.context_limit).await?)
    }
}
