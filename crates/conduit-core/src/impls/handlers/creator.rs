//! creator handler: content generation through the content collaborator.
//!
//! - `generate`: bridge の `generate` を呼ぶ。fallback でない応答が generation_id を
//!   返したときだけ、その ID を出力に載せる
//! - `history`: 直近の interaction（prior context）を返す

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

use crate::app::bridge::{BridgeOperation, ResilientBridge};
use crate::app::handler::{Handler, HandlerContext, HandlerError, HandlerOutput};
use crate::domain::envelope::{Action, HandlerName};
use crate::domain::ids::GenerationId;

#[derive(Debug, Default, Deserialize)]
pub struct CreatorPayload {
    #[serde(default)]
    pub prompt: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub goal: Option<String>,
}

pub struct CreatorHandler {
    bridge: Option<Arc<ResilientBridge>>,
}

impl CreatorHandler {
    pub fn new(bridge: Option<Arc<ResilientBridge>>) -> Self {
        Self { bridge }
    }

    async fn generate(
        &self,
        payload: CreatorPayload,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        let prompt = payload
            .prompt
            .or(payload.topic.clone())
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| HandlerError::InvalidPayload("prompt or topic is required".to_string()))?;
        let Some(bridge) = &self.bridge else {
            return Err(HandlerError::Failed(
                "content collaborator is not configured".to_string(),
            ));
        };

        let response = bridge
            .call(
                BridgeOperation::Generate,
                json!({
                    "prompt": prompt,
                    "topic": payload.topic,
                    "goal": payload.goal,
                    "caller_id": ctx.caller_id.as_str(),
                }),
            )
            .await;

        if !response.is_success() {
            return Ok(HandlerOutput::new(json!({
                "status": "error",
                "message": response.message,
            })));
        }

        let generation = generation_id(&response.result);
        Ok(HandlerOutput::new(json!({
            "status": "success",
            "message": response.message,
            "result": response.result,
        }))
        .with_generation(generation))
    }

    fn history(&self, ctx: &HandlerContext) -> HandlerOutput {
        let items: Vec<Value> = ctx
            .prior
            .iter()
            .map(|r| {
                json!({
                    "interaction_id": r.id.to_string(),
                    "action": r.action,
                    "timestamp": r.timestamp.to_rfc3339(),
                    "status": r.output_payload.status,
                    "generation_id": r.generation_id,
                })
            })
            .collect();
        HandlerOutput::new(json!({
            "status": "success",
            "message": format!("{} recent interactions", items.len()),
            "result": { "history": items },
        }))
    }
}

/// `generation_id` (or `id`) from a collaborator result, when it is a positive integer.
fn generation_id(result: &Value) -> Option<GenerationId> {
    ["generation_id", "id"]
        .iter()
        .find_map(|key| result.get(*key))
        .and_then(|v| match v {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        })
        .and_then(GenerationId::new)
}

#[async_trait]
impl Handler for CreatorHandler {
    const NAME: HandlerName = HandlerName::Creator;
    type Payload = CreatorPayload;

    async fn process(
        &self,
        payload: CreatorPayload,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        match ctx.action {
            Action::Generate => self.generate(payload, ctx).await,
            Action::History => Ok(self.history(ctx)),
            other => Err(HandlerError::UnsupportedAction(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::bridge::BridgeSettings;
    use crate::ports::http::{HttpReply, TransportError};
    use crate::testing::{ScriptedTransport, caller, record_at};
    use chrono::Utc;

    fn handler(replies: Vec<Result<HttpReply, TransportError>>) -> CreatorHandler {
        let transport = Arc::new(ScriptedTransport::new(replies));
        let bridge = ResilientBridge::new(BridgeSettings::new("content", "http://c.test"), transport);
        CreatorHandler::new(Some(Arc::new(bridge)))
    }

    fn ctx(action: Action) -> HandlerContext {
        HandlerContext {
            caller_id: caller("u1"),
            action,
            prior: Vec::new(),
        }
    }

    fn payload(topic: &str) -> CreatorPayload {
        CreatorPayload {
            topic: Some(topic.to_string()),
            ..CreatorPayload::default()
        }
    }

    #[tokio::test]
    async fn generation_id_is_taken_from_a_real_response() {
        let h = handler(vec![Ok(HttpReply {
            status: 200,
            body: r#"{"generation_id": 41, "text": "hello"}"#.to_string(),
        })]);
        let out = h.process(payload("ai"), &ctx(Action::Generate)).await.unwrap();
        assert_eq!(out.generation, GenerationId::new(41));
        assert_eq!(out.value["result"]["text"], "hello");
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_never_produces_a_generation() {
        let h = handler(vec![Ok(HttpReply {
            status: 400,
            body: r#"{"generation_id": 41}"#.to_string(),
        })]);
        let out = h.process(payload("ai"), &ctx(Action::Generate)).await.unwrap();
        assert!(out.generation.is_none());
        assert_eq!(out.value["status"], "error");
    }

    #[tokio::test]
    async fn history_returns_prior_context() {
        let h = CreatorHandler::new(None);
        let mut c = ctx(Action::History);
        c.prior = vec![record_at("u1", HandlerName::Creator, Utc::now())];
        let out = h.process(CreatorPayload::default(), &c).await.unwrap();
        assert_eq!(out.value["result"]["history"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn generate_without_collaborator_fails() {
        let err = CreatorHandler::new(None)
            .process(payload("ai"), &ctx(Action::Generate))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Failed(_)));
    }

    #[tokio::test]
    async fn unsupported_actions_are_reported() {
        let err = CreatorHandler::new(None)
            .process(payload("ai"), &ctx(Action::ListVideos))
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::UnsupportedAction(Action::ListVideos)));
    }
}
