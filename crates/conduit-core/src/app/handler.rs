//! Handler trait - handler の定義と型消去
//!
//! # 構成
//! - `Handler`: payload 型を持つ trait（`type Payload`）
//! - `DynHandler`: object-safe 版。registry に `Arc<dyn DynHandler>` で格納
//! - `TypedHandler<H>`: JSON payload を `H::Payload` に decode して `H` に渡す

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::domain::envelope::{Action, CallerId, HandlerName};
use crate::domain::ids::GenerationId;
use crate::domain::record::InteractionRecord;

/// Handler に渡す実行時コンテキスト
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub caller_id: CallerId,
    pub action: Action,
    /// Most recent interactions with this handler, newest first.
    pub prior: Vec<InteractionRecord>,
}

/// Handler の出力
///
/// `generation` は外部 collaborator が新しい generation を採番したときだけ設定します。
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput {
    pub value: serde_json::Value,
    pub generation: Option<GenerationId>,
}

impl HandlerOutput {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            generation: None,
        }
    }

    pub fn with_generation(mut self, generation: Option<GenerationId>) -> Self {
        self.generation = generation;
        self
    }
}

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("action '{0}' is not supported by this handler")]
    UnsupportedAction(Action),

    #[error("{0}")]
    Failed(String),
}

impl HandlerError {
    /// Caller-facing text without decode or backend details.
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidPayload(_) => "payload was rejected by the handler",
            Self::UnsupportedAction(_) => "action is not supported by this handler",
            Self::Failed(_) => "handler could not complete the request",
        }
    }
}

/// # 使用例
/// ```ignore
/// struct Echo;
///
/// #[async_trait]
/// impl Handler for Echo {
///     const NAME: HandlerName = HandlerName::Sample;
///     type Payload = serde_json::Value;
///
///     async fn process(&self, p: Self::Payload, _ctx: &HandlerContext) -> Result<HandlerOutput, HandlerError> {
///         Ok(HandlerOutput::new(p))
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    const NAME: HandlerName;
    type Payload: DeserializeOwned + Send + 'static;

    async fn process(
        &self,
        payload: Self::Payload,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError>;
}

#[async_trait]
pub trait DynHandler: Send + Sync {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError>;

    fn name(&self) -> HandlerName;
}

pub struct TypedHandler<H: Handler> {
    handler: H,
}

impl<H: Handler> TypedHandler<H> {
    pub fn new(handler: H) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl<H: Handler> DynHandler for TypedHandler<H> {
    async fn handle_dyn(
        &self,
        payload: serde_json::Value,
        ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        let payload: H::Payload = serde_json::from_value(payload)
            .map_err(|e| HandlerError::InvalidPayload(e.to_string()))?;
        self.handler.process(payload, ctx).await
    }

    fn name(&self) -> HandlerName {
        H::NAME
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::caller;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Deserialize)]
    struct Numbers {
        values: Vec<i64>,
    }

    struct Sum;

    #[async_trait]
    impl Handler for Sum {
        const NAME: HandlerName = HandlerName::Math;
        type Payload = Numbers;

        async fn process(
            &self,
            payload: Numbers,
            _ctx: &HandlerContext,
        ) -> Result<HandlerOutput, HandlerError> {
            Ok(HandlerOutput::new(json!({"sum": payload.values.iter().sum::<i64>()})))
        }
    }

    fn ctx() -> HandlerContext {
        HandlerContext {
            caller_id: caller("u1"),
            action: Action::Analyze,
            prior: Vec::new(),
        }
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let h = TypedHandler::new(Sum);
        let out = h.handle_dyn(json!({"values": [1, 2, 3]}), &ctx()).await.unwrap();
        assert_eq!(out.value, json!({"sum": 6}));
        assert_eq!(h.name(), HandlerName::Math);
    }

    #[tokio::test]
    async fn undecodable_payload_is_a_handler_error() {
        let h = TypedHandler::new(Sum);
        let err = h.handle_dyn(json!({"values": "x"}), &ctx()).await.unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload(_)));
    }
}
