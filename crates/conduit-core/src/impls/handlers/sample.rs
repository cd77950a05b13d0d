//! sample handler: text statistics.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::app::handler::{Handler, HandlerContext, HandlerError, HandlerOutput};
use crate::domain::envelope::HandlerName;

#[derive(Debug, Default, Deserialize)]
pub struct SamplePayload {
    #[serde(default)]
    pub input_text: Option<String>,
}

pub struct SampleHandler;

#[async_trait]
impl Handler for SampleHandler {
    const NAME: HandlerName = HandlerName::Sample;
    type Payload = SamplePayload;

    async fn process(
        &self,
        payload: SamplePayload,
        _ctx: &HandlerContext,
    ) -> Result<HandlerOutput, HandlerError> {
        let text = payload.input_text.unwrap_or_default();
        // 生の object を返す。result への包み込みは正規化に任せる
        Ok(HandlerOutput::new(json!({
            "word_count": text.split_whitespace().count(),
            "character_count": text.chars().count(),
            "line_count": text.lines().count(),
        })))
    }
}
