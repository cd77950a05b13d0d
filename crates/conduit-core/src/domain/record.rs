//! Persisted records: interaction, generation mapping, nonce, feedback.
//!
//! Interaction record は一度作ったら変更しません。generation mapping は record の
//! `generation_id` から導出され、record と同じ append / prune で増減します。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::envelope::{Action, CallerId, HandlerName};
use super::feedback::FeedbackCommand;
use super::ids::{GenerationId, InteractionId};
use super::response::NormalizedResponse;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InteractionRecord {
    pub id: InteractionId,
    pub caller_id: CallerId,
    pub handler: HandlerName,
    pub action: Action,
    pub timestamp: DateTime<Utc>,
    pub input_payload: serde_json::Value,
    pub output_payload: NormalizedResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation_id: Option<GenerationId>,
}

impl InteractionRecord {
    /// Mapping carried by this record, if the handler advertised a generation.
    pub fn generation_mapping(&self) -> Option<GenerationMapping> {
        self.generation_id.map(|generation_id| GenerationMapping {
            generation_id,
            caller_id: self.caller_id.clone(),
            interaction_id: self.id,
        })
    }

    /// Retention order: timestamp desc, then insertion (id) desc.
    pub fn newest_first(a: &Self, b: &Self) -> std::cmp::Ordering {
        b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationMapping {
    pub generation_id: GenerationId,
    pub caller_id: CallerId,
    pub interaction_id: InteractionId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceRecord {
    pub nonce: String,
    pub caller_id: CallerId,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub generation_id: GenerationId,
    pub caller_id: CallerId,
    pub command: FeedbackCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub forwarded: bool,
}
