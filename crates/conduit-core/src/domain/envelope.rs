//! TaskEnvelope - 受信したリクエストの運搬用データ
//!
//! handler / action は閉じた enum で、dispatch の前に必ず検証されます。

use serde::{Deserialize, Serialize};
use std::fmt;

use super::errors::{Rejection, RejectionCode};

const CALLER_ID_MAX_LEN: usize = 64;

/// Named unit of domain logic the gateway can route to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerName {
    Finance,
    Education,
    Creator,
    #[serde(alias = "sample_text")]
    Sample,
    Math,
    Video,
}

impl HandlerName {
    pub const ALL: [HandlerName; 6] = [
        Self::Finance,
        Self::Education,
        Self::Creator,
        Self::Sample,
        Self::Math,
        Self::Video,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Finance => "finance",
            Self::Education => "education",
            Self::Creator => "creator",
            Self::Sample => "sample",
            Self::Math => "math",
            Self::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sample_text" => Some(Self::Sample),
            _ => Self::ALL.into_iter().find(|h| h.as_str() == s),
        }
    }
}

impl fmt::Display for HandlerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Generate,
    Analyze,
    Review,
    GetStatus,
    ListVideos,
    Feedback,
    History,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Analyze => "analyze",
            Self::Review => "review",
            Self::GetStatus => "get_status",
            Self::ListVideos => "list_videos",
            Self::Feedback => "feedback",
            Self::History => "history",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        serde_json::from_value(serde_json::Value::String(s.to_string())).ok()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque caller identifier: 1..=64 characters of `[A-Za-z0-9_-]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CallerId(String);

impl CallerId {
    pub fn new(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        if value.is_empty() {
            return Err("caller_id must not be empty".to_string());
        }
        if value.len() > CALLER_ID_MAX_LEN {
            return Err(format!("caller_id longer than {CALLER_ID_MAX_LEN} characters"));
        }
        if !value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err("caller_id contains unsupported characters".to_string());
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for CallerId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<CallerId> for String {
    fn from(id: CallerId) -> Self {
        id.0
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// handler + action + caller + payload. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskEnvelope {
    handler: HandlerName,
    action: Action,
    caller_id: CallerId,
    #[serde(default = "empty_object")]
    payload: serde_json::Value,
}

fn empty_object() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl TaskEnvelope {
    /// Build an envelope; the payload must be a JSON object.
    pub fn new(
        handler: HandlerName,
        action: Action,
        caller_id: CallerId,
        payload: serde_json::Value,
    ) -> Result<Self, Rejection> {
        if !payload.is_object() {
            return Err(Rejection::with_detail(
                RejectionCode::MalformedInput,
                "payload must be an object",
            ));
        }
        Ok(Self {
            handler,
            action,
            caller_id,
            payload,
        })
    }

    /// Parse the wire shape `{handler, action, caller_id, payload}`.
    pub fn from_value(value: serde_json::Value) -> Result<Self, Rejection> {
        let envelope: TaskEnvelope = serde_json::from_value(value)
            .map_err(|e| Rejection::with_detail(RejectionCode::MalformedInput, e.to_string()))?;
        if !envelope.payload.is_object() {
            return Err(Rejection::with_detail(
                RejectionCode::MalformedInput,
                "payload must be an object",
            ));
        }
        Ok(envelope)
    }

    pub fn handler(&self) -> HandlerName {
        self.handler
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn caller_id(&self) -> &CallerId {
        &self.caller_id
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }
}
