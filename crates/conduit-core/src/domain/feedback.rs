//! Feedback submission and its validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::envelope::CallerId;
use super::errors::GatewayError;
use super::ids::GenerationId;

pub const MAX_COMMENT_CHARS: usize = 500;

/// Rating attached to a generation: `-1`, `0`, `+1` or `+2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FeedbackCommand {
    Down,
    Neutral,
    Up,
    Strong,
}

impl FeedbackCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Down => "-1",
            Self::Neutral => "0",
            Self::Up => "+1",
            Self::Strong => "+2",
        }
    }

    pub fn score(&self) -> i8 {
        match self {
            Self::Down => -1,
            Self::Neutral => 0,
            Self::Up => 1,
            Self::Strong => 2,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "-1" => Some(Self::Down),
            "0" | "+0" => Some(Self::Neutral),
            "+1" | "1" => Some(Self::Up),
            "+2" | "2" => Some(Self::Strong),
            _ => None,
        }
    }
}

impl TryFrom<String> for FeedbackCommand {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value).ok_or_else(|| format!("unsupported feedback command '{value}'"))
    }
}

impl From<FeedbackCommand> for String {
    fn from(c: FeedbackCommand) -> Self {
        c.as_str().to_string()
    }
}

impl fmt::Display for FeedbackCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw submission as received on the wire. `validate()` turns it into a
/// [`ValidFeedback`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackSubmission {
    pub generation_id: i64,
    pub command: String,
    pub caller_id: String,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidFeedback {
    pub generation_id: GenerationId,
    pub command: FeedbackCommand,
    pub caller_id: CallerId,
    pub comment: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl FeedbackSubmission {
    pub fn validate(&self) -> Result<ValidFeedback, GatewayError> {
        let generation_id = u64::try_from(self.generation_id)
            .ok()
            .and_then(GenerationId::new)
            .ok_or_else(|| {
                GatewayError::Validation("generation_id must be greater than zero".to_string())
            })?;

        let command = FeedbackCommand::parse(&self.command).ok_or_else(|| {
            GatewayError::Validation(format!("unsupported feedback command '{}'", self.command))
        })?;

        let caller_id = CallerId::new(self.caller_id.clone()).map_err(GatewayError::Validation)?;

        if let Some(comment) = &self.comment
            && comment.chars().count() > MAX_COMMENT_CHARS
        {
            return Err(GatewayError::Validation(format!(
                "comment longer than {MAX_COMMENT_CHARS} characters"
            )));
        }

        let timestamp = match &self.timestamp {
            None => None,
            Some(raw) => Some(
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|_| {
                        GatewayError::Validation("timestamp must be ISO 8601".to_string())
                    })?,
            ),
        };

        Ok(ValidFeedback {
            generation_id,
            command,
            caller_id,
            comment: self.comment.clone().filter(|c| !c.is_empty()),
            timestamp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn submission(generation_id: i64, command: &str) -> FeedbackSubmission {
        FeedbackSubmission {
            generation_id,
            command: command.to_string(),
            caller_id: "u1".to_string(),
            comment: None,
            timestamp: None,
        }
    }

    #[rstest]
    #[case("-1", FeedbackCommand::Down)]
    #[case("0", FeedbackCommand::Neutral)]
    #[case("+1", FeedbackCommand::Up)]
    #[case("+2", FeedbackCommand::Strong)]
    fn accepts_known_commands(#[case] raw: &str, #[case] expected: FeedbackCommand) {
        let v = submission(3, raw).validate().unwrap();
        assert_eq!(v.command, expected);
        assert_eq!(v.generation_id.get(), 3);
    }

    #[rstest]
    #[case(0, "+1")]
    #[case(-4, "+1")]
    #[case(3, "+5")]
    #[case(3, "like")]
    fn rejects_invalid_submissions(#[case] id: i64, #[case] command: &str) {
        let err = submission(id, command).validate().unwrap_err();
        assert_eq!(err.code(), "invalid_input");
    }

    #[test]
    fn comment_is_bounded() {
        let mut s = submission(1, "+1");
        s.comment = Some("x".repeat(MAX_COMMENT_CHARS));
        assert!(s.validate().is_ok());
        s.comment = Some("x".repeat(MAX_COMMENT_CHARS + 1));
        assert!(s.validate().is_err());
    }

    #[test]
    fn timestamp_must_be_iso8601() {
        let mut s = submission(1, "0");
        s.timestamp = Some("2024-05-01T10:00:00Z".to_string());
        assert!(s.validate().unwrap().timestamp.is_some());
        s.timestamp = Some("yesterday".to_string());
        assert!(s.validate().is_err());
    }
}
