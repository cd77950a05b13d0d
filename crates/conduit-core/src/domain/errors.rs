//! Errors - エラー型と分類
//!
//! `GatewayError` は kernel 内部を流れるエラー、`Rejection` は dispatch 前に
//! 短絡される外部向けの拒否（validation / security）です。

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use super::envelope::HandlerName;
use super::ids::GenerationId;

/// ErrorKind は実行エラーの分類
///
/// - Validation: 入力不正（呼び出し側で修正可能、終端）
/// - Security: 署名・時刻・リプレイ（終端、リトライしない）
/// - Handler: handler 内部の失敗（正規化されたレスポンスに吸収）
/// - Bridge: 外部 collaborator の失敗（fallback に吸収）
/// - Storage: retention backend の失敗（そのリクエストにとって致命的）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Security,
    Handler,
    Bridge,
    Storage,
}

/// Classification attached to every bridge fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BridgeErrorKind {
    Network,
    Schema,
    Unexpected,
}

impl BridgeErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Schema => "schema",
            Self::Unexpected => "unexpected",
        }
    }
}

impl fmt::Display for BridgeErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid input: {0}")]
    Validation(String),

    #[error("security check failed: {0}")]
    Security(RejectionCode),

    /// `public` is returned to callers, `detail` only goes to logs.
    #[error("handler failed: {detail}")]
    Handler { public: &'static str, detail: String },

    #[error("handler not available: {0}")]
    HandlerUnavailable(HandlerName),

    #[error("collaborator call failed ({kind}): {message}")]
    Bridge {
        kind: BridgeErrorKind,
        message: String,
    },

    #[error("storage failure: {0}")]
    Storage(String),

    #[error("unknown generation_id: {0}")]
    UnknownGeneration(GenerationId),
}

impl GatewayError {
    pub fn storage(err: impl fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::UnknownGeneration(_) | Self::HandlerUnavailable(_) => {
                ErrorKind::Validation
            }
            Self::Security(_) => ErrorKind::Security,
            Self::Handler { .. } => ErrorKind::Handler,
            Self::Bridge { .. } => ErrorKind::Bridge,
            Self::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Stable externally-visible code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "invalid_input",
            Self::Security(code) => code.as_str(),
            Self::Handler { .. } => "handler_error",
            Self::HandlerUnavailable(_) => "handler_unavailable",
            Self::Bridge { .. } => "collaborator_unavailable",
            Self::Storage(_) => "storage_unavailable",
            Self::UnknownGeneration(_) => "unknown_generation",
        }
    }

    pub fn handler(public: &'static str, detail: impl Into<String>) -> Self {
        Self::Handler {
            public,
            detail: detail.into(),
        }
    }

    /// Message safe to return to callers. Storage, bridge and handler details stay in logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Storage(_) => "interaction could not be persisted".to_string(),
            Self::Handler { public, .. } => (*public).to_string(),
            Self::Bridge { kind, .. } => format!("collaborator unavailable ({kind})"),
            other => other.to_string(),
        }
    }
}

/// Stable rejection causes for requests short-circuited before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionCode {
    MalformedInput,
    MissingIdentity,
    IdentityMismatch,
    InvalidSignature,
    StaleTimestamp,
    ReplayDetected,
    RateLimited,
}

impl RejectionCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedInput => "malformed_input",
            Self::MissingIdentity => "missing_identity",
            Self::IdentityMismatch => "identity_mismatch",
            Self::InvalidSignature => "invalid_signature",
            Self::StaleTimestamp => "stale_timestamp",
            Self::ReplayDetected => "replay_detected",
            Self::RateLimited => "rate_limited",
        }
    }

    /// Status an HTTP front end should use for this rejection.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::MalformedInput => 400,
            Self::MissingIdentity | Self::InvalidSignature | Self::StaleTimestamp => 401,
            Self::IdentityMismatch => 403,
            Self::ReplayDetected => 409,
            Self::RateLimited => 429,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedInput | Self::MissingIdentity | Self::IdentityMismatch => {
                ErrorKind::Validation
            }
            Self::InvalidSignature
            | Self::StaleTimestamp
            | Self::ReplayDetected
            | Self::RateLimited => ErrorKind::Security,
        }
    }

    fn default_message(&self) -> &'static str {
        match self {
            Self::MalformedInput => "request envelope is malformed",
            Self::MissingIdentity => "caller identity is required",
            Self::IdentityMismatch => "caller identity does not match envelope",
            Self::InvalidSignature => "request signature is invalid",
            Self::StaleTimestamp => "request timestamp is outside the allowed window",
            Self::ReplayDetected => "request nonce was already used",
            Self::RateLimited => "rate limit exceeded",
        }
    }
}

impl fmt::Display for RejectionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejection envelope: `{ "error": code, "message": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{error}: {message}")]
pub struct Rejection {
    pub error: RejectionCode,
    pub message: String,
}

impl Rejection {
    pub fn new(code: RejectionCode) -> Self {
        Self {
            error: code,
            message: code.default_message().to_string(),
        }
    }

    pub fn with_detail(code: RejectionCode, detail: impl Into<String>) -> Self {
        Self {
            error: code,
            message: format!("{}: {}", code.default_message(), detail.into()),
        }
    }

    pub fn code(&self) -> RejectionCode {
        self.error
    }
}

impl From<RejectionCode> for Rejection {
    fn from(code: RejectionCode) -> Self {
        Self::new(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(RejectionCode::MalformedInput, "malformed_input", 400)]
    #[case(RejectionCode::MissingIdentity, "missing_identity", 401)]
    #[case(RejectionCode::IdentityMismatch, "identity_mismatch", 403)]
    #[case(RejectionCode::InvalidSignature, "invalid_signature", 401)]
    #[case(RejectionCode::StaleTimestamp, "stale_timestamp", 401)]
    #[case(RejectionCode::ReplayDetected, "replay_detected", 409)]
    #[case(RejectionCode::RateLimited, "rate_limited", 429)]
    fn rejection_codes_are_stable(
        #[case] code: RejectionCode,
        #[case] name: &str,
        #[case] status: u16,
    ) {
        assert_eq!(code.as_str(), name);
        assert_eq!(code.http_status(), status);
        let v = serde_json::to_value(Rejection::new(code)).unwrap();
        assert_eq!(v["error"], name);
        assert!(!v["message"].as_str().unwrap().is_empty());
    }

    #[test]
    fn storage_errors_hide_details_from_callers() {
        let err = GatewayError::storage("disk I/O error at /var/lib/conduit/context.db");
        assert_eq!(err.kind(), ErrorKind::Storage);
        assert_eq!(err.code(), "storage_unavailable");
        assert!(!err.public_message().contains("/var/lib"));
    }

    #[test]
    fn handler_errors_expose_only_the_stable_message() {
        let err = GatewayError::handler(
            "payload was rejected by the handler",
            "invalid payload: missing field `numbers` at line 1 column 2",
        );
        assert_eq!(err.code(), "handler_error");
        assert_eq!(err.public_message(), "payload was rejected by the handler");
        assert!(err.to_string().contains("missing field"));
    }
}
