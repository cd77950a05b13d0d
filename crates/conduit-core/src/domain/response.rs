//! NormalizedResponse - 全ての handler 出力をこの形に揃える
//!
//! `{ status, message, result }`。error のときの `result` は常に `{}` です。

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const RESERVED_KEYS: [&str; 3] = ["status", "message", "result"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub status: ResponseStatus,
    pub message: String,
    pub result: Value,
}

impl NormalizedResponse {
    pub fn success(message: impl Into<String>, result: Value) -> Self {
        Self {
            status: ResponseStatus::Success,
            message: message.into(),
            result,
        }
    }

    /// Error response. An empty message is replaced so callers always get a reason.
    pub fn error(message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.trim().is_empty() {
            message = "request failed".to_string();
        }
        Self {
            status: ResponseStatus::Error,
            message,
            result: Value::Object(Map::new()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// Normalize whatever a handler produced.
    ///
    /// - object with any of `status` / `message` / `result`: those keys are used
    ///   (`status` defaults to success, `message` to `""`); without `result` the
    ///   remaining keys become the result
    /// - plain object: the whole object is the result
    /// - anything else: wrapped as `{"value": v}`
    pub fn from_output(output: Value) -> Self {
        let mut map = match output {
            Value::Object(map) => map,
            other => {
                let mut wrapped = Map::new();
                wrapped.insert("value".to_string(), other);
                return Self::success("", Value::Object(wrapped));
            }
        };

        let status = match map.remove("status") {
            None => ResponseStatus::Success,
            Some(Value::String(s)) if s.eq_ignore_ascii_case("success") => ResponseStatus::Success,
            Some(_) => ResponseStatus::Error,
        };
        let message = match map.remove("message") {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => s,
            Some(other) => other.to_string(),
        };

        if status == ResponseStatus::Error {
            return Self::error(message);
        }

        let result = match map.remove("result") {
            Some(result) => result,
            None => {
                map.retain(|k, _| !RESERVED_KEYS.contains(&k.as_str()));
                Value::Object(map)
            }
        };
        Self::success(message, result)
    }

    pub fn to_value(&self) -> Value {
        serde_json::json!({
            "status": self.status,
            "message": self.message,
            "result": self.result,
        })
    }
}
