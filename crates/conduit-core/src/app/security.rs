//! SecurityValidator - 署名 / timestamp / nonce の検証
//!
//! # 検証順
//! 1. signature: Ed25519、canonical bytes に対して検証
//! 2. freshness: `|now - timestamp| <= drift`
//! 3. replay: (caller, nonce) を NonceStore に claim。既出なら拒否
//!
//! 無効化されている場合は I/O なしで受理します。
//! canonical bytes は `{action, caller_id, handler, nonce, payload, timestamp}` を
//! key でソートした compact JSON（UTF-8）です。

use chrono::Duration;
use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;

use crate::domain::envelope::{CallerId, TaskEnvelope};
use crate::domain::errors::{Rejection, RejectionCode};
use crate::domain::record::NonceRecord;
use crate::ports::clock::Clock;
use crate::ports::nonce_store::{NonceClaim, NonceStore};

const MAX_NONCE_LEN: usize = 128;

/// Signature material that travels next to the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    /// Hex-encoded Ed25519 signature (64 bytes).
    pub signature: String,
    /// Unix seconds.
    pub timestamp: i64,
    pub nonce: String,
    /// Hex-encoded Ed25519 public key (32 bytes).
    pub public_key: String,
}

#[derive(Debug, Clone)]
pub struct SecurityPolicy {
    pub enabled: bool,
    pub drift: Duration,
    /// Pinned public key per caller. Callers not listed may use any key.
    pub trusted_keys: HashMap<CallerId, [u8; 32]>,
}

impl SecurityPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            drift: Duration::seconds(300),
            trusted_keys: HashMap::new(),
        }
    }
}

pub struct SecurityValidator {
    policy: SecurityPolicy,
    nonces: Arc<dyn NonceStore>,
    clock: Arc<dyn Clock>,
}

impl SecurityValidator {
    pub fn new(policy: SecurityPolicy, nonces: Arc<dyn NonceStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            policy,
            nonces,
            clock,
        }
    }

    pub fn enabled(&self) -> bool {
        self.policy.enabled
    }

    pub fn drift(&self) -> Duration {
        self.policy.drift
    }

    pub async fn validate(
        &self,
        envelope: &TaskEnvelope,
        context: Option<&SecurityContext>,
    ) -> Result<(), Rejection> {
        if !self.policy.enabled {
            return Ok(());
        }
        let Some(ctx) = context else {
            return Err(Rejection::with_detail(
                RejectionCode::InvalidSignature,
                "signature material is missing",
            ));
        };

        self.verify_signature(envelope, ctx)?;

        let now = self.clock.now();
        let drift = self.policy.drift.num_seconds().unsigned_abs();
        // 極端な timestamp は差分が i64 に収まらないので stale 扱い
        let skew = now.timestamp().checked_sub(ctx.timestamp).map(i64::unsigned_abs);
        if skew.is_none_or(|s| s > drift) {
            return Err(Rejection::new(RejectionCode::StaleTimestamp));
        }

        if ctx.nonce.is_empty() || ctx.nonce.len() > MAX_NONCE_LEN {
            return Err(Rejection::with_detail(
                RejectionCode::MalformedInput,
                "nonce must be 1..=128 bytes",
            ));
        }
        let Some(timestamp) = chrono::DateTime::from_timestamp(ctx.timestamp, 0) else {
            return Err(Rejection::new(RejectionCode::StaleTimestamp));
        };
        let record = NonceRecord {
            nonce: ctx.nonce.clone(),
            caller_id: envelope.caller_id().clone(),
            timestamp,
        };
        match self.nonces.claim(record, now - self.policy.drift).await {
            Ok(NonceClaim::Fresh) => Ok(()),
            Ok(NonceClaim::Replayed) => Err(Rejection::new(RejectionCode::ReplayDetected)),
            Err(e) => {
                // nonce を確認できない場合は受理しない
                tracing::error!(caller_id = %envelope.caller_id(), error = %e, "nonce store unavailable");
                Err(Rejection::with_detail(
                    RejectionCode::ReplayDetected,
                    "nonce could not be verified",
                ))
            }
        }
    }

    fn verify_signature(&self, envelope: &TaskEnvelope, ctx: &SecurityContext) -> Result<(), Rejection> {
        let invalid = || Rejection::new(RejectionCode::InvalidSignature);

        let key_bytes: [u8; 32] = hex::decode(&ctx.public_key)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(invalid)?;
        if let Some(pinned) = self.policy.trusted_keys.get(envelope.caller_id())
            && *pinned != key_bytes
        {
            return Err(invalid());
        }
        let key = VerifyingKey::from_bytes(&key_bytes).map_err(|_| invalid())?;

        let sig_bytes = hex::decode(&ctx.signature).map_err(|_| invalid())?;
        let signature = Signature::from_slice(&sig_bytes).map_err(|_| invalid())?;

        let message = canonical_bytes(envelope, ctx.timestamp, &ctx.nonce);
        key.verify(&message, &signature).map_err(|_| invalid())
    }
}

/// Bytes that are signed for one request.
pub fn canonical_bytes(envelope: &TaskEnvelope, timestamp: i64, nonce: &str) -> Vec<u8> {
    let doc = json!({
        "action": envelope.action().as_str(),
        "caller_id": envelope.caller_id().as_str(),
        "handler": envelope.handler().as_str(),
        "nonce": nonce,
        "payload": sorted(envelope.payload()),
        "timestamp": timestamp,
    });
    // serde_json::to_vec on a Value cannot fail
    serde_json::to_vec(&sorted(&doc)).unwrap_or_default()
}

fn sorted(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for k in keys {
                out.insert(k.clone(), sorted(&map[k]));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sorted).collect()),
        other => other.clone(),
    }
}

/// Produce the security context a client would send for `envelope`.
pub fn sign_envelope(
    key: &SigningKey,
    envelope: &TaskEnvelope,
    timestamp: i64,
    nonce: impl Into<String>,
) -> SecurityContext {
    let nonce = nonce.into();
    let signature = key.sign(&canonical_bytes(envelope, timestamp, &nonce));
    SecurityContext {
        signature: hex::encode(signature.to_bytes()),
        timestamp,
        nonce,
        public_key: hex::encode(key.verifying_key().to_bytes()),
    }
}
