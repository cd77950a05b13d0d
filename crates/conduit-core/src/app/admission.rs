//! Admission - dispatch 前の検証ステージ
//!
//! identity header → rate limit → SecurityValidator の順に適用します。
//! ここで拒否されたリクエストは状態を一切変更しません（rate limit の窓を除く）。

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

use super::security::{SecurityContext, SecurityValidator};
use crate::domain::envelope::{CallerId, TaskEnvelope};
use crate::domain::errors::{Rejection, RejectionCode};

/// Transport-level metadata that accompanies an envelope.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    /// Caller identity asserted by the transport (e.g. an `X-Caller-Id` header).
    pub caller_header: Option<String>,
    pub security: Option<SecurityContext>,
}

impl RequestContext {
    pub fn for_caller(caller_id: &CallerId) -> Self {
        Self {
            caller_header: Some(caller_id.as_str().to_string()),
            security: None,
        }
    }

    pub fn with_security(mut self, security: SecurityContext) -> Self {
        self.security = Some(security);
        self
    }
}

/// 窓が空になった caller を掃除する間隔（check 回数）
const SWEEP_EVERY: u64 = 256;

/// Sliding one-minute window per caller.
pub struct RateLimiter {
    per_minute: usize,
    window: Duration,
    hits: DashMap<CallerId, VecDeque<Instant>>,
    checks: AtomicU64,
}

impl RateLimiter {
    pub fn per_minute(limit: u32) -> Self {
        Self {
            per_minute: limit.max(1) as usize,
            window: Duration::from_secs(60),
            hits: DashMap::new(),
            checks: AtomicU64::new(0),
        }
    }

    pub fn check(&self, caller_id: &CallerId) -> Result<(), Rejection> {
        let now = Instant::now();
        if self.checks.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.sweep(now);
        }
        let mut hits = self.hits.entry(caller_id.clone()).or_default();
        while let Some(front) = hits.front() {
            if now.duration_since(*front) >= self.window {
                hits.pop_front();
            } else {
                break;
            }
        }
        if hits.len() >= self.per_minute {
            return Err(Rejection::new(RejectionCode::RateLimited));
        }
        hits.push_back(now);
        Ok(())
    }

    /// Drop callers whose whole window has expired.
    pub fn sweep(&self, now: Instant) {
        self.hits
            .retain(|_, hits| hits.back().is_some_and(|last| now.duration_since(*last) < self.window));
    }

    pub fn tracked_callers(&self) -> usize {
        self.hits.len()
    }
}

pub struct Admission {
    require_caller_header: bool,
    rate_limiter: Option<RateLimiter>,
    validator: SecurityValidator,
}

impl Admission {
    pub fn new(
        require_caller_header: bool,
        rate_limiter: Option<RateLimiter>,
        validator: SecurityValidator,
    ) -> Self {
        Self {
            require_caller_header,
            rate_limiter,
            validator,
        }
    }

    pub fn validator(&self) -> &SecurityValidator {
        &self.validator
    }

    /// Identity header must be present (when required) and match `caller_id`.
    pub fn check_identity(&self, caller_id: &CallerId, ctx: &RequestContext) -> Result<(), Rejection> {
        match ctx.caller_header.as_deref() {
            None if self.require_caller_header => Err(Rejection::new(RejectionCode::MissingIdentity)),
            None => Ok(()),
            Some(header) if header == caller_id.as_str() => Ok(()),
            Some(_) => Err(Rejection::new(RejectionCode::IdentityMismatch)),
        }
    }

    pub async fn admit(&self, envelope: &TaskEnvelope, ctx: &RequestContext) -> Result<(), Rejection> {
        self.check_identity(envelope.caller_id(), ctx)?;
        if let Some(limiter) = &self.rate_limiter {
            limiter.check(envelope.caller_id())?;
        }
        self.validator.validate(envelope, ctx.security.as_ref()).await
    }
}
