//! ReadinessAggregator - 依存先の状態をまとめる
//!
//! 呼ばれるたびに再計算します（キャッシュするのは collaborator の health probe だけ）。
//! ready = backend probe が通る && 有効な collaborator がすべて healthy か degraded_ok。

use serde::Serialize;
use std::sync::Arc;

use super::bridge::{HealthProbe, ResilientBridge};
use super::gateway::Gateway;
use crate::domain::envelope::HandlerName;
use crate::observability::CounterSnapshot;
use crate::ports::retention_store::{BackendKind, RetentionGuarantee, StoreStats};

const STORAGE_COMPONENT: &str = "storage";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Readiness {
    pub ready: bool,
    pub reason: String,
    /// Passing checks / total checks.
    pub score: f64,
    pub failing_components: Vec<String>,
    pub degraded_components: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollaboratorHealth {
    pub name: String,
    #[serde(flatten)]
    pub probe: HealthProbe,
    pub degraded_ok: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SecurityFlags {
    pub enabled: bool,
    pub drift_seconds: i64,
}

/// Operator view. Carries no keys, credentials or filesystem paths.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostics {
    pub readiness: Readiness,
    pub backend: BackendKind,
    pub retention: RetentionGuarantee,
    pub collaborators: Vec<CollaboratorHealth>,
    pub handlers: Vec<HandlerName>,
    pub stats: Option<StoreStats>,
    pub requests: CounterSnapshot,
    pub security: SecurityFlags,
}

pub struct ReadinessAggregator {
    gateway: Arc<Gateway>,
    collaborators: Vec<Arc<ResilientBridge>>,
}

impl ReadinessAggregator {
    pub fn new(gateway: Arc<Gateway>, collaborators: Vec<Arc<ResilientBridge>>) -> Self {
        Self {
            gateway,
            collaborators,
        }
    }

    async fn collaborator_health(&self) -> Vec<CollaboratorHealth> {
        let probes = futures::future::join_all(self.collaborators.iter().map(|b| b.health_probe())).await;
        self.collaborators
            .iter()
            .zip(probes)
            .map(|(bridge, probe)| CollaboratorHealth {
                name: bridge.name().to_string(),
                probe,
                degraded_ok: bridge.degraded_ok(),
            })
            .collect()
    }

    async fn evaluate(&self, collaborators: &[CollaboratorHealth]) -> Readiness {
        let mut failing = Vec::new();
        let mut degraded = Vec::new();
        let mut passed = 0usize;
        let total = 1 + collaborators.len();

        match self.gateway.store().probe().await {
            Ok(()) => passed += 1,
            Err(e) => {
                tracing::warn!(dependency = STORAGE_COMPONENT, error = %e, "readiness check failed");
                failing.push(STORAGE_COMPONENT.to_string());
            }
        }
        for c in collaborators {
            if c.probe.healthy {
                passed += 1;
            } else if c.degraded_ok {
                degraded.push(c.name.clone());
            } else {
                tracing::warn!(dependency = %c.name, "readiness check failed");
                failing.push(c.name.clone());
            }
        }

        let reason = if !failing.is_empty() {
            failing.join(";")
        } else if !degraded.is_empty() {
            format!("degraded:{}", degraded.join(";"))
        } else {
            "all_checks_passed".to_string()
        };
        Readiness {
            ready: failing.is_empty(),
            reason,
            score: score(passed, total),
            failing_components: failing,
            degraded_components: degraded,
        }
    }

    pub async fn readiness(&self) -> Readiness {
        let collaborators = self.collaborator_health().await;
        self.evaluate(&collaborators).await
    }

    pub async fn diagnostics(&self) -> Diagnostics {
        let collaborators = self.collaborator_health().await;
        let readiness = self.evaluate(&collaborators).await;
        let store = self.gateway.store();
        let stats = match store.stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                tracing::warn!(error = %e, "store stats unavailable");
                None
            }
        };
        let validator = self.gateway.admission().validator();

        Diagnostics {
            readiness,
            backend: store.kind(),
            retention: store.retention(),
            collaborators,
            handlers: self.gateway.registered_handlers(),
            stats,
            requests: self.gateway.counters().snapshot(),
            security: SecurityFlags {
                enabled: validator.enabled(),
                drift_seconds: validator.drift().num_seconds(),
            },
        }
    }
}

fn score(passed: usize, total: usize) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (passed as f64 / total as f64 * 1000.0).round() / 1000.0
}
