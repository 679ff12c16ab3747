use crate::resilience::admission::AdmissionSnapshot;
use crate::resilience::circuit_breaker::{CircuitBreakerSnapshot, CircuitState};
use crate::types::TargetKey;
use serde::Serialize;
use std::collections::BTreeMap;

/// A point-in-time snapshot of the pipeline's runtime "signals".
///
/// Facts only, no policy: a metrics collector or router can build on top of these.
/// Sections for disabled components are empty.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SignalsSnapshot {
    /// One entry per target seen so far, sorted by target.
    pub breakers: Vec<CircuitBreakerSnapshot>,
    /// A single entry for global admission, or one per target.
    pub admission: Vec<AdmissionSnapshot>,
    /// Entries waiting in open batch buckets, keyed by `"METHOD /route"`.
    pub batch_pending: BTreeMap<String, usize>,
    /// Attempts used -> calls resolved after that many attempts.
    pub retry_attempts: BTreeMap<u32, u64>,
}

impl SignalsSnapshot {
    pub fn breaker(&self, target: &TargetKey) -> Option<&CircuitBreakerSnapshot> {
        self.breakers.iter().find(|b| &b.target == target)
    }

    /// Targets whose breaker is not closed.
    pub fn tripped_targets(&self) -> Vec<&TargetKey> {
        self.breakers
            .iter()
            .filter(|b| b.state != CircuitState::Closed)
            .map(|b| &b.target)
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.admission.iter().map(|a| a.in_flight).sum()
    }

    pub fn queued(&self) -> usize {
        self.admission.iter().map(|a| a.queued).sum()
    }

    pub fn batch_pending_total(&self) -> usize {
        self.batch_pending.values().sum()
    }
}
