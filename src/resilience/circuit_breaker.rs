use crate::error::Stage;
use crate::telemetry::{noop_sink, EventSink, PipelineEvent};
use crate::types::{CallDescriptor, TargetKey};
use crate::utils::{lock_unpoisoned, millis};
use crate::{Error, ErrorContext, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Decides whether an error counts against the target's health.
pub type FailureClassifier = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Default classifier: every upstream error and every timeout counts. The pipeline's own
/// rejections (open circuit, full queue, cancellation) say nothing about the target and
/// are ignored.
pub fn default_failure_classifier() -> FailureClassifier {
    Arc::new(|e: &Error| matches!(e, Error::Upstream { .. } | Error::Timeout { .. }))
}

/// Classifier that ignores client-side 4xx responses except 408 and 429.
pub fn server_failure_classifier() -> FailureClassifier {
    Arc::new(|e: &Error| match e {
        Error::Upstream {
            status: Some(s), ..
        } => !(400..500).contains(s) || *s == 408 || *s == 429,
        Error::Upstream { status: None, .. } | Error::Timeout { .. } => true,
        _ => false,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub target: TargetKey,
    pub state: CircuitState,
    pub failure_count: u32,
    pub half_open_successes: u32,
    pub probes_in_flight: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// Remaining open time in ms, if currently open and not yet eligible for probing.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    /// Upper bound on a single call. Zero disables the breaker's own deadline.
    pub request_timeout: Duration,
    /// Consecutive half-open successes needed to close again.
    pub half_open_success_threshold: u32,
    /// Concurrent probes allowed while half-open. Zero means unlimited.
    pub half_open_max_probes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(10),
            half_open_success_threshold: 2,
            half_open_max_probes: 1,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set how long the circuit stays open before a probe is allowed
    pub fn with_reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_half_open_success_threshold(mut self, n: u32) -> Self {
        self.half_open_success_threshold = n;
        self
    }

    pub fn with_half_open_max_probes(mut self, n: u32) -> Self {
        self.half_open_max_probes = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(Error::configuration_with_context(
                "failure_threshold must be at least 1",
                ErrorContext::new()
                    .with_field_path("breaker.failure_threshold")
                    .with_source("circuit_breaker"),
            ));
        }
        if self.half_open_success_threshold == 0 {
            return Err(Error::configuration_with_context(
                "half_open_success_threshold must be at least 1",
                ErrorContext::new()
                    .with_field_path("breaker.half_open_success_threshold")
                    .with_source("circuit_breaker"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug)]
struct State {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_successes: u32,
    probes_in_flight: u32,
    /// Bumped on every entry into half-open so stale probe tickets can be told apart.
    half_open_epoch: u64,
}

/// Per-target circuit breaker.
///
/// - Counts consecutive failures while closed
/// - Opens at the threshold and fails fast until the reset timeout elapses
/// - The transition to half-open is checked lazily on the next call
/// - Closes after enough consecutive half-open successes; any half-open failure reopens
pub struct CircuitBreaker {
    target: TargetKey,
    cfg: CircuitBreakerConfig,
    classifier: FailureClassifier,
    events: Arc<dyn EventSink>,
    state: Mutex<State>,
}

/// Admission granted by [`CircuitBreaker::try_acquire`]. Releases its probe slot on drop.
pub struct BreakerTicket<'a> {
    breaker: &'a CircuitBreaker,
    probe_epoch: Option<u64>,
}

impl Drop for BreakerTicket<'_> {
    fn drop(&mut self) {
        if let Some(epoch) = self.probe_epoch {
            let mut st = lock_unpoisoned(&self.breaker.state);
            if st.half_open_epoch == epoch {
                st.probes_in_flight = st.probes_in_flight.saturating_sub(1);
            }
        }
    }
}

impl CircuitBreaker {
    pub fn new(target: TargetKey, cfg: CircuitBreakerConfig) -> Self {
        Self {
            target,
            cfg,
            classifier: default_failure_classifier(),
            events: noop_sink(),
            state: Mutex::new(State {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                half_open_successes: 0,
                probes_in_flight: 0,
                half_open_epoch: 0,
            }),
        }
    }

    pub fn with_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn target(&self) -> &TargetKey {
        &self.target
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.cfg
    }

    /// Run `next` if the circuit admits it, racing it against the request deadline and
    /// recording the outcome.
    pub async fn execute<F, Fut, T>(&self, call: &CallDescriptor, next: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ticket = match self.try_acquire() {
            Ok(t) => t,
            Err(e) => {
                self.events.record(PipelineEvent::Rejected {
                    call_id: call.id().to_string(),
                    target: self.target.clone(),
                    kind: e.kind(),
                });
                return Err(e);
            }
        };

        let deadline = match call.timeout() {
            Some(t) if self.cfg.request_timeout.is_zero() => Some(t),
            Some(t) => Some(t.min(self.cfg.request_timeout)),
            None if self.cfg.request_timeout.is_zero() => None,
            None => Some(self.cfg.request_timeout),
        };

        let outcome = match deadline {
            Some(d) => match tokio::time::timeout(d, next()).await {
                Ok(r) => r,
                Err(_) => Err(Error::timeout(Stage::Breaker, d)),
            },
            None => next().await,
        };

        match &outcome {
            Ok(_) => self.record_success(&ticket),
            Err(e) if (self.classifier)(e) => self.record_failure(&ticket),
            Err(_) => {}
        }
        drop(ticket);
        outcome
    }

    /// Check whether a call may proceed right now.
    ///
    /// Moves an expired open circuit to half-open. While half-open, at most
    /// `half_open_max_probes` tickets are outstanding at once.
    pub fn try_acquire(&self) -> Result<BreakerTicket<'_>> {
        let mut transition = None;
        let result = {
            let mut st = lock_unpoisoned(&self.state);
            let now = Instant::now();

            if st.state == CircuitState::Open {
                let elapsed = st
                    .last_failure
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(self.cfg.reset_timeout);
                if elapsed >= self.cfg.reset_timeout {
                    st.state = CircuitState::HalfOpen;
                    st.half_open_successes = 0;
                    st.probes_in_flight = 0;
                    st.half_open_epoch = st.half_open_epoch.wrapping_add(1);
                    transition = Some((CircuitState::Open, CircuitState::HalfOpen));
                } else {
                    let remaining = self.cfg.reset_timeout - elapsed;
                    return Err(Error::CircuitOpen {
                        target: self.target.clone(),
                        retry_after_ms: Some(millis(remaining)),
                    });
                }
            }

            match st.state {
                CircuitState::HalfOpen => {
                    let cap = self.cfg.half_open_max_probes;
                    if cap > 0 && st.probes_in_flight >= cap {
                        Err(Error::CircuitOpen {
                            target: self.target.clone(),
                            retry_after_ms: None,
                        })
                    } else {
                        st.probes_in_flight += 1;
                        Ok(BreakerTicket {
                            breaker: self,
                            probe_epoch: Some(st.half_open_epoch),
                        })
                    }
                }
                _ => Ok(BreakerTicket {
                    breaker: self,
                    probe_epoch: None,
                }),
            }
        };
        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
        result
    }

    pub fn record_success(&self, _ticket: &BreakerTicket<'_>) {
        let mut transition = None;
        {
            let mut st = lock_unpoisoned(&self.state);
            match st.state {
                CircuitState::Closed => st.failure_count = 0,
                CircuitState::HalfOpen => {
                    st.half_open_successes += 1;
                    if st.half_open_successes >= self.cfg.half_open_success_threshold {
                        st.state = CircuitState::Closed;
                        st.failure_count = 0;
                        st.half_open_successes = 0;
                        st.probes_in_flight = 0;
                        transition = Some((CircuitState::HalfOpen, CircuitState::Closed));
                    }
                }
                // Late success from a call admitted before the trip.
                CircuitState::Open => {}
            }
        }
        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
    }

    pub fn record_failure(&self, _ticket: &BreakerTicket<'_>) {
        let mut transition = None;
        {
            let mut st = lock_unpoisoned(&self.state);
            st.failure_count = st.failure_count.saturating_add(1);
            st.last_failure = Some(Instant::now());
            match st.state {
                CircuitState::Closed if st.failure_count >= self.cfg.failure_threshold => {
                    st.state = CircuitState::Open;
                    transition = Some((CircuitState::Closed, CircuitState::Open));
                }
                CircuitState::HalfOpen => {
                    st.state = CircuitState::Open;
                    st.half_open_successes = 0;
                    st.probes_in_flight = 0;
                    transition = Some((CircuitState::HalfOpen, CircuitState::Open));
                }
                _ => {}
            }
        }
        if let Some((from, to)) = transition {
            self.announce(from, to);
        }
    }

    fn announce(&self, from: CircuitState, to: CircuitState) {
        match to {
            CircuitState::Open => warn!(
                target_key = %self.target,
                from = %from,
                reset_timeout_ms = millis(self.cfg.reset_timeout),
                "circuit opened"
            ),
            _ => info!(target_key = %self.target, from = %from, to = %to, "circuit transition"),
        }
        self.events.record(PipelineEvent::CircuitTransition {
            target: self.target.clone(),
            from,
            to,
        });
    }

    pub fn state(&self) -> CircuitState {
        lock_unpoisoned(&self.state).state
    }

    pub fn snapshot(&self) -> CircuitBreakerSnapshot {
        let now = Instant::now();
        let st = lock_unpoisoned(&self.state);
        let open_remaining_ms = match (st.state, st.last_failure) {
            (CircuitState::Open, Some(t)) => {
                let elapsed = now.saturating_duration_since(t);
                if elapsed < self.cfg.reset_timeout {
                    Some(millis(self.cfg.reset_timeout - elapsed))
                } else {
                    None
                }
            }
            _ => None,
        };
        CircuitBreakerSnapshot {
            target: self.target.clone(),
            state: st.state,
            failure_count: st.failure_count,
            half_open_successes: st.half_open_successes,
            probes_in_flight: st.probes_in_flight,
            failure_threshold: self.cfg.failure_threshold,
            reset_timeout_ms: millis(self.cfg.reset_timeout),
            open_remaining_ms,
        }
    }
}

/// Lazily creates one breaker per target key and keeps it for the registry's lifetime.
pub struct CircuitBreakerRegistry {
    cfg: CircuitBreakerConfig,
    classifier: FailureClassifier,
    events: Arc<dyn EventSink>,
    breakers: Mutex<HashMap<TargetKey, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new(
        cfg: CircuitBreakerConfig,
        classifier: FailureClassifier,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            cfg,
            classifier,
            events,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, target: &TargetKey) -> Arc<CircuitBreaker> {
        let mut breakers = lock_unpoisoned(&self.breakers);
        breakers
            .entry(target.clone())
            .or_insert_with(|| {
                Arc::new(
                    CircuitBreaker::new(target.clone(), self.cfg.clone())
                        .with_classifier(self.classifier.clone())
                        .with_event_sink(self.events.clone()),
                )
            })
            .clone()
    }

    /// Snapshots of every breaker created so far, ordered by target.
    pub fn snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            lock_unpoisoned(&self.breakers).values().cloned().collect();
        let mut out: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.target.cmp(&b.target));
        out
    }
}
