use crate::error::Stage;
use crate::telemetry::{noop_sink, EventSink, PipelineEvent};
use crate::types::CallDescriptor;
use crate::utils::{lock_unpoisoned, millis};
use crate::{Error, ErrorContext, Result};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

/// Decides whether a failed attempt may be retried.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Retry network-level failures, timeouts, 5xx and 429. Local rejections are final.
pub fn default_retry_predicate() -> RetryPredicate {
    Arc::new(|err: &Error| match err {
        Error::Upstream { status: None, .. } => true,
        Error::Upstream {
            status: Some(s), ..
        } => *s >= 500 || *s == 429,
        Error::Timeout { .. } => true,
        Error::CircuitOpen { .. }
        | Error::QueueFull { .. }
        | Error::Cancelled { .. }
        | Error::BatchItemMissing { .. }
        | Error::Configuration { .. } => false,
    })
}

/// Configuration for retry logic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries after the first attempt; a call runs at most `max_retries + 1` times.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Option<Duration>,
    /// Full jitter: the delay is drawn uniformly from `[0, computed]`.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: None,
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Upper bound on any single wait, including one asked for by a `Retry-After` hint.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(max) = self.max_delay {
            if max < self.base_delay {
                return Err(Error::configuration_with_context(
                    "max_delay must not be shorter than base_delay",
                    ErrorContext::new()
                        .with_field_path("retry.max_delay_ms")
                        .with_details(format!(
                            "base_delay_ms = {}, max_delay_ms = {}",
                            millis(self.base_delay),
                            millis(max)
                        ))
                        .with_source("retry"),
                ));
            }
        }
        Ok(())
    }
}

/// Wraps a call with bounded retries and exponential backoff.
///
/// Attempts are strictly sequential. After the budget runs out the last attempt's error is
/// returned unchanged.
pub struct RetryOrchestrator {
    cfg: RetryConfig,
    predicate: RetryPredicate,
    events: Arc<dyn EventSink>,
    /// attempts used -> number of calls that resolved after that many attempts
    histogram: Mutex<BTreeMap<u32, u64>>,
}

impl RetryOrchestrator {
    pub fn new(cfg: RetryConfig) -> Self {
        Self {
            cfg,
            predicate: default_retry_predicate(),
            events: noop_sink(),
            histogram: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.cfg
    }

    /// Delay before the retry that follows failed attempt `attempt` (0-based).
    pub fn backoff(&self, attempt: u32, hint: Option<Duration>) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let mut delay = self.cfg.base_delay.saturating_mul(factor);
        if let Some(cap) = self.cfg.max_delay {
            delay = delay.min(cap);
        }
        if self.cfg.jitter {
            delay = Duration::from_millis(fastrand::u64(0..=millis(delay)));
        }
        let floor = match (hint, self.cfg.max_delay) {
            (Some(h), Some(cap)) => h.min(cap),
            (Some(h), None) => h,
            (None, _) => Duration::ZERO,
        };
        delay.max(floor)
    }

    /// Run `attempt_fn` until it succeeds, the predicate refuses, or the budget is spent.
    ///
    /// `attempt_fn` receives the 0-based attempt index. Backoff waits end early with
    /// `Cancelled` when the call's token fires.
    pub async fn execute<F, Fut, T>(&self, call: &CallDescriptor, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let outcome = attempt_fn(attempt).await;
            call.metadata().record_attempts(attempt + 1);

            let err = match outcome {
                Ok(v) => {
                    self.observe(attempt + 1);
                    return Ok(v);
                }
                Err(e) => e,
            };

            if attempt >= self.cfg.max_retries || !(self.predicate)(&err) {
                self.observe(attempt + 1);
                return Err(err);
            }

            let delay = self.backoff(attempt, err.retry_after());
            debug!(
                target_key = %call.target(),
                attempt = attempt + 1,
                delay_ms = millis(delay),
                error = %err,
                "retry scheduled"
            );
            self.events.record(PipelineEvent::RetryScheduled {
                call_id: call.id().to_string(),
                target: call.target().clone(),
                attempt: attempt + 1,
                delay_ms: millis(delay),
            });

            match call.cancellation() {
                Some(token) => {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            self.observe(attempt + 1);
                            return Err(Error::cancelled(Stage::Retry));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => tokio::time::sleep(delay).await,
            }
            attempt += 1;
        }
    }

    fn observe(&self, attempts: u32) {
        *lock_unpoisoned(&self.histogram).entry(attempts).or_insert(0) += 1;
    }

    /// Attempts-per-call histogram: attempts used -> resolved calls.
    pub fn histogram(&self) -> BTreeMap<u32, u64> {
        lock_unpoisoned(&self.histogram).clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::InMemoryEventSink;
    use crate::types::TargetKey;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;
    use tokio_util::sync::CancellationToken;

    fn call() -> CallDescriptor {
        CallDescriptor::new("GET", "/r")
    }

    fn fast() -> RetryOrchestrator {
        RetryOrchestrator::new(
            RetryConfig::new()
                .with_max_retries(3)
                .with_base_delay(Duration::from_millis(50)),
        )
    }

    #[test]
    fn test_default_predicate() {
        let p = default_retry_predicate();
        assert!(p(&Error::network("connection reset")));
        assert!(p(&Error::upstream(503, "unavailable")));
        assert!(p(&Error::upstream(429, "slow down")));
        assert!(p(&Error::timeout(Stage::Transport, Duration::from_secs(1))));
        assert!(!p(&Error::upstream(404, "missing")));
        assert!(!p(&Error::cancelled(Stage::Admission)));
        assert!(!p(&Error::CircuitOpen {
            target: TargetKey::new("GET", "/r"),
            retry_after_ms: Some(10),
        }));
        assert!(!p(&Error::QueueFull {
            target: TargetKey::new("GET", "/r"),
            capacity: 1,
        }));
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let r = RetryOrchestrator::new(
            RetryConfig::new()
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_millis(350)),
        );
        assert_eq!(r.backoff(0, None), Duration::from_millis(100));
        assert_eq!(r.backoff(1, None), Duration::from_millis(200));
        assert_eq!(r.backoff(2, None), Duration::from_millis(350));
        assert_eq!(r.backoff(40, None), Duration::from_millis(350));
    }

    #[test]
    fn test_retry_after_hint_is_capped_by_max_delay() {
        let r = RetryOrchestrator::new(
            RetryConfig::new()
                .with_base_delay(Duration::from_millis(100))
                .with_max_delay(Duration::from_secs(5)),
        );
        assert_eq!(
            r.backoff(0, Some(Duration::from_secs(86_400))),
            Duration::from_secs(5)
        );
        assert_eq!(
            r.backoff(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_backoff_honours_retry_after_hint() {
        let r = fast();
        assert_eq!(
            r.backoff(0, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            r.backoff(2, Some(Duration::from_millis(10))),
            Duration::from_millis(200)
        );
    }

    #[test]
    fn test_jittered_backoff_stays_in_range() {
        let r = RetryOrchestrator::new(
            RetryConfig::new()
                .with_base_delay(Duration::from_millis(100))
                .with_jitter(true),
        );
        for _ in 0..100 {
            assert!(r.backoff(1, None) <= Duration::from_millis(200));
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        assert!(RetryConfig::new()
            .with_base_delay(Duration::from_millis(500))
            .with_max_delay(Duration::from_millis(100))
            .validate()
            .is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausts_budget_and_surfaces_last_error() {
        let r = fast();
        let c = call();
        let attempts = AtomicU32::new(0);
        let start = Instant::now();
        let err = r
            .execute(&c, |i| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(Error::upstream(500, format!("attempt {i}"))) }
            })
            .await
            .unwrap_err();

        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(err.to_string(), "upstream error (HTTP 500): attempt 3");
        assert_eq!(c.metadata().attempts(), 4);
        // 50 + 100 + 200
        assert!(start.elapsed() >= Duration::from_millis(350));
        assert_eq!(r.histogram().get(&4), Some(&1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let sink = Arc::new(InMemoryEventSink::default());
        let r = fast().with_event_sink(sink.clone());
        let out = r
            .execute(&call(), |i| async move {
                if i < 2 {
                    Err(Error::network("reset"))
                } else {
                    Ok(i)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 2);
        let scheduled: Vec<_> = sink
            .events()
            .into_iter()
            .filter_map(|e| match e {
                PipelineEvent::RetryScheduled {
                    attempt, delay_ms, ..
                } => Some((attempt, delay_ms)),
                _ => None,
            })
            .collect();
        assert_eq!(scheduled, vec![(1, 50), (2, 100)]);
    }

    #[tokio::test]
    async fn test_non_retryable_error_is_returned_immediately() {
        let r = fast();
        let attempts = AtomicU32::new(0);
        let err = r
            .execute(&call(), |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::upstream(400, "bad request")) }
            })
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_custom_predicate() {
        let r = fast().with_predicate(Arc::new(|_| false));
        let attempts = AtomicU32::new(0);
        let _ = r
            .execute(&call(), |_| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(Error::upstream(503, "down")) }
            })
            .await;
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let r = RetryOrchestrator::new(
            RetryConfig::new().with_base_delay(Duration::from_secs(10)),
        );
        let token = CancellationToken::new();
        let c = call().with_cancellation(token.clone());
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });
        let start = Instant::now();
        let err = r
            .execute(&c, |_| async { Err::<(), _>(Error::upstream(502, "bad gateway")) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { stage: Stage::Retry }));
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(c.metadata().attempts(), 1);
    }
}
