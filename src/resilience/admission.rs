use crate::error::Stage;
use crate::telemetry::{noop_sink, EventSink, PipelineEvent};
use crate::types::{CallDescriptor, TargetKey};
use crate::utils::{lock_unpoisoned, millis};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize)]
pub struct AdmissionSnapshot {
    /// Target this controller accounts for; `None` for the pipeline-wide controller.
    pub scope: Option<TargetKey>,
    pub in_flight: usize,
    pub queued: usize,
    /// Admissions still inside the sliding window.
    pub window_count: usize,
    pub max_concurrent: usize,
    pub max_requests: usize,
    pub window_ms: u64,
    /// Estimated wait until the window frees a slot (ms), if the window is currently full.
    pub estimated_wait_ms: Option<u64>,
}

/// Whether admission is accounted once for the whole pipeline or separately per target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdmissionScope {
    #[default]
    Global,
    PerTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Hard ceiling on simultaneously in-flight calls.
    pub max_concurrent: usize,
    /// Admissions allowed per `window`. Zero disables the rate window.
    pub max_requests: usize,
    pub window: Duration,
    /// Waiting calls beyond this are rejected with `QueueFull`.
    pub max_queue_len: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_requests: 50,
            window: Duration::from_millis(1000),
            max_queue_len: 1024,
        }
    }
}

impl AdmissionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent(mut self, n: usize) -> Self {
        self.max_concurrent = n;
        self
    }

    pub fn with_max_requests(mut self, n: usize) -> Self {
        self.max_requests = n;
        self
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_max_queue_len(mut self, n: usize) -> Self {
        self.max_queue_len = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(Error::configuration_with_context(
                "max_concurrent must be at least 1",
                ErrorContext::new()
                    .with_field_path("admission.max_concurrent")
                    .with_source("admission"),
            ));
        }
        if self.max_requests > 0 && self.window.is_zero() {
            return Err(Error::configuration_with_context(
                "window must be non-zero when max_requests is set",
                ErrorContext::new()
                    .with_field_path("admission.window_ms")
                    .with_details(format!("max_requests = {}", self.max_requests))
                    .with_source("admission"),
            ));
        }
        Ok(())
    }

    fn rate_limited(&self) -> bool {
        self.max_requests > 0
    }
}

struct Waiter {
    priority: i32,
    seq: u64,
    call_id: String,
    target: TargetKey,
    enqueued_at: Instant,
    tx: oneshot::Sender<AdmissionPermit>,
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Max-heap order: higher priority first, then earlier enqueue.
impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct State {
    window: VecDeque<Instant>,
    in_flight: usize,
    queue: BinaryHeap<Waiter>,
    next_seq: u64,
    timer_armed: bool,
}

struct Shared {
    scope: Option<TargetKey>,
    cfg: AdmissionConfig,
    events: Arc<dyn EventSink>,
    state: Mutex<State>,
}

impl Shared {
    fn purge(&self, st: &mut State, now: Instant) {
        if !self.cfg.rate_limited() {
            return;
        }
        while let Some(&oldest) = st.window.front() {
            if now.saturating_duration_since(oldest) >= self.cfg.window {
                st.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn has_capacity(&self, st: &State) -> bool {
        st.in_flight < self.cfg.max_concurrent
            && (!self.cfg.rate_limited() || st.window.len() < self.cfg.max_requests)
    }

    fn admit(&self, st: &mut State, now: Instant) {
        if self.cfg.rate_limited() {
            st.window.push_back(now);
        }
        st.in_flight += 1;
    }

    /// Time until the oldest admission leaves the window.
    fn window_wait(&self, st: &State, now: Instant) -> Option<Duration> {
        if !self.cfg.rate_limited() || st.window.len() < self.cfg.max_requests {
            return None;
        }
        let oldest = *st.window.front()?;
        Some(
            self.cfg
                .window
                .saturating_sub(now.saturating_duration_since(oldest)),
        )
    }
}

/// Slot held by an admitted call. Dropping it frees the slot and wakes the queue.
pub struct AdmissionPermit {
    shared: Arc<Shared>,
    released: bool,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        {
            let mut st = lock_unpoisoned(&self.shared.state);
            st.in_flight = st.in_flight.saturating_sub(1);
        }
        drain(&self.shared);
    }
}

/// Queue position held by a waiting caller. Dropping it before admission withdraws the
/// waiter, whatever ended the wait (cancellation, a deadline, or the caller going away).
struct QueuedTicket {
    shared: Arc<Shared>,
    seq: u64,
    admitted: bool,
}

impl Drop for QueuedTicket {
    fn drop(&mut self) {
        if self.admitted {
            return;
        }
        let mut st = lock_unpoisoned(&self.shared.state);
        st.queue.retain(|w| w.seq != self.seq);
    }
}

/// Admit as many queued calls as capacity allows, in priority order, and arm the window
/// timer if the queue is blocked only by the rate window.
fn drain(shared: &Arc<Shared>) {
    let mut admitted = Vec::new();
    let arm = {
        let mut st = lock_unpoisoned(&shared.state);
        let now = Instant::now();
        shared.purge(&mut st, now);

        while shared.has_capacity(&st) {
            let Some(waiter) = st.queue.pop() else { break };
            if waiter.tx.is_closed() {
                continue;
            }
            shared.admit(&mut st, now);
            let permit = AdmissionPermit {
                shared: shared.clone(),
                released: false,
            };
            match waiter.tx.send(permit) {
                Ok(()) => admitted.push((waiter.call_id, waiter.target, now - waiter.enqueued_at)),
                Err(mut permit) => {
                    // Receiver went away between the check and the send: undo the admission.
                    permit.released = true;
                    if shared.cfg.rate_limited() {
                        st.window.pop_back();
                    }
                    st.in_flight = st.in_flight.saturating_sub(1);
                }
            }
        }

        let blocked_by_window =
            !st.queue.is_empty() && st.in_flight < shared.cfg.max_concurrent;
        match shared.window_wait(&st, now) {
            Some(wait) if blocked_by_window && !st.timer_armed => {
                st.timer_armed = true;
                Some(wait)
            }
            _ => None,
        }
    };

    for (call_id, target, waited) in admitted {
        shared.events.record(PipelineEvent::Admitted {
            call_id,
            target,
            queued_ms: millis(waited),
        });
    }

    if let Some(wait) = arm {
        arm_window_timer(shared, wait);
    }
}

fn arm_window_timer(shared: &Arc<Shared>, wait: Duration) {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep(wait).await;
                if let Some(shared) = weak.upgrade() {
                    lock_unpoisoned(&shared.state).timer_armed = false;
                    drain(&shared);
                }
            });
        }
        Err(_) => {
            // No runtime to drive the timer; the next completion will re-scan instead.
            lock_unpoisoned(&shared.state).timer_armed = false;
        }
    }
}

/// Priority-aware admission controller.
///
/// Bounds in-flight calls and enforces a sliding-window rate limit. Calls that cannot be
/// admitted wait in a queue ordered by (priority desc, arrival asc). The queue is
/// re-scanned whenever a call completes and when the window advances past its oldest
/// admission.
#[derive(Clone)]
pub struct AdmissionController {
    shared: Arc<Shared>,
}

impl AdmissionController {
    pub fn new(cfg: AdmissionConfig) -> Self {
        Self::build(None, cfg, noop_sink())
    }

    pub fn with_event_sink(cfg: AdmissionConfig, events: Arc<dyn EventSink>) -> Self {
        Self::build(None, cfg, events)
    }

    fn build(scope: Option<TargetKey>, cfg: AdmissionConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            shared: Arc::new(Shared {
                scope,
                cfg,
                events,
                state: Mutex::new(State {
                    window: VecDeque::new(),
                    in_flight: 0,
                    queue: BinaryHeap::new(),
                    next_seq: 0,
                    timer_armed: false,
                }),
            }),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.shared.cfg
    }

    /// Admit `call` (waiting in the queue if necessary), then run `next` while holding the
    /// slot. Cancellation of the call's token aborts `next` by dropping it.
    pub async fn execute<F, Fut, T>(&self, call: &CallDescriptor, next: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire(call).await?;
        let outcome = match call.cancellation() {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => Err(Error::cancelled(Stage::Transport)),
                r = next() => r,
            },
            None => next().await,
        };
        drop(permit);
        outcome
    }

    /// Wait for a slot.
    pub async fn acquire(&self, call: &CallDescriptor) -> Result<AdmissionPermit> {
        let shared = &self.shared;
        if call.is_cancelled() {
            return Err(Error::cancelled(Stage::Admission));
        }

        let (mut rx, seq, queue_len) = {
            let mut st = lock_unpoisoned(&shared.state);
            let now = Instant::now();
            shared.purge(&mut st, now);

            if st.queue.is_empty() && shared.has_capacity(&st) {
                shared.admit(&mut st, now);
                drop(st);
                shared.events.record(PipelineEvent::Admitted {
                    call_id: call.id().to_string(),
                    target: call.target().clone(),
                    queued_ms: 0,
                });
                return Ok(AdmissionPermit {
                    shared: shared.clone(),
                    released: false,
                });
            }

            if st.queue.len() >= shared.cfg.max_queue_len {
                drop(st);
                warn!(
                    target_key = %call.target(),
                    capacity = shared.cfg.max_queue_len,
                    "admission queue full"
                );
                let err = Error::QueueFull {
                    target: call.target().clone(),
                    capacity: shared.cfg.max_queue_len,
                };
                shared.events.record(PipelineEvent::Rejected {
                    call_id: call.id().to_string(),
                    target: call.target().clone(),
                    kind: err.kind(),
                });
                return Err(err);
            }

            let (tx, rx) = oneshot::channel();
            let seq = st.next_seq;
            st.next_seq = st.next_seq.wrapping_add(1);
            st.queue.push(Waiter {
                priority: call.priority(),
                seq,
                call_id: call.id().to_string(),
                target: call.target().clone(),
                enqueued_at: now,
                tx,
            });
            (rx, seq, st.queue.len())
        };

        debug!(
            target_key = %call.target(),
            priority = call.priority(),
            queue_len,
            "call queued for admission"
        );
        shared.events.record(PipelineEvent::Queued {
            call_id: call.id().to_string(),
            target: call.target().clone(),
            priority: call.priority(),
            queue_len,
        });
        // Declared after `rx`, so it withdraws first; a permit that raced in is then
        // released when `rx` drops.
        let mut ticket = QueuedTicket {
            shared: shared.clone(),
            seq,
            admitted: false,
        };
        drain(shared);

        let admitted = match call.cancellation() {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::cancelled(Stage::Admission)),
                r = &mut rx => r,
            },
            None => (&mut rx).await,
        };
        let permit = admitted.map_err(|_| Error::cancelled(Stage::Admission))?;
        ticket.admitted = true;
        Ok(permit)
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        let shared = &self.shared;
        let mut st = lock_unpoisoned(&shared.state);
        let now = Instant::now();
        shared.purge(&mut st, now);
        AdmissionSnapshot {
            scope: shared.scope.clone(),
            in_flight: st.in_flight,
            queued: st.queue.len(),
            window_count: st.window.len(),
            max_concurrent: shared.cfg.max_concurrent,
            max_requests: shared.cfg.max_requests,
            window_ms: millis(shared.cfg.window),
            estimated_wait_ms: shared.window_wait(&st, now).map(millis),
        }
    }
}

/// Hands out the admission controller responsible for a target, according to scope.
pub struct AdmissionRegistry {
    scope: AdmissionScope,
    cfg: AdmissionConfig,
    events: Arc<dyn EventSink>,
    global: AdmissionController,
    per_target: Mutex<HashMap<TargetKey, AdmissionController>>,
}

impl AdmissionRegistry {
    pub fn new(scope: AdmissionScope, cfg: AdmissionConfig, events: Arc<dyn EventSink>) -> Self {
        Self {
            scope,
            global: AdmissionController::build(None, cfg.clone(), events.clone()),
            cfg,
            events,
            per_target: Mutex::new(HashMap::new()),
        }
    }

    pub fn scope(&self) -> AdmissionScope {
        self.scope
    }

    pub fn get(&self, target: &TargetKey) -> AdmissionController {
        match self.scope {
            AdmissionScope::Global => self.global.clone(),
            AdmissionScope::PerTarget => lock_unpoisoned(&self.per_target)
                .entry(target.clone())
                .or_insert_with(|| {
                    AdmissionController::build(
                        Some(target.clone()),
                        self.cfg.clone(),
                        self.events.clone(),
                    )
                })
                .clone(),
        }
    }

    pub fn snapshots(&self) -> Vec<AdmissionSnapshot> {
        match self.scope {
            AdmissionScope::Global => vec![self.global.snapshot()],
            AdmissionScope::PerTarget => {
                let controllers: Vec<AdmissionController> =
                    lock_unpoisoned(&self.per_target).values().cloned().collect();
                let mut out: Vec<_> = controllers.iter().map(|c| c.snapshot()).collect();
                out.sort_by(|a, b| a.scope.cmp(&b.scope));
                out
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::InMemoryEventSink;
    use tokio_util::sync::CancellationToken;

    fn call() -> CallDescriptor {
        CallDescriptor::new("GET", "/x")
    }

    async fn wait_for_queued(ctl: &AdmissionController, n: usize) {
        while ctl.snapshot().queued < n {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_admission_config_defaults() {
        let cfg = AdmissionConfig::default();
        assert_eq!(cfg.max_concurrent, 10);
        assert_eq!(cfg.max_requests, 50);
        assert_eq!(cfg.window, Duration::from_millis(1000));
        assert_eq!(cfg.max_queue_len, 1024);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_admission_config_validation() {
        assert!(AdmissionConfig::new()
            .with_max_concurrent(0)
            .validate()
            .is_err());
        assert!(AdmissionConfig::new()
            .with_window(Duration::ZERO)
            .validate()
            .is_err());
        assert!(AdmissionConfig::new()
            .with_window(Duration::ZERO)
            .with_max_requests(0)
            .validate()
            .is_ok());
    }

    #[test]
    fn test_waiter_ordering() {
        let (tx1, _rx1) = oneshot::channel();
        let (tx2, _rx2) = oneshot::channel();
        let (tx3, _rx3) = oneshot::channel();
        let mk = |priority, seq, tx| Waiter {
            priority,
            seq,
            call_id: String::new(),
            target: TargetKey::new("GET", "/"),
            enqueued_at: Instant::now(),
            tx,
        };
        let mut heap = BinaryHeap::new();
        heap.push(mk(1, 0, tx1));
        heap.push(mk(5, 2, tx2));
        heap.push(mk(5, 1, tx3));
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|w| w.seq)).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn test_immediate_admission_and_release() {
        let ctl = AdmissionController::new(AdmissionConfig::new().with_max_concurrent(2));
        let a = ctl.acquire(&call()).await.unwrap();
        let b = ctl.acquire(&call()).await.unwrap();
        assert_eq!(ctl.snapshot().in_flight, 2);
        drop(a);
        drop(b);
        let snap = ctl.snapshot();
        assert_eq!(snap.in_flight, 0);
        assert_eq!(snap.window_count, 2);
    }

    #[tokio::test]
    async fn test_slot_released_on_error() {
        let ctl = AdmissionController::new(AdmissionConfig::new().with_max_concurrent(1));
        let r: Result<()> = ctl
            .execute(&call(), || async { Err(Error::upstream(500, "boom")) })
            .await;
        assert!(r.is_err());
        assert_eq!(ctl.snapshot().in_flight, 0);
        ctl.execute(&call(), || async { Ok(()) }).await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_full_rejects_immediately() {
        let sink = Arc::new(InMemoryEventSink::default());
        let ctl = AdmissionController::with_event_sink(
            AdmissionConfig::new()
                .with_max_concurrent(1)
                .with_max_queue_len(1),
            sink.clone(),
        );
        let _held = ctl.acquire(&call()).await.unwrap();

        let waiting = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.acquire(&call()).await.map(|_| ()) })
        };
        wait_for_queued(&ctl, 1).await;

        let err = ctl.acquire(&call()).await.err().unwrap();
        assert!(matches!(err, Error::QueueFull { capacity: 1, .. }));
        assert!(sink.events().iter().any(|e| e.name() == "rejected"));
        waiting.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_priority_order_with_fifo_ties() {
        let ctl = AdmissionController::new(
            AdmissionConfig::new()
                .with_max_concurrent(1)
                .with_max_requests(0),
        );
        let blocker = ctl.acquire(&call()).await.unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for (i, (label, priority)) in [("a", 1), ("b", 3), ("c", 2), ("d", 3)]
            .into_iter()
            .enumerate()
        {
            let ctl2 = ctl.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let call = call().with_priority(priority);
                ctl2.execute(&call, move || async move {
                    order.lock().unwrap().push(label);
                    Ok::<_, Error>(())
                })
                .await
            }));
            wait_for_queued(&ctl, i + 1).await;
        }

        drop(blocker);
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec!["b", "d", "c", "a"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sliding_window_delays_excess() {
        let ctl = AdmissionController::new(
            AdmissionConfig::new()
                .with_max_requests(2)
                .with_window(Duration::from_millis(100)),
        );
        let start = Instant::now();
        let mut admitted_at = Vec::new();
        for _ in 0..3 {
            let permit = ctl.acquire(&call()).await.unwrap();
            admitted_at.push(start.elapsed());
            drop(permit);
        }
        assert_eq!(admitted_at[0], Duration::ZERO);
        assert_eq!(admitted_at[1], Duration::ZERO);
        assert!(admitted_at[2] >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_reports_window_wait() {
        let ctl = AdmissionController::new(
            AdmissionConfig::new()
                .with_max_requests(1)
                .with_window(Duration::from_millis(200)),
        );
        drop(ctl.acquire(&call()).await.unwrap());
        tokio::time::advance(Duration::from_millis(50)).await;
        let snap = ctl.snapshot();
        assert_eq!(snap.window_count, 1);
        assert_eq!(snap.estimated_wait_ms, Some(150));
    }

    #[tokio::test]
    async fn test_cancel_while_queued_removes_entry() {
        let ctl = AdmissionController::new(AdmissionConfig::new().with_max_concurrent(1));
        let blocker = ctl.acquire(&call()).await.unwrap();

        let token = CancellationToken::new();
        let queued = {
            let ctl = ctl.clone();
            let call = call().with_cancellation(token.clone());
            tokio::spawn(async move {
                ctl.execute(&call, || async { Ok::<_, Error>("ran") }).await
            })
        };
        wait_for_queued(&ctl, 1).await;
        token.cancel();

        let err = queued.await.unwrap().unwrap_err();
        assert!(matches!(
            err,
            Error::Cancelled {
                stage: Stage::Admission
            }
        ));
        assert_eq!(ctl.snapshot().queued, 0);
        drop(blocker);
        assert_eq!(ctl.snapshot().in_flight, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_frees_its_queue_slot() {
        let ctl = AdmissionController::new(
            AdmissionConfig::new()
                .with_max_concurrent(1)
                .with_max_queue_len(1),
        );
        let blocker = ctl.acquire(&call()).await.unwrap();

        let waited = tokio::time::timeout(Duration::from_millis(20), ctl.acquire(&call())).await;
        assert!(waited.is_err());
        assert_eq!(ctl.snapshot().queued, 0);

        let next = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.acquire(&call()).await.map(|_| ()) })
        };
        wait_for_queued(&ctl, 1).await;
        drop(blocker);
        next.await.unwrap().unwrap();
        assert_eq!(ctl.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn test_cancel_in_flight_drops_next() {
        let ctl = AdmissionController::new(AdmissionConfig::new());
        let token = CancellationToken::new();
        let call = call().with_cancellation(token.clone());
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::task::yield_now().await;
            canceller.cancel();
        });
        let err = ctl
            .execute(&call, || async {
                std::future::pending::<()>().await;
                Ok::<_, Error>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Cancelled {
                stage: Stage::Transport
            }
        ));
        assert_eq!(ctl.snapshot().in_flight, 0);
    }

    #[tokio::test]
    async fn test_already_cancelled_is_rejected() {
        let ctl = AdmissionController::new(AdmissionConfig::new());
        let token = CancellationToken::new();
        token.cancel();
        let err = ctl
            .acquire(&call().with_cancellation(token))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Cancelled);
        assert_eq!(ctl.snapshot().window_count, 0);
    }

    #[tokio::test]
    async fn test_registry_scopes() {
        let global = AdmissionRegistry::new(
            AdmissionScope::Global,
            AdmissionConfig::default(),
            noop_sink(),
        );
        let a = TargetKey::new("GET", "/a");
        let b = TargetKey::new("GET", "/b");
        let _p = global.get(&a).acquire(&call()).await.unwrap();
        assert_eq!(global.get(&b).snapshot().in_flight, 1);
        assert_eq!(global.snapshots().len(), 1);

        let per_target = AdmissionRegistry::new(
            AdmissionScope::PerTarget,
            AdmissionConfig::default(),
            noop_sink(),
        );
        let _p = per_target.get(&a).acquire(&call()).await.unwrap();
        assert_eq!(per_target.get(&b).snapshot().in_flight, 0);
        let snaps = per_target.snapshots();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].scope.as_ref(), Some(&a));
    }
}
