//! 遥测模块：管线决策事件与可插拔的事件接收器。
//!
//! Pipeline decision events and pluggable sinks.
//!
//! Every admission, rejection, breaker transition, retry and batch flush is reported as a
//! [`PipelineEvent`] to the [`EventSink`] injected at construction time. The pipeline never
//! aggregates metrics itself; a sink forwards events to whatever collector the application
//! uses.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`PipelineEvent`] | Typed decision event |
//! | [`EventSink`] | Trait for event destinations |
//! | [`NoopEventSink`] | Default sink (drops everything) |
//! | [`InMemoryEventSink`] | Bounded in-memory sink for tests and debugging |
//! | [`TracingEventSink`] | Emits each event as a `tracing` record |
//! | [`CompositeEventSink`] | Fans events out to several sinks |

use crate::batch::FlushReason;
use crate::error::ErrorKind;
use crate::resilience::circuit_breaker::CircuitState;
use crate::types::TargetKey;
use crate::utils::lock_unpoisoned;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// A decision taken by one of the pipeline components.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// The admission controller let a call through, possibly after queueing.
    Admitted {
        call_id: String,
        target: TargetKey,
        queued_ms: u64,
    },
    /// The call could not be admitted immediately and is waiting.
    Queued {
        call_id: String,
        target: TargetKey,
        priority: i32,
        queue_len: usize,
    },
    /// A component refused the call without reaching the transport.
    Rejected {
        call_id: String,
        target: TargetKey,
        kind: ErrorKind,
    },
    CircuitTransition {
        target: TargetKey,
        from: CircuitState,
        to: CircuitState,
    },
    RetryScheduled {
        call_id: String,
        target: TargetKey,
        attempt: u32,
        delay_ms: u64,
    },
    BatchFlushed {
        target: TargetKey,
        size: usize,
        reason: FlushReason,
    },
    /// Final outcome of a call as seen by its caller.
    Finished {
        call_id: String,
        target: TargetKey,
        attempts: u32,
        error: Option<ErrorKind>,
    },
}

impl PipelineEvent {
    /// Stable snake_case name of the event variant.
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::Admitted { .. } => "admitted",
            PipelineEvent::Queued { .. } => "queued",
            PipelineEvent::Rejected { .. } => "rejected",
            PipelineEvent::CircuitTransition { .. } => "circuit_transition",
            PipelineEvent::RetryScheduled { .. } => "retry_scheduled",
            PipelineEvent::BatchFlushed { .. } => "batch_flushed",
            PipelineEvent::Finished { .. } => "finished",
        }
    }

    pub fn target(&self) -> &TargetKey {
        match self {
            PipelineEvent::Admitted { target, .. }
            | PipelineEvent::Queued { target, .. }
            | PipelineEvent::Rejected { target, .. }
            | PipelineEvent::CircuitTransition { target, .. }
            | PipelineEvent::RetryScheduled { target, .. }
            | PipelineEvent::BatchFlushed { target, .. }
            | PipelineEvent::Finished { target, .. } => target,
        }
    }

    pub fn call_id(&self) -> Option<&str> {
        match self {
            PipelineEvent::Admitted { call_id, .. }
            | PipelineEvent::Queued { call_id, .. }
            | PipelineEvent::Rejected { call_id, .. }
            | PipelineEvent::RetryScheduled { call_id, .. }
            | PipelineEvent::Finished { call_id, .. } => Some(call_id),
            PipelineEvent::CircuitTransition { .. } | PipelineEvent::BatchFlushed { .. } => None,
        }
    }
}

/// Destination for pipeline events.
///
/// `record` is called synchronously on the decision path and must not block.
pub trait EventSink: Send + Sync {
    fn record(&self, event: PipelineEvent);
}

/// No-op sink (always available).
pub struct NoopEventSink;

impl EventSink for NoopEventSink {
    fn record(&self, _: PipelineEvent) {}
}

/// Returns a no-op event sink.
pub fn noop_sink() -> Arc<dyn EventSink> {
    Arc::new(NoopEventSink)
}

/// In-memory sink for testing. Keeps the most recent `max_events` events.
pub struct InMemoryEventSink {
    events: Mutex<VecDeque<PipelineEvent>>,
    max_events: usize,
}

impl InMemoryEventSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_events: max.max(1),
        }
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        lock_unpoisoned(&self.events).iter().cloned().collect()
    }

    pub fn events_for_call(&self, call_id: &str) -> Vec<PipelineEvent> {
        lock_unpoisoned(&self.events)
            .iter()
            .filter(|e| e.call_id() == Some(call_id))
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.events).clear();
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryEventSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl EventSink for InMemoryEventSink {
    fn record(&self, event: PipelineEvent) {
        let mut events = lock_unpoisoned(&self.events);
        events.push_back(event);
        while events.len() > self.max_events {
            events.pop_front();
        }
    }
}

/// Emits every event through `tracing` at debug level.
#[derive(Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn record(&self, event: PipelineEvent) {
        tracing::debug!(
            event = event.name(),
            target_key = %event.target(),
            call_id = event.call_id().unwrap_or("-"),
            detail = ?event,
            "pipeline event"
        );
    }
}

/// Composite sink for multiple destinations.
#[derive(Default)]
pub struct CompositeEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl CompositeEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl EventSink for CompositeEventSink {
    fn record(&self, event: PipelineEvent) {
        for s in &self.sinks {
            s.record(event.clone());
        }
    }
}
