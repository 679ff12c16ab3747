//! Batch coordinator: merges batchable calls per target into one upstream call.

use super::collector::{BatchAddResult, BatchCollector, BatchConfig, BatchItem, FanOutMode};
use crate::error::Stage;
use crate::telemetry::{noop_sink, EventSink, PipelineEvent};
use crate::types::{CallDescriptor, MergedCall, Response, TargetKey};
use crate::{Error, Result};
use futures::future::{join_all, BoxFuture};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Performs the single upstream call for a flushed bucket.
pub type MergedSend = Arc<dyn Fn(MergedCall) -> BoxFuture<'static, Result<Response>> + Send + Sync>;

/// Why a bucket was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    Full,
    Timer,
}

struct Entry {
    call: CallDescriptor,
    tx: oneshot::Sender<Result<Response>>,
}

impl Entry {
    fn is_live(&self) -> bool {
        !self.call.is_cancelled() && !self.tx.is_closed()
    }

    /// Resolves once the caller can no longer receive a result.
    async fn abandoned(&mut self) {
        match self.call.cancellation().cloned() {
            Some(token) => tokio::select! {
                _ = token.cancelled() => {}
                _ = self.tx.closed() => {}
            },
            None => self.tx.closed().await,
        }
    }
}

struct Inner {
    collector: BatchCollector<Entry>,
    send: MergedSend,
    events: Arc<dyn EventSink>,
}

/// Groups idempotent calls that share a target into buckets and performs one merged
/// upstream call per bucket.
///
/// Results are fanned back out by item id. A failed merged call fails every entry of the
/// bucket with the same error.
#[derive(Clone)]
pub struct BatchCoordinator {
    inner: Arc<Inner>,
}

impl BatchCoordinator {
    pub fn new(config: BatchConfig, send: MergedSend) -> Self {
        Self::with_event_sink(config, send, noop_sink())
    }

    pub fn with_event_sink(config: BatchConfig, send: MergedSend, events: Arc<dyn EventSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                collector: BatchCollector::new(config),
                send,
                events,
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        self.inner.collector.config()
    }

    /// Batch `call` if it is batchable; otherwise run `next` directly.
    pub async fn execute<F, Fut>(&self, call: &CallDescriptor, next: F) -> Result<Response>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Response>>,
    {
        if !call.is_batchable() {
            return next().await;
        }
        if call.is_cancelled() {
            return Err(Error::cancelled(Stage::Batch));
        }

        let (tx, rx) = oneshot::channel();
        let key = call.target().clone();
        let item = BatchItem::new(Entry {
            call: call.clone(),
            tx,
        })
        .with_request_id(call.id())
        .with_priority(call.priority());

        match self.inner.collector.add(&key, item) {
            BatchAddResult::Opened { generation } => {
                let inner = self.inner.clone();
                let delay = inner.collector.config().batch_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(items) = inner.collector.take(&key, generation) {
                        flush(inner, key, items, FlushReason::Timer).await;
                    }
                });
            }
            BatchAddResult::Full { items } => {
                tokio::spawn(flush(self.inner.clone(), key, items, FlushReason::Full));
            }
            BatchAddResult::Added { .. } => {}
        }

        let delivered = match call.cancellation() {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::cancelled(Stage::Batch)),
                r = rx => r,
            },
            None => rx.await,
        };
        delivered.unwrap_or_else(|_| Err(Error::cancelled(Stage::Batch)))
    }

    /// Entries waiting for a flush, per target. Entries whose caller has cancelled or gone
    /// away are not counted.
    pub fn pending(&self) -> BTreeMap<TargetKey, usize> {
        self.inner.collector.pending_where(Entry::is_live)
    }
}

async fn flush(inner: Arc<Inner>, key: TargetKey, items: Vec<BatchItem<Entry>>, reason: FlushReason) {
    let mut live: Vec<Entry> = items
        .into_iter()
        .map(|i| i.data)
        .filter(Entry::is_live)
        .collect();
    if live.is_empty() {
        debug!(target_key = %key, "batch dropped, every entry was cancelled");
        return;
    }

    let calls: Vec<CallDescriptor> = live.iter().map(|e| e.call.clone()).collect();
    let Some(merged) = MergedCall::from_calls(&calls) else {
        return;
    };
    for call in &calls {
        call.metadata().record_batch_size(calls.len());
    }
    debug!(
        target_key = %key,
        size = calls.len(),
        items = merged.items().len(),
        reason = ?reason,
        "flushing batch"
    );
    inner.events.record(PipelineEvent::BatchFlushed {
        target: key.clone(),
        size: calls.len(),
        reason,
    });

    let cancel = CancellationToken::new();
    let mut send = (inner.send)(merged.with_cancellation(cancel.clone()));
    let finished = tokio::select! {
        r = &mut send => Some(r),
        _ = join_all(live.iter_mut().map(|e| e.abandoned())) => None,
    };
    let result = match finished {
        Some(r) => r,
        None => {
            debug!(target_key = %key, "every batch entry went away, cancelling merged call");
            cancel.cancel();
            send.await
        }
    };

    let cfg = inner.collector.config();
    match result {
        Ok(aggregate) => {
            for entry in live {
                let out = fan_out(&aggregate, &key, entry.call.item(), cfg);
                let _ = entry.tx.send(out);
            }
        }
        Err(err) => {
            for entry in live {
                let _ = entry.tx.send(Err(err.clone()));
            }
        }
    }
}

/// Elements of an aggregate body: a top-level array, or an array under `data`, `items` or
/// `results`.
fn elements(body: &Value) -> Option<&Vec<Value>> {
    match body {
        Value::Array(a) => Some(a),
        Value::Object(m) => ["data", "items", "results"]
            .iter()
            .find_map(|k| m.get(*k).and_then(Value::as_array)),
        _ => None,
    }
}

fn id_matches(value: Option<&Value>, item: &str) -> bool {
    match value {
        Some(Value::String(s)) => s == item,
        Some(Value::Number(n)) => n.to_string() == item,
        _ => false,
    }
}

fn fan_out(
    aggregate: &Response,
    target: &TargetKey,
    item: Option<&str>,
    cfg: &BatchConfig,
) -> Result<Response> {
    let found = item.and_then(|item| {
        elements(&aggregate.body)?
            .iter()
            .find(|el| id_matches(el.get(cfg.id_field.as_str()), item))
    });
    match (found, cfg.fan_out) {
        (Some(el), _) => Ok(aggregate.with_body(el.clone())),
        (None, FanOutMode::Passthrough) => Ok(aggregate.clone()),
        (None, FanOutMode::Strict) => Err(Error::BatchItemMissing {
            target: target.clone(),
            item: item.unwrap_or_default().to_string(),
        }),
    }
}
