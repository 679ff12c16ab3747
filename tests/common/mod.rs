//! Shared fixtures: a deterministic in-memory transport and pipeline helpers.
#![allow(dead_code)]

use async_trait::async_trait;
use resilient_pipeline::{
    CallDescriptor, Error, MergedCall, Pipeline, PipelineConfig, Response, Result, Transport,
};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

type Handler = dyn Fn(&CallDescriptor, u32) -> Result<Response> + Send + Sync;

/// Transport stub. `handler` receives the call and the 1-based send counter.
pub struct StubTransport {
    handler: Box<Handler>,
    delay: Duration,
    batch_failure: Option<Error>,
    sends: AtomicU32,
    batch_sends: AtomicU32,
    log: Mutex<Vec<(String, Instant)>>,
}

impl StubTransport {
    pub fn new(
        handler: impl Fn(&CallDescriptor, u32) -> Result<Response> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            delay: Duration::ZERO,
            batch_failure: None,
            sends: AtomicU32::new(0),
            batch_sends: AtomicU32::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Answers every call with `{"path": ..., "n": ...}`.
    pub fn ok() -> Self {
        Self::new(|call, n| Ok(Response::ok(json!({ "path": call.path(), "n": n }))))
    }

    /// Fails every call with `status` and the message `failure #n`.
    pub fn failing(status: u16) -> Self {
        Self::new(move |_, n| Err(Error::upstream(status, format!("failure #{n}"))))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_batch_failure(mut self, err: Error) -> Self {
        self.batch_failure = Some(err);
        self
    }

    pub fn sends(&self) -> u32 {
        self.sends.load(Ordering::SeqCst)
    }

    pub fn batch_sends(&self) -> u32 {
        self.batch_sends.load(Ordering::SeqCst)
    }

    /// Paths in the order the transport saw them.
    pub fn paths(&self) -> Vec<String> {
        self.log.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn send_times(&self) -> Vec<Instant> {
        self.log.lock().unwrap().iter().map(|(_, t)| *t).collect()
    }

    fn record(&self, path: String) {
        self.log.lock().unwrap().push((path, Instant::now()));
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn send(&self, call: &CallDescriptor) -> Result<Response> {
        let n = self.sends.fetch_add(1, Ordering::SeqCst) + 1;
        self.record(call.path());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.handler)(call, n)
    }

    async fn send_batch(&self, merged: &MergedCall) -> Result<Response> {
        self.batch_sends.fetch_add(1, Ordering::SeqCst);
        self.record(format!(
            "{}?ids={}",
            merged.target().route(),
            merged.items().join(",")
        ));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(err) = &self.batch_failure {
            return Err(err.clone());
        }
        let data: Vec<_> = merged
            .items()
            .iter()
            .map(|id| json!({ "id": id, "name": format!("user-{id}") }))
            .collect();
        Ok(Response::ok(json!({ "data": data })))
    }
}

pub fn pipeline(config: PipelineConfig, transport: Arc<StubTransport>) -> Pipeline {
    Pipeline::builder()
        .with_config(config)
        .transport_arc(transport)
        .build()
        .expect("valid pipeline")
}

pub fn spawn_call(pipeline: &Pipeline, call: CallDescriptor) -> JoinHandle<Result<Response>> {
    let pipeline = pipeline.clone();
    tokio::spawn(async move { pipeline.execute(&call).await })
}

/// Yield until `cond` holds. Does not advance a paused clock.
pub async fn wait_until(cond: impl Fn() -> bool) {
    while !cond() {
        tokio::task::yield_now().await;
    }
}
