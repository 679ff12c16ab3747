//! 执行管线模块：将批处理、熔断、准入控制与重试组合为单一调用入口。
//!
//! # Execution Pipeline
//!
//! [`Pipeline`] is the single entry point for outbound calls. It composes the components
//! in a fixed order:
//!
//! ```text
//! batch (batchable calls only)
//!   └─ retry loop
//!        └─ per attempt: circuit breaker → admission → transport
//! ```
//!
//! Batching comes first so that the breaker and admission controller see one call per
//! bucket. Every retry attempt re-enters the breaker and the admission controller, so a
//! tripped breaker stops the remaining retries and no admission slot is held while a
//! backoff delay runs.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Pipeline`] | Composed executor |
//! | [`PipelineBuilder`] | Fluent construction from config, transport and hooks |
//! | [`PipelineConfig`] | Serializable configuration (YAML/JSON/env) |
//! | [`SignalsSnapshot`] | Read-only observability snapshot |
//!
//! ## Example
//!
//! ```rust,no_run
//! use resilient_pipeline::{CallDescriptor, HttpTransport, Pipeline, PipelineConfig};
//!
//! # async fn demo() -> resilient_pipeline::Result<()> {
//! let pipeline = Pipeline::builder()
//!     .with_config(PipelineConfig::load("pipeline.yaml")?.with_env_overrides())
//!     .transport(HttpTransport::new("https://api.example.com")?)
//!     .build()?;
//!
//! let call = CallDescriptor::for_path("GET", "/users/42").with_priority(5);
//! let user = pipeline.execute(&call).await?;
//! println!("{} after {} attempt(s)", user.body, call.metadata().attempts());
//! # Ok(())
//! # }
//! ```

mod builder;
mod config;
mod signals;

pub use builder::PipelineBuilder;
pub use config::{AdmissionSection, BatchSection, BreakerSection, PipelineConfig, RetrySection};
pub use signals::SignalsSnapshot;

use crate::batch::BatchCoordinator;
use crate::error::Stage;
use crate::resilience::admission::AdmissionRegistry;
use crate::resilience::circuit_breaker::CircuitBreakerRegistry;
use crate::resilience::retry::RetryOrchestrator;
use crate::telemetry::{EventSink, PipelineEvent};
use crate::transport::Transport;
use crate::types::{CallDescriptor, MergedCall, Response};
use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub(crate) struct Inner {
    config: PipelineConfig,
    transport: Arc<dyn Transport>,
    breakers: Option<CircuitBreakerRegistry>,
    admission: Option<AdmissionRegistry>,
    retry: Option<RetryOrchestrator>,
    batch: Option<BatchCoordinator>,
    events: Arc<dyn EventSink>,
}

/// Composed execution pipeline. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// Execute one call through the pipeline.
    ///
    /// The descriptor's metadata records the attempts made and, for batched calls, the
    /// batch size.
    pub async fn execute(&self, call: &CallDescriptor) -> Result<Response> {
        let inner = &self.inner;
        let result = match &inner.batch {
            Some(batch) => batch.execute(call, || inner.run(call)).await,
            None => inner.run(call).await,
        };

        if let Err(e) = &result {
            debug!(target_key = %call.target(), call_id = call.id(), error = %e, "call failed");
        }
        inner.events.record(PipelineEvent::Finished {
            call_id: call.id().to_string(),
            target: call.target().clone(),
            attempts: call.metadata().attempts(),
            error: result.as_ref().err().map(Error::kind),
        });
        result
    }

    pub fn signals(&self) -> SignalsSnapshot {
        let inner = &self.inner;
        SignalsSnapshot {
            breakers: inner
                .breakers
                .as_ref()
                .map(|b| b.snapshots())
                .unwrap_or_default(),
            admission: inner
                .admission
                .as_ref()
                .map(|a| a.snapshots())
                .unwrap_or_default(),
            batch_pending: inner
                .batch
                .as_ref()
                .map(|b| {
                    b.pending()
                        .into_iter()
                        .map(|(k, n)| (k.to_string(), n))
                        .collect()
                })
                .unwrap_or_default(),
            retry_attempts: inner
                .retry
                .as_ref()
                .map(|r| r.histogram())
                .unwrap_or_default(),
        }
    }
}

impl Inner {
    /// Retry loop around single-call attempts.
    async fn run(&self, call: &CallDescriptor) -> Result<Response> {
        self.with_retries(call, || self.transport.send(call)).await
    }

    /// Retry loop around a merged batch call.
    pub(crate) async fn run_merged(&self, merged: MergedCall) -> Result<Response> {
        let call = merged.descriptor();
        let result = self
            .with_retries(call, || self.transport.send_batch(&merged))
            .await;
        merged.record_member_attempts();
        result
    }

    async fn with_retries<S, Fut>(&self, call: &CallDescriptor, send: S) -> Result<Response>
    where
        S: Fn() -> Fut,
        Fut: Future<Output = Result<Response>>,
    {
        match &self.retry {
            Some(retry) => retry.execute(call, |_| self.attempt(call, &send)).await,
            None => {
                let result = self.attempt(call, &send).await;
                call.metadata().record_attempts(1);
                result
            }
        }
    }

    /// One attempt: breaker, then admission, then the transport.
    async fn attempt<S, Fut>(&self, call: &CallDescriptor, send: &S) -> Result<Response>
    where
        S: Fn() -> Fut,
        Fut: Future<Output = Result<Response>>,
    {
        let admitted = move || async move {
            match &self.admission {
                Some(admission) => admission.get(call.target()).execute(call, send).await,
                None => cancellable(call, send()).await,
            }
        };
        match &self.breakers {
            Some(breakers) => breakers.get(call.target()).execute(call, admitted).await,
            None => admitted().await,
        }
    }
}

/// Race `fut` against the call's cancellation token.
async fn cancellable<T>(call: &CallDescriptor, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match call.cancellation() {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(Error::cancelled(Stage::Transport)),
            r = fut => r,
        },
        None => fut.await,
    }
}
