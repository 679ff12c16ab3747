use super::{Inner, Pipeline, PipelineConfig};
use crate::batch::{BatchCoordinator, MergedSend};
use crate::error::Stage;
use crate::resilience::admission::AdmissionRegistry;
use crate::resilience::circuit_breaker::{
    default_failure_classifier, CircuitBreakerRegistry, FailureClassifier,
};
use crate::resilience::retry::{default_retry_predicate, RetryOrchestrator, RetryPredicate};
use crate::telemetry::{noop_sink, EventSink};
use crate::transport::Transport;
use crate::types::MergedCall;
use crate::{Error, ErrorContext, Result};
use futures::FutureExt;
use std::sync::{Arc, Weak};

/// Builder for creating pipelines with custom configuration.
///
/// Every component is on by default except batching, which needs a transport that
/// implements merged calls.
pub struct PipelineBuilder {
    config: PipelineConfig,
    transport: Option<Arc<dyn Transport>>,
    retry_predicate: Option<RetryPredicate>,
    failure_classifier: Option<FailureClassifier>,
    events: Arc<dyn EventSink>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            transport: None,
            retry_predicate: None,
            failure_classifier: None,
            events: noop_sink(),
        }
    }

    /// Replace the whole configuration.
    pub fn with_config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Use a shared transport.
    pub fn transport_arc(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Decide which failures are retried. Default: [`default_retry_predicate`].
    pub fn retry_predicate(mut self, predicate: RetryPredicate) -> Self {
        self.retry_predicate = Some(predicate);
        self
    }

    /// Decide which failures count against a breaker. Default: [`default_failure_classifier`].
    pub fn failure_classifier(mut self, classifier: FailureClassifier) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Inject an event sink. Default is a no-op sink.
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    pub fn circuit_breaker(mut self, enable: bool) -> Self {
        self.config.breaker.enabled = enable;
        self
    }

    pub fn admission(mut self, enable: bool) -> Self {
        self.config.admission.enabled = enable;
        self
    }

    pub fn batching(mut self, enable: bool) -> Self {
        self.config.batch.enabled = enable;
        self
    }

    pub fn retries(mut self, enable: bool) -> Self {
        self.config.retry.enabled = enable;
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        let transport = self.transport.ok_or_else(|| {
            Error::configuration_with_context(
                "a transport is required",
                ErrorContext::new()
                    .with_field_path("transport")
                    .with_source("pipeline_builder"),
            )
        })?;
        self.config.validate()?;

        let config = self.config;
        let events = self.events;

        let breakers = config.breaker.enabled.then(|| {
            CircuitBreakerRegistry::new(
                config.breaker.to_config(),
                self.failure_classifier
                    .unwrap_or_else(default_failure_classifier),
                events.clone(),
            )
        });
        let admission = config.admission.enabled.then(|| {
            AdmissionRegistry::new(
                config.admission.scope,
                config.admission.to_config(),
                events.clone(),
            )
        });
        let retry = config.retry.enabled.then(|| {
            RetryOrchestrator::new(config.retry.to_config())
                .with_predicate(self.retry_predicate.unwrap_or_else(default_retry_predicate))
                .with_event_sink(events.clone())
        });
        let batch_config = config.batch.enabled.then(|| config.batch.to_config());

        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let batch = batch_config.map(|cfg| {
                BatchCoordinator::with_event_sink(cfg, merged_sender(weak.clone()), events.clone())
            });
            Inner {
                config,
                transport,
                breakers,
                admission,
                retry,
                batch,
                events,
            }
        });
        Ok(Pipeline { inner })
    }
}

/// Merged calls go back through the pipeline's retry, breaker and admission stages.
fn merged_sender(pipeline: Weak<Inner>) -> MergedSend {
    Arc::new(move |merged: MergedCall| {
        let pipeline = pipeline.clone();
        async move {
            match pipeline.upgrade() {
                Some(inner) => inner.run_merged(merged).await,
                None => Err(Error::cancelled(Stage::Batch)),
            }
        }
        .boxed()
    })
}
