//! 弹性模式模块：提供熔断器、准入控制和重试编排等可靠性保障机制。
//!
//! # Resilience Primitives Module
//!
//! The per-call gates that decide whether, when and how many times an outbound call runs.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Per-target circuit breaker for failure isolation |
//! | [`admission`] | Concurrency cap, sliding-window rate limit and priority wait queue |
//! | [`retry`] | Bounded retries with exponential backoff |
//!
//! ## Circuit Breaker
//!
//! - **Closed**: Normal operation, requests pass through
//! - **Open**: Failures exceeded threshold, requests fail fast
//! - **Half-Open**: Testing if service has recovered
//!
//! ```rust
//! use resilient_pipeline::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use resilient_pipeline::types::{CallDescriptor, TargetKey};
//! use std::time::Duration;
//!
//! # async fn demo() -> resilient_pipeline::Result<()> {
//! let config = CircuitBreakerConfig::new()
//!     .with_failure_threshold(5)
//!     .with_reset_timeout(Duration::from_secs(30));
//! let breaker = CircuitBreaker::new(TargetKey::new("GET", "/users"), config);
//!
//! let call = CallDescriptor::new("GET", "/users");
//! let value = breaker.execute(&call, || async { Ok(42) }).await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```
//!
//! ## Admission Controller
//!
//! ```rust
//! use resilient_pipeline::resilience::admission::{AdmissionConfig, AdmissionController};
//! use resilient_pipeline::types::CallDescriptor;
//!
//! # async fn demo() -> resilient_pipeline::Result<()> {
//! let limiter = AdmissionController::new(
//!     AdmissionConfig::new().with_max_concurrent(4).with_max_requests(100),
//! );
//! let call = CallDescriptor::new("GET", "/users").with_priority(10);
//! limiter.execute(&call, || async { Ok(()) }).await?;
//! # Ok(())
//! # }
//! ```

pub mod admission;
pub mod circuit_breaker;
pub mod retry;

pub use admission::{
    AdmissionConfig, AdmissionController, AdmissionPermit, AdmissionRegistry, AdmissionScope,
    AdmissionSnapshot,
};
pub use circuit_breaker::{
    default_failure_classifier, server_failure_classifier, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerRegistry, CircuitBreakerSnapshot, CircuitState, FailureClassifier,
};
pub use retry::{default_retry_predicate, RetryConfig, RetryOrchestrator, RetryPredicate};
