//! # resilient-pipeline
//!
//! 弹性请求执行管线：为每一次出站调用决定是否执行、何时执行以及执行几次。
//!
//! Resilient request execution pipeline - decides, for every outbound call, whether, when
//! and how many times to actually perform it.
//!
//! ## Overview
//!
//! Four components collaborate around a single call contract and compose deterministically:
//!
//! - **Circuit Breaker**: per-target failure isolation with lazy half-open probing
//! - **Admission Controller**: concurrency cap, sliding-window rate limit and a
//!   priority-ordered wait queue
//! - **Batch Coordinator**: merges idempotent item lookups on the same target into one
//!   upstream call and fans the result back out
//! - **Retry Orchestrator**: bounded retries with exponential backoff
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resilient_pipeline::{CallDescriptor, HttpTransport, Pipeline};
//!
//! #[tokio::main]
//! async fn main() -> resilient_pipeline::Result<()> {
//!     let pipeline = Pipeline::builder()
//!         .transport(HttpTransport::new("https://api.example.com")?)
//!         .build()?;
//!
//!     let call = CallDescriptor::for_path("GET", "/users/42");
//!     let response = pipeline.execute(&call).await?;
//!     println!("{}", response.body);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`pipeline`] | Composed pipeline, builder, configuration and signals |
//! | [`resilience`] | Circuit breaker, admission controller and retry orchestrator |
//! | [`batch`] | Per-target request batching |
//! | [`transport`] | Transport trait and the reqwest-backed HTTP transport |
//! | [`types`] | Call descriptors, target keys and responses |
//! | [`telemetry`] | Pipeline events and event sinks |

pub mod batch;
pub mod pipeline;
pub mod resilience;
pub mod telemetry;
pub mod transport;
pub mod types;

pub(crate) mod utils;

// Re-export main types for convenience
pub use pipeline::{Pipeline, PipelineBuilder, PipelineConfig, SignalsSnapshot};
pub use telemetry::{EventSink, PipelineEvent};
pub use transport::Transport;
pub use types::{CallDescriptor, MergedCall, Response, TargetKey};

#[cfg(feature = "http")]
pub use transport::HttpTransport;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext, ErrorKind, Stage};
