//! 请求批处理模块：将同一目标的幂等请求合并为一次上游调用。
//!
//! # Request Batching Module
//!
//! Idempotent calls that share a target key and carry an item id are collected into a
//! bucket and sent upstream as one merged call. The aggregate response is fanned back out
//! to each caller by item id.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`BatchCoordinator`] | Buckets calls, flushes them and fans results out |
//! | [`BatchCollector`] | Per-target bucket bookkeeping |
//! | [`BatchConfig`] | Batch size, flush delay, id field and fan-out mode |
//! | [`FanOutMode`] | What an entry gets when its item is missing from the aggregate |
//!
//! ## Flushing
//!
//! A bucket flushes when it reaches `max_batch_size` or when `batch_delay` has passed since
//! its first entry, whichever comes first. Exactly one upstream call is made per bucket, and
//! a failure of that call is delivered to every entry.
//!
//! ## Example
//!
//! ```rust
//! use futures::FutureExt;
//! use resilient_pipeline::batch::{BatchConfig, BatchCoordinator, MergedSend};
//! use resilient_pipeline::types::{CallDescriptor, MergedCall, Response};
//! use resilient_pipeline::Error;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn demo() -> resilient_pipeline::Result<()> {
//! let send: MergedSend = Arc::new(|merged: MergedCall| {
//!     let body: Vec<_> = merged.items().iter().map(|id| json!({ "id": id })).collect();
//!     async move { Ok::<_, Error>(Response::ok(json!(body))) }.boxed()
//! });
//! let coordinator = BatchCoordinator::new(BatchConfig::new().with_max_batch_size(10), send);
//!
//! let call = CallDescriptor::for_path("GET", "/users/42");
//! let user = coordinator
//!     .execute(&call, || async { Ok(Response::ok(json!(null))) })
//!     .await?;
//! assert_eq!(user.body["id"], "42");
//! # Ok(())
//! # }
//! ```

mod collector;
mod coordinator;

pub use collector::{BatchAddResult, BatchCollector, BatchConfig, BatchItem, FanOutMode};
pub use coordinator::{BatchCoordinator, FlushReason, MergedSend};
