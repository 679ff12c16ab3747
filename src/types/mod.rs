//! 类型系统模块：定义调用描述符、目标键与响应等核心数据类型。
//!
//! # Types Module
//!
//! Value types that flow through the execution pipeline. Components exchange these by
//! value; none of them hold references into another component's state.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`CallDescriptor`] | Immutable description of one logical outbound call |
//! | [`TargetKey`] | Grouping identity (method + base route) |
//! | [`CallMetadata`] | Observability counters attached to a descriptor |
//! | [`MergedCall`] | One upstream call standing in for a bucket of batched calls |
//! | [`Response`] | Transport response handed back to callers |
//!
//! ## Example
//!
//! ```rust
//! use resilient_pipeline::types::CallDescriptor;
//! use std::time::Duration;
//!
//! let call = CallDescriptor::for_path("GET", "/users/42")
//!     .with_priority(3)
//!     .with_timeout(Duration::from_secs(2));
//!
//! assert_eq!(call.target().route(), "/users");
//! assert_eq!(call.item(), Some("42"));
//! assert!(call.is_idempotent());
//! ```

pub mod call;
pub mod response;

pub use call::{CallDescriptor, CallMetadata, MergedCall, TargetKey};
pub use response::Response;
