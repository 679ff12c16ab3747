//! 传输层模块：管线末端执行实际网络调用的可插拔接口。
//!
//! # Transport Layer
//!
//! The pipeline never talks to the network itself. Every admitted attempt ends in a call to
//! a [`Transport`], which must apply its own timeout and may honour the call's cancellation
//! token. Dropping the returned future is how the pipeline aborts an in-flight call.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Transport`] | Trait implemented by anything that can perform a call |
//! | [`HttpTransport`] | reqwest-backed implementation (feature `http`) |

use crate::types::{CallDescriptor, MergedCall, Response};
use crate::{Error, ErrorContext, Result};
use async_trait::async_trait;

#[cfg(feature = "http")]
pub mod http;

#[cfg(feature = "http")]
pub use http::{HttpTransport, HttpTransportConfig};

/// Performs calls on behalf of the pipeline.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Perform a single call.
    async fn send(&self, call: &CallDescriptor) -> Result<Response>;

    /// Perform a merged call standing in for a batch of item lookups.
    ///
    /// Transports that cannot express merged calls keep the default, which refuses them.
    async fn send_batch(&self, merged: &MergedCall) -> Result<Response> {
        Err(Error::configuration_with_context(
            "transport does not support merged calls",
            ErrorContext::new()
                .with_details(format!("target {}", merged.target()))
                .with_source("transport"),
        ))
    }
}
