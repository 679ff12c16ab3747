//! Call descriptors and target keys.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Grouping identity of a call: HTTP method plus base route, without per-item identifiers.
///
/// Breaker state, per-target admission accounting and batch buckets are all keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TargetKey {
    method: String,
    route: String,
}

impl TargetKey {
    pub fn new(method: impl AsRef<str>, route: impl Into<String>) -> Self {
        Self {
            method: method.as_ref().to_ascii_uppercase(),
            route: route.into(),
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn route(&self) -> &str {
        &self.route
    }
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.method, self.route)
    }
}

/// Bookkeeping attached to a call for observability only.
///
/// Shared between clones of the same descriptor so that the caller can read what the
/// pipeline recorded after the call resolves. No component reads these values back to
/// make a decision.
#[derive(Debug, Default)]
pub struct CallMetadata {
    attempts: AtomicU32,
    batch_size: AtomicUsize,
}

impl CallMetadata {
    /// Number of transport attempts made so far (0 before the first attempt starts).
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Size of the batch this call was merged into, if it was batched.
    pub fn batch_size(&self) -> Option<usize> {
        match self.batch_size.load(Ordering::Relaxed) {
            0 => None,
            n => Some(n),
        }
    }

    pub(crate) fn record_attempts(&self, attempts: u32) {
        self.attempts.store(attempts, Ordering::Relaxed);
    }

    pub(crate) fn record_batch_size(&self, size: usize) {
        self.batch_size.store(size, Ordering::Relaxed);
    }
}

/// Immutable description of one logical outbound call.
#[derive(Debug, Clone)]
pub struct CallDescriptor {
    id: String,
    target: TargetKey,
    item: Option<String>,
    priority: i32,
    idempotent: bool,
    batching: bool,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    body: Option<serde_json::Value>,
    metadata: Arc<CallMetadata>,
}

fn is_idempotent_method(method: &str) -> bool {
    matches!(method, "GET" | "HEAD" | "OPTIONS")
}

impl CallDescriptor {
    /// Describe a call to `route` with no per-item identifier.
    pub fn new(method: impl AsRef<str>, route: impl Into<String>) -> Self {
        let target = TargetKey::new(method, route);
        let idempotent = is_idempotent_method(target.method());
        Self {
            id: Uuid::new_v4().to_string(),
            target,
            item: None,
            priority: 0,
            idempotent,
            batching: true,
            timeout: None,
            cancel: None,
            body: None,
            metadata: Arc::new(CallMetadata::default()),
        }
    }

    /// Describe a call to a full path, splitting the trailing segment off as the item id.
    ///
    /// `/users/42` becomes route `/users` with item `42`. A single-segment path such as
    /// `/users` keeps the whole path as the route and carries no item. Query strings and
    /// trailing slashes are ignored.
    pub fn for_path(method: impl AsRef<str>, path: &str) -> Self {
        let path = path.split(['?', '#']).next().unwrap_or("");
        let path = path.trim_end_matches('/');
        match path.rsplit_once('/') {
            Some((base, item)) if !base.is_empty() && !item.is_empty() => {
                Self::new(method, base).with_item(item)
            }
            _ => Self::new(method, if path.is_empty() { "/" } else { path }),
        }
    }

    pub fn with_item(mut self, item: impl Into<String>) -> Self {
        self.item = Some(item.into());
        self
    }

    /// Higher priority is served first when the admission queue is contended.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Override the method-derived idempotency flag.
    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Opt this call out of (or back into) request batching.
    pub fn with_batching(mut self, enabled: bool) -> Self {
        self.batching = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn target(&self) -> &TargetKey {
        &self.target
    }

    pub fn method(&self) -> &str {
        self.target.method()
    }

    pub fn item(&self) -> Option<&str> {
        self.item.as_deref()
    }

    /// Route plus item, i.e. the path the transport should address.
    pub fn path(&self) -> String {
        match &self.item {
            Some(item) => format!("{}/{}", self.target.route().trim_end_matches('/'), item),
            None => self.target.route().to_string(),
        }
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn is_idempotent(&self) -> bool {
        self.idempotent
    }

    /// Whether this call may be merged with others: idempotent, addressed to one item, and
    /// not opted out by the caller.
    pub fn is_batchable(&self) -> bool {
        self.idempotent && self.batching && self.item.is_some()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancel.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().map(|t| t.is_cancelled()).unwrap_or(false)
    }

    pub fn body(&self) -> Option<&serde_json::Value> {
        self.body.as_ref()
    }

    pub fn metadata(&self) -> &CallMetadata {
        &self.metadata
    }
}

/// One upstream call that stands in for a bucket of batched calls.
#[derive(Debug, Clone)]
pub struct MergedCall {
    descriptor: CallDescriptor,
    items: Vec<String>,
    members: Vec<Arc<CallMetadata>>,
}

impl MergedCall {
    /// Merge calls sharing a target. Returns `None` for an empty set.
    ///
    /// The merged descriptor carries the highest priority and the shortest timeout of
    /// its members. Its cancellation token is attached separately, see
    /// [`MergedCall::with_cancellation`].
    pub fn from_calls(calls: &[CallDescriptor]) -> Option<Self> {
        let first = calls.first()?;
        let mut descriptor = CallDescriptor::new(first.method(), first.target().route())
            .with_idempotent(true)
            .with_batching(false);
        descriptor.priority = calls.iter().map(|c| c.priority).max().unwrap_or(0);
        descriptor.timeout = calls.iter().filter_map(|c| c.timeout).min();

        let mut items: Vec<String> = Vec::with_capacity(calls.len());
        for call in calls {
            if let Some(item) = call.item() {
                if !items.iter().any(|i| i == item) {
                    items.push(item.to_string());
                }
            }
        }
        let members = calls.iter().map(|c| c.metadata.clone()).collect();
        Some(Self {
            descriptor,
            items,
            members,
        })
    }

    /// Token that cancels the merged call itself, independent of any member's token.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.descriptor.cancel = Some(token);
        self
    }

    pub fn descriptor(&self) -> &CallDescriptor {
        &self.descriptor
    }

    /// Distinct item ids requested by the bucket, in arrival order.
    pub fn items(&self) -> &[String] {
        &self.items
    }

    pub fn target(&self) -> &TargetKey {
        self.descriptor.target()
    }

    /// Number of calls merged into this one.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Copy the merged call's attempt count onto every member call.
    pub(crate) fn record_member_attempts(&self) {
        let attempts = self.descriptor.metadata().attempts();
        for m in &self.members {
            m.record_attempts(attempts);
        }
    }
}
