use crate::types::TargetKey;
use crate::utils::millis;
use std::time::Duration;
use thiserror::Error;

/// Structured error context for configuration problems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "admission.max_concurrent")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "pipeline_config", "http_transport")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Pipeline stage that produced a timeout or observed a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Breaker,
    Admission,
    Batch,
    Retry,
    Transport,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Stage::Breaker => "breaker",
            Stage::Admission => "admission",
            Stage::Batch => "batch",
            Stage::Retry => "retry",
            Stage::Transport => "transport",
        };
        f.write_str(s)
    }
}

/// Unified error type for the execution pipeline.
///
/// The set is closed: each component either adds its own variant or passes the inner
/// error through unchanged. Retries never wrap errors, so the last upstream failure
/// reaches the caller with its identity intact.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("circuit open for {target}{}", format_retry_after(.retry_after_ms))]
    CircuitOpen {
        target: TargetKey,
        /// Time left until the breaker will admit a half-open probe.
        retry_after_ms: Option<u64>,
    },

    #[error("admission queue full for {target} (capacity {capacity})")]
    QueueFull { target: TargetKey, capacity: usize },

    #[error("call cancelled while in {stage}")]
    Cancelled { stage: Stage },

    #[error("deadline of {after_ms}ms exceeded in {stage}")]
    Timeout { stage: Stage, after_ms: u64 },

    #[error("upstream error{}: {message}", format_status(.status))]
    Upstream {
        /// HTTP status, or `None` when no response was received at all.
        status: Option<u16>,
        code: Option<String>,
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("batch response for {target} has no item {item}")]
    BatchItemMissing { target: TargetKey, item: String },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },
}

/// Fieldless discriminant of [`Error`], convenient for metrics labels and matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CircuitOpen,
    QueueFull,
    Cancelled,
    Timeout,
    Upstream,
    BatchItemMissing,
    Configuration,
}

fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

fn format_status(status: &Option<u16>) -> String {
    match status {
        Some(s) => format!(" (HTTP {})", s),
        None => " (no response)".to_string(),
    }
}

fn format_retry_after(ms: &Option<u64>) -> String {
    match ms {
        Some(ms) => format!(", retry in {}ms", ms),
        None => String::new(),
    }
}

impl Error {
    /// Error for a response that arrived with a failing status.
    pub fn upstream(status: u16, message: impl Into<String>) -> Self {
        Error::Upstream {
            status: Some(status),
            code: None,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    /// Error for a call that never produced a response (connect failure, reset, DNS...).
    pub fn network(message: impl Into<String>) -> Self {
        Error::Upstream {
            status: None,
            code: None,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn timeout(stage: Stage, after: Duration) -> Self {
        Error::Timeout {
            stage,
            after_ms: millis(after),
        }
    }

    pub fn cancelled(stage: Stage) -> Self {
        Error::Cancelled { stage }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Attach a provider error code to an upstream error. Other variants are returned as-is.
    pub fn with_code(mut self, new_code: impl Into<String>) -> Self {
        if let Error::Upstream { code, .. } = &mut self {
            *code = Some(new_code.into());
        }
        self
    }

    /// Attach a `Retry-After` hint to an upstream error. Other variants are returned as-is.
    pub fn with_retry_after(mut self, after: Duration) -> Self {
        if let Error::Upstream { retry_after_ms, .. } = &mut self {
            *retry_after_ms = Some(millis(after));
        }
        self
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::QueueFull { .. } => ErrorKind::QueueFull,
            Error::Cancelled { .. } => ErrorKind::Cancelled,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Upstream { .. } => ErrorKind::Upstream,
            Error::BatchItemMissing { .. } => ErrorKind::BatchItemMissing,
            Error::Configuration { .. } => ErrorKind::Configuration,
        }
    }

    /// HTTP status carried by an upstream error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Upstream { status, .. } => *status,
            _ => None,
        }
    }

    /// True when the upstream call failed without producing any response.
    pub fn is_network(&self) -> bool {
        matches!(self, Error::Upstream { status: None, .. })
    }

    /// Server-provided hint for how long to wait before the next attempt.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::Upstream {
                retry_after_ms: Some(ms),
                ..
            } => Some(Duration::from_millis(*ms)),
            Error::CircuitOpen {
                retry_after_ms: Some(ms),
                ..
            } => Some(Duration::from_millis(*ms)),
            _ => None,
        }
    }

    /// Errors raised by the pipeline itself rather than by the target.
    pub fn is_local_rejection(&self) -> bool {
        matches!(
            self,
            Error::CircuitOpen { .. }
                | Error::QueueFull { .. }
                | Error::Cancelled { .. }
                | Error::Configuration { .. }
        )
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. } => Some(context),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_structured_fields() {
        let err = Error::upstream(503, "service unavailable");
        assert_eq!(
            err.to_string(),
            "upstream error (HTTP 503): service unavailable"
        );

        let err = Error::network("connection reset");
        assert_eq!(err.to_string(), "upstream error (no response): connection reset");

        let err = Error::CircuitOpen {
            target: TargetKey::new("GET", "/users"),
            retry_after_ms: Some(250),
        };
        assert_eq!(err.to_string(), "circuit open for GET /users, retry in 250ms");
    }

    #[test]
    fn test_huge_durations_saturate() {
        let err = Error::timeout(Stage::Breaker, Duration::MAX);
        assert!(matches!(err, Error::Timeout { after_ms: u64::MAX, .. }));
        let err = Error::upstream(429, "slow down").with_retry_after(Duration::MAX);
        assert_eq!(err.retry_after(), Some(Duration::from_millis(u64::MAX)));
    }

    #[test]
    fn test_configuration_context_formatting() {
        let err = Error::configuration_with_context(
            "max_concurrent must be at least 1",
            ErrorContext::new()
                .with_field_path("admission.max_concurrent")
                .with_source("pipeline_config"),
        );
        assert_eq!(
            err.to_string(),
            "Configuration error: max_concurrent must be at least 1 (field: admission.max_concurrent, source: pipeline_config)"
        );
        assert_eq!(
            err.context().and_then(|c| c.field_path.as_deref()),
            Some("admission.max_concurrent")
        );
    }

    #[test]
    fn test_structured_accessors() {
        let err = Error::upstream(429, "slow down")
            .with_code("rate_limited")
            .with_retry_after(Duration::from_secs(2));
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert_eq!(err.status(), Some(429));
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
        assert!(!err.is_network());
        assert!(!err.is_local_rejection());

        let err = Error::cancelled(Stage::Admission);
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(err.is_local_rejection());
        assert_eq!(err.status(), None);
        assert_eq!(err.retry_after(), None);
    }
}
