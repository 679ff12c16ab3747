//! Serializable pipeline configuration.
//!
//! Field names follow the documented configuration surface (`failureThreshold`,
//! `resetTimeoutMs`, ...). Every field is optional in a config file; missing fields take
//! the component defaults.

use crate::batch::{BatchConfig, FanOutMode};
use crate::resilience::admission::{AdmissionConfig, AdmissionScope};
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::retry::RetryConfig;
use crate::utils::millis;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BreakerSection {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    /// Zero disables the breaker's own deadline.
    pub request_timeout_ms: u64,
    pub half_open_success_threshold: u32,
    /// Zero means unlimited concurrent probes.
    pub half_open_max_probes: u32,
}

impl Default for BreakerSection {
    fn default() -> Self {
        Self::from(&CircuitBreakerConfig::default())
    }
}

impl From<&CircuitBreakerConfig> for BreakerSection {
    fn from(c: &CircuitBreakerConfig) -> Self {
        Self {
            enabled: true,
            failure_threshold: c.failure_threshold,
            reset_timeout_ms: millis(c.reset_timeout),
            request_timeout_ms: millis(c.request_timeout),
            half_open_success_threshold: c.half_open_success_threshold,
            half_open_max_probes: c.half_open_max_probes,
        }
    }
}

impl BreakerSection {
    pub fn to_config(&self) -> CircuitBreakerConfig {
        CircuitBreakerConfig::new()
            .with_failure_threshold(self.failure_threshold)
            .with_reset_timeout(Duration::from_millis(self.reset_timeout_ms))
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
            .with_half_open_success_threshold(self.half_open_success_threshold)
            .with_half_open_max_probes(self.half_open_max_probes)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AdmissionSection {
    pub enabled: bool,
    pub scope: AdmissionScope,
    pub max_concurrent: usize,
    /// Zero disables the rate window.
    pub max_requests: usize,
    pub window_ms: u64,
    pub max_queue_len: usize,
}

impl Default for AdmissionSection {
    fn default() -> Self {
        let c = AdmissionConfig::default();
        Self {
            enabled: true,
            scope: AdmissionScope::Global,
            max_concurrent: c.max_concurrent,
            max_requests: c.max_requests,
            window_ms: millis(c.window),
            max_queue_len: c.max_queue_len,
        }
    }
}

impl AdmissionSection {
    pub fn to_config(&self) -> AdmissionConfig {
        AdmissionConfig::new()
            .with_max_concurrent(self.max_concurrent)
            .with_max_requests(self.max_requests)
            .with_window(Duration::from_millis(self.window_ms))
            .with_max_queue_len(self.max_queue_len)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchSection {
    /// Off unless asked for; the transport must implement merged calls.
    pub enabled: bool,
    pub max_batch_size: usize,
    pub batch_delay_ms: u64,
    pub id_field: String,
    pub fan_out: FanOutMode,
}

impl Default for BatchSection {
    fn default() -> Self {
        let c = BatchConfig::default();
        Self {
            enabled: false,
            max_batch_size: c.max_batch_size,
            batch_delay_ms: millis(c.batch_delay),
            id_field: c.id_field,
            fan_out: c.fan_out,
        }
    }
}

impl BatchSection {
    pub fn to_config(&self) -> BatchConfig {
        BatchConfig::new()
            .with_max_batch_size(self.max_batch_size)
            .with_batch_delay(Duration::from_millis(self.batch_delay_ms))
            .with_id_field(self.id_field.clone())
            .with_fan_out(self.fan_out)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RetrySection {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
    pub jitter: bool,
}

impl Default for RetrySection {
    fn default() -> Self {
        let c = RetryConfig::default();
        Self {
            enabled: true,
            max_retries: c.max_retries,
            base_delay_ms: millis(c.base_delay),
            max_delay_ms: c.max_delay.map(millis),
            jitter: c.jitter,
        }
    }
}

impl RetrySection {
    pub fn to_config(&self) -> RetryConfig {
        let mut cfg = RetryConfig::new()
            .with_max_retries(self.max_retries)
            .with_base_delay(Duration::from_millis(self.base_delay_ms))
            .with_jitter(self.jitter);
        if let Some(max) = self.max_delay_ms {
            cfg = cfg.with_max_delay(Duration::from_millis(max));
        }
        cfg
    }
}

/// Complete pipeline configuration.
///
/// ```yaml
/// breaker:
///   failureThreshold: 3
///   resetTimeoutMs: 30000
/// admission:
///   maxConcurrent: 4
///   scope: per_target
/// batch:
///   enabled: true
///   maxBatchSize: 20
/// retry:
///   maxRetries: 2
///   baseDelayMs: 200
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub breaker: BreakerSection,
    pub admission: AdmissionSection,
    pub batch: BatchSection,
    pub retry: RetrySection,
}

impl PipelineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        serde_yaml::from_str(s).map_err(|e| parse_error("yaml", e.to_string()))
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(|e| parse_error("json", e.to_string()))
    }

    /// Load from a `.yaml`/`.yml` or `.json` file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration_with_context(
                format!("failed to read config file: {}", e),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("pipeline_config"),
            )
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(Error::configuration_with_context(
                format!("unsupported config file extension: {}", other.unwrap_or("<none>")),
                ErrorContext::new()
                    .with_details(path.display().to_string())
                    .with_source("pipeline_config"),
            )),
        }
    }

    /// Apply `PIPELINE_*` environment variables on top of this configuration.
    ///
    /// Unparsable values are ignored.
    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub(crate) fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn set<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            slot: &mut T,
        ) {
            if let Some(v) = lookup(key).and_then(|s| s.trim().parse::<T>().ok()) {
                *slot = v;
            }
        }

        let b = &mut self.breaker;
        set(&lookup, "PIPELINE_BREAKER_ENABLED", &mut b.enabled);
        set(&lookup, "PIPELINE_BREAKER_FAILURE_THRESHOLD", &mut b.failure_threshold);
        set(&lookup, "PIPELINE_BREAKER_RESET_TIMEOUT_MS", &mut b.reset_timeout_ms);
        set(&lookup, "PIPELINE_BREAKER_REQUEST_TIMEOUT_MS", &mut b.request_timeout_ms);
        set(
            &lookup,
            "PIPELINE_BREAKER_HALF_OPEN_SUCCESS_THRESHOLD",
            &mut b.half_open_success_threshold,
        );
        set(&lookup, "PIPELINE_BREAKER_HALF_OPEN_MAX_PROBES", &mut b.half_open_max_probes);

        let a = &mut self.admission;
        set(&lookup, "PIPELINE_ADMISSION_ENABLED", &mut a.enabled);
        set(&lookup, "PIPELINE_ADMISSION_MAX_CONCURRENT", &mut a.max_concurrent);
        set(&lookup, "PIPELINE_ADMISSION_MAX_REQUESTS", &mut a.max_requests);
        set(&lookup, "PIPELINE_ADMISSION_WINDOW_MS", &mut a.window_ms);
        set(&lookup, "PIPELINE_ADMISSION_MAX_QUEUE_LEN", &mut a.max_queue_len);
        match lookup("PIPELINE_ADMISSION_SCOPE").as_deref().map(str::trim) {
            Some("global") => a.scope = AdmissionScope::Global,
            Some("per_target") => a.scope = AdmissionScope::PerTarget,
            _ => {}
        }

        let bt = &mut self.batch;
        set(&lookup, "PIPELINE_BATCH_ENABLED", &mut bt.enabled);
        set(&lookup, "PIPELINE_BATCH_MAX_BATCH_SIZE", &mut bt.max_batch_size);
        set(&lookup, "PIPELINE_BATCH_DELAY_MS", &mut bt.batch_delay_ms);
        set(&lookup, "PIPELINE_BATCH_ID_FIELD", &mut bt.id_field);
        match lookup("PIPELINE_BATCH_FAN_OUT").as_deref().map(str::trim) {
            Some("passthrough") => bt.fan_out = FanOutMode::Passthrough,
            Some("strict") => bt.fan_out = FanOutMode::Strict,
            _ => {}
        }

        let r = &mut self.retry;
        set(&lookup, "PIPELINE_RETRY_ENABLED", &mut r.enabled);
        set(&lookup, "PIPELINE_RETRY_MAX_RETRIES", &mut r.max_retries);
        set(&lookup, "PIPELINE_RETRY_BASE_DELAY_MS", &mut r.base_delay_ms);
        set(&lookup, "PIPELINE_RETRY_JITTER", &mut r.jitter);
        if let Some(v) = lookup("PIPELINE_RETRY_MAX_DELAY_MS").and_then(|s| s.trim().parse().ok()) {
            r.max_delay_ms = Some(v);
        }

        self
    }

    /// Validate every enabled section.
    pub fn validate(&self) -> Result<()> {
        if self.breaker.enabled {
            self.breaker.to_config().validate()?;
        }
        if self.admission.enabled {
            self.admission.to_config().validate()?;
        }
        if self.batch.enabled {
            self.batch.to_config().validate()?;
        }
        if self.retry.enabled {
            self.retry.to_config().validate()?;
        }
        Ok(())
    }
}

fn parse_error(format: &str, message: String) -> Error {
    Error::configuration_with_context(
        format!("invalid {} pipeline config", format),
        ErrorContext::new()
            .with_details(message)
            .with_source("pipeline_config"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_match_components() {
        let cfg = PipelineConfig::default();
        assert!(cfg.breaker.enabled);
        assert_eq!(cfg.breaker.failure_threshold, 5);
        assert_eq!(cfg.breaker.reset_timeout_ms, 60_000);
        assert_eq!(cfg.breaker.request_timeout_ms, 10_000);
        assert_eq!(cfg.admission.max_concurrent, 10);
        assert_eq!(cfg.admission.max_requests, 50);
        assert_eq!(cfg.admission.window_ms, 1000);
        assert_eq!(cfg.admission.max_queue_len, 1024);
        assert!(!cfg.batch.enabled);
        assert_eq!(cfg.batch.max_batch_size, 5);
        assert_eq!(cfg.batch.batch_delay_ms, 50);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.base_delay_ms, 1000);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_partial_yaml() {
        let cfg = PipelineConfig::from_yaml_str(
            r#"
breaker:
  failureThreshold: 2
admission:
  scope: per_target
  maxConcurrent: 1
batch:
  enabled: true
  fanOut: strict
retry:
  maxDelayMs: 5000
"#,
        )
        .unwrap();
        assert_eq!(cfg.breaker.failure_threshold, 2);
        assert_eq!(cfg.breaker.reset_timeout_ms, 60_000);
        assert_eq!(cfg.admission.scope, AdmissionScope::PerTarget);
        assert_eq!(cfg.admission.max_concurrent, 1);
        assert!(cfg.batch.enabled);
        assert_eq!(cfg.batch.fan_out, FanOutMode::Strict);
        assert_eq!(cfg.retry.to_config().max_delay, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_json_round_trip_names() {
        let json = serde_json::to_value(PipelineConfig::default()).unwrap();
        assert_eq!(json["breaker"]["resetTimeoutMs"], 60_000);
        assert_eq!(json["admission"]["scope"], "global");
        assert_eq!(json["batch"]["fanOut"], "passthrough");
        let back = PipelineConfig::from_json_str(&json.to_string()).unwrap();
        assert_eq!(back, PipelineConfig::default());
    }

    #[test]
    fn test_invalid_documents() {
        let err = PipelineConfig::from_yaml_str("breaker: [1, 2]").unwrap_err();
        assert_eq!(err.context().and_then(|c| c.source.as_deref()), Some("pipeline_config"));
        assert!(PipelineConfig::from_json_str("{").is_err());
    }

    #[test]
    fn test_load_dispatches_on_extension() {
        let dir = std::env::temp_dir();
        let stem = uuid::Uuid::new_v4().to_string();

        let yaml = dir.join(format!("{stem}.yml"));
        std::fs::write(&yaml, "retry:\n  maxRetries: 7\n").unwrap();
        assert_eq!(PipelineConfig::load(&yaml).unwrap().retry.max_retries, 7);

        let json = dir.join(format!("{stem}.json"));
        std::fs::write(&json, r#"{"admission":{"windowMs":250}}"#).unwrap();
        assert_eq!(PipelineConfig::load(&json).unwrap().admission.window_ms, 250);

        let toml = dir.join(format!("{stem}.toml"));
        std::fs::write(&toml, "").unwrap();
        assert!(PipelineConfig::load(&toml).is_err());

        for p in [yaml, json, toml] {
            let _ = std::fs::remove_file(p);
        }
        assert!(PipelineConfig::load(dir.join("missing-pipeline-config.yaml")).is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("PIPELINE_BREAKER_FAILURE_THRESHOLD", "9"),
            ("PIPELINE_ADMISSION_MAX_CONCURRENT", "3"),
            ("PIPELINE_ADMISSION_SCOPE", "per_target"),
            ("PIPELINE_BATCH_ENABLED", "true"),
            ("PIPELINE_RETRY_MAX_RETRIES", "not-a-number"),
            ("PIPELINE_RETRY_MAX_DELAY_MS", "800"),
        ]
        .into_iter()
        .collect();
        let cfg = PipelineConfig::default()
            .apply_overrides(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.breaker.failure_threshold, 9);
        assert_eq!(cfg.admission.max_concurrent, 3);
        assert_eq!(cfg.admission.scope, AdmissionScope::PerTarget);
        assert!(cfg.batch.enabled);
        assert_eq!(cfg.retry.max_retries, 3);
        assert_eq!(cfg.retry.max_delay_ms, Some(800));
    }

    #[test]
    fn test_validate_skips_disabled_sections() {
        let mut cfg = PipelineConfig::default();
        cfg.admission.max_concurrent = 0;
        assert!(cfg.validate().is_err());
        cfg.admission.enabled = false;
        assert!(cfg.validate().is_ok());
    }
}
