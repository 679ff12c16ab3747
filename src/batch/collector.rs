//! Batch collector: per-target buckets of pending entries.

use crate::types::TargetKey;
use crate::utils::{lock_unpoisoned, millis};
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// What to hand an entry whose item id is absent from the aggregate response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutMode {
    /// The whole aggregate body.
    #[default]
    Passthrough,
    /// `Error::BatchItemMissing`.
    Strict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    pub max_batch_size: usize,
    /// Flush delay measured from the first entry of a bucket.
    pub batch_delay: Duration,
    /// Field of each aggregate element compared against an entry's item id.
    pub id_field: String,
    pub fan_out: FanOutMode,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 5,
            batch_delay: Duration::from_millis(50),
            id_field: "id".to_string(),
            fan_out: FanOutMode::Passthrough,
        }
    }
}

impl BatchConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn with_max_batch_size(mut self, s: usize) -> Self {
        self.max_batch_size = s;
        self
    }
    pub fn with_batch_delay(mut self, d: Duration) -> Self {
        self.batch_delay = d;
        self
    }
    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }
    pub fn with_fan_out(mut self, mode: FanOutMode) -> Self {
        self.fan_out = mode;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(Error::configuration_with_context(
                "max_batch_size must be at least 1",
                ErrorContext::new()
                    .with_field_path("batch.max_batch_size")
                    .with_source("batch"),
            ));
        }
        if self.id_field.trim().is_empty() {
            return Err(Error::configuration_with_context(
                "id_field must not be empty",
                ErrorContext::new()
                    .with_field_path("batch.id_field")
                    .with_details(format!("batch_delay_ms = {}", millis(self.batch_delay)))
                    .with_source("batch"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct BatchItem<T> {
    pub data: T,
    pub added_at: Instant,
    pub request_id: Option<String>,
    pub priority: i32,
}

impl<T> BatchItem<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            added_at: Instant::now(),
            request_id: None,
            priority: 0,
        }
    }
    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }
    pub fn with_priority(mut self, p: i32) -> Self {
        self.priority = p;
        self
    }
}

struct Bucket<T> {
    generation: u64,
    items: Vec<BatchItem<T>>,
}

struct Buckets<T> {
    open: HashMap<TargetKey, Bucket<T>>,
    next_generation: u64,
}

/// Outcome of adding an entry to its target's bucket.
#[derive(Debug)]
pub enum BatchAddResult<T> {
    /// First entry of a fresh bucket; the caller arms the flush timer for `generation`.
    Opened { generation: u64 },
    Added { count: usize },
    /// The bucket reached `max_batch_size` and was taken out for flushing.
    Full { items: Vec<BatchItem<T>> },
}

impl<T> BatchAddResult<T> {
    pub fn should_flush(&self) -> bool {
        matches!(self, BatchAddResult::Full { .. })
    }
}

/// Groups pending entries by target. A bucket lives from its first entry until it is
/// full or its timer takes it; the next entry for that target opens a new generation.
pub struct BatchCollector<T> {
    config: BatchConfig,
    buckets: Mutex<Buckets<T>>,
}

impl<T> BatchCollector<T> {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            buckets: Mutex::new(Buckets {
                open: HashMap::new(),
                next_generation: 0,
            }),
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    pub fn add(&self, key: &TargetKey, item: BatchItem<T>) -> BatchAddResult<T> {
        let mut buckets = lock_unpoisoned(&self.buckets);
        let max = self.config.max_batch_size.max(1);

        if let Some(bucket) = buckets.open.get_mut(key) {
            bucket.items.push(item);
            let count = bucket.items.len();
            if count >= max {
                let items = buckets
                    .open
                    .remove(key)
                    .map(|b| b.items)
                    .unwrap_or_default();
                return BatchAddResult::Full { items };
            }
            return BatchAddResult::Added { count };
        }

        if max == 1 {
            return BatchAddResult::Full { items: vec![item] };
        }
        let generation = buckets.next_generation;
        buckets.next_generation += 1;
        buckets.open.insert(
            key.clone(),
            Bucket {
                generation,
                items: vec![item],
            },
        );
        BatchAddResult::Opened { generation }
    }

    /// Take the bucket for `key` if it is still the given generation.
    pub fn take(&self, key: &TargetKey, generation: u64) -> Option<Vec<BatchItem<T>>> {
        let mut buckets = lock_unpoisoned(&self.buckets);
        match buckets.open.get(key) {
            Some(b) if b.generation == generation => buckets.open.remove(key).map(|b| b.items),
            _ => None,
        }
    }

    /// Pending entry counts per target.
    pub fn pending(&self) -> BTreeMap<TargetKey, usize> {
        lock_unpoisoned(&self.buckets)
            .open
            .iter()
            .map(|(k, b)| (k.clone(), b.items.len()))
            .collect()
    }

    /// Like [`pending`](Self::pending), counting only entries for which `counts` holds.
    /// Targets left with no counted entry are omitted.
    pub fn pending_where(&self, counts: impl Fn(&T) -> bool) -> BTreeMap<TargetKey, usize> {
        lock_unpoisoned(&self.buckets)
            .open
            .iter()
            .map(|(k, b)| (k.clone(), b.items.iter().filter(|i| counts(&i.data)).count()))
            .filter(|(_, n)| *n > 0)
            .collect()
    }

    pub fn len(&self) -> usize {
        lock_unpoisoned(&self.buckets)
            .open
            .values()
            .map(|b| b.items.len())
            .sum()
    }
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
