//! Transcoder configuration types
//!
//! Batching thresholds, queue sizing and the backpressure policy. The config
//! can be built in code with the builder methods or loaded from TOML.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::types::{Result, TranscoderError};

/// What a producer does when a sink worker's queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Block the producer until the worker catches up, including while a
    /// failing sink has filled its retry queue (lossless)
    #[default]
    Block,
    /// Evict the oldest queued frame to make room (lossy, counted)
    DropOldest,
}

/// Configuration for a transcoder and its sink workers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscoderConfig {
    /// Records per batch before an automatic flush (default: 10000)
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Age of the oldest unflushed record before an automatic flush, in
    /// milliseconds (default: 1000)
    #[serde(default = "default_max_batch_age_ms")]
    pub max_batch_age_ms: u64,

    /// Capacity of each worker's frame queue (default: 65536)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub backpressure: BackpressurePolicy,

    /// Failed batches kept for retry (default: 64). Past this, `DropOldest`
    /// discards the oldest batch while `Block` stops accepting frames until
    /// a retry succeeds
    #[serde(default = "default_max_retained_batches")]
    pub max_retained_batches: usize,
}

fn default_batch_size() -> usize {
    10_000
}

fn default_max_batch_age_ms() -> u64 {
    1000
}

fn default_queue_capacity() -> usize {
    65_536
}

fn default_max_retained_batches() -> usize {
    64
}

impl Default for TranscoderConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_batch_age_ms: default_max_batch_age_ms(),
            queue_capacity: default_queue_capacity(),
            backpressure: BackpressurePolicy::default(),
            max_retained_batches: default_max_retained_batches(),
        }
    }
}

impl TranscoderConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML document; missing keys take their defaults
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| TranscoderError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Builder method: set the batch size threshold
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Builder method: set the batch age threshold
    pub fn with_max_batch_age(mut self, age: Duration) -> Self {
        self.max_batch_age_ms = age.as_millis() as u64;
        self
    }

    /// Builder method: set the per-worker queue capacity
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Builder method: set the backpressure policy
    pub fn with_backpressure(mut self, policy: BackpressurePolicy) -> Self {
        self.backpressure = policy;
        self
    }

    /// Builder method: set how many failed batches are kept for retry
    pub fn with_max_retained_batches(mut self, max: usize) -> Self {
        self.max_retained_batches = max;
        self
    }

    pub fn max_batch_age(&self) -> Duration {
        Duration::from_millis(self.max_batch_age_ms)
    }

    /// Reject values the workers cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(TranscoderError::Config("batch_size must be at least 1".into()));
        }
        if self.max_batch_age_ms == 0 {
            return Err(TranscoderError::Config(
                "max_batch_age_ms must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(TranscoderError::Config(
                "queue_capacity must be at least 1".into(),
            ));
        }
        if self.max_retained_batches == 0 {
            return Err(TranscoderError::Config(
                "max_retained_batches must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
