//! Batching engine
//!
//! Accumulates decoded records for one sink and decides when to write them.
//! A batch is sealed when it reaches `batch_size` records or when its first
//! record is older than `max_batch_age`, whichever comes first. Sealed
//! batches are written strictly in sequence order; a batch whose write fails
//! stays at the head of the retained queue and is retried before anything
//! newer.
//!
//! The retained queue is capped at `max_retained_batches`. Under
//! `DropOldest` the oldest batch is discarded once the cap is exceeded; under
//! `Block` nothing is discarded and the engine reports itself saturated, so
//! the worker stops taking frames until a retry succeeds.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{BackpressurePolicy, TranscoderConfig};
use crate::signals::database::NetworkDefinition;
use crate::sinks::Sink;
use crate::stats::TranscoderStats;
use crate::types::{DecodedRecord, Result, TranscoderError};

/// An ordered run of decoded records, written to a sink as one unit
#[derive(Debug, Clone)]
pub struct Batch {
    sequence: u64,
    opened_at: Instant,
    records: Vec<DecodedRecord>,
}

impl Batch {
    pub fn new(sequence: u64, capacity: usize) -> Self {
        Self {
            sequence,
            opened_at: Instant::now(),
            records: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, record: DecodedRecord) {
        self.records.push(record);
    }

    /// Position of this batch in the sink's write order
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn records(&self) -> &[DecodedRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Time since the batch was opened (its first record arrived)
    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }
}

pub struct BatchingEngine<S: Sink> {
    sink: S,
    batch_size: usize,
    max_age: Duration,
    max_retained: usize,
    policy: BackpressurePolicy,
    active: Option<Batch>,
    /// Sealed batches not yet written, oldest first
    retained: VecDeque<Batch>,
    next_sequence: u64,
    stats: Arc<TranscoderStats>,
}

impl<S: Sink> BatchingEngine<S> {
    pub fn new(sink: S, config: &TranscoderConfig, stats: Arc<TranscoderStats>) -> Self {
        Self {
            sink,
            batch_size: config.batch_size.max(1),
            max_age: config.max_batch_age(),
            max_retained: config.max_retained_batches.max(1),
            policy: config.backpressure,
            active: None,
            retained: VecDeque::new(),
            next_sequence: 0,
            stats,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn describe_network(&mut self, network: &NetworkDefinition) -> Result<()> {
        self.sink.describe_network(network)
    }

    /// Add a record; writes automatically when the size threshold is hit
    pub fn submit(&mut self, record: DecodedRecord) -> Result<()> {
        if self.active.is_none() {
            self.active = Some(Batch::new(self.next_sequence, self.batch_size));
            self.next_sequence += 1;
        }

        let full = match self.active.as_mut() {
            Some(batch) => {
                batch.push(record);
                batch.len() >= self.batch_size
            }
            None => false,
        };

        if full {
            self.seal();
            self.write_retained()?;
        }
        Ok(())
    }

    /// Write the active batch if it has exceeded the age threshold
    pub fn poll_age(&mut self) -> Result<()> {
        match &self.active {
            Some(batch) if batch.age() >= self.max_age => {
                self.seal();
                self.write_retained()
            }
            _ => Ok(()),
        }
    }

    /// Time until the active batch becomes due, `None` when nothing is pending
    pub fn time_until_due(&self) -> Option<Duration> {
        self.active
            .as_ref()
            .map(|batch| self.max_age.saturating_sub(batch.age()))
    }

    /// Seal the active batch, write everything retained, then flush the sink
    pub fn flush(&mut self) -> Result<()> {
        self.seal();
        self.write_retained()?;
        self.sink.flush().map_err(|e| {
            self.stats.flush_failed();
            TranscoderError::FlushFailed {
                sink: self.sink.name().to_string(),
                retained_records: 0,
                reason: e.to_string(),
            }
        })
    }

    /// Write retained batches without sealing the active one
    pub fn retry(&mut self) -> Result<()> {
        self.write_retained()
    }

    /// The retry queue is full and the policy forbids discarding; no more
    /// records should be accepted until a retry succeeds
    pub fn is_saturated(&self) -> bool {
        self.policy == BackpressurePolicy::Block && self.retained.len() >= self.max_retained
    }

    /// Records accepted but not yet written
    pub fn pending_records(&self) -> usize {
        self.active.as_ref().map_or(0, Batch::len) + self.retained_records()
    }

    fn retained_records(&self) -> usize {
        self.retained.iter().map(Batch::len).sum()
    }

    /// Move the active batch to the back of the write queue
    fn seal(&mut self) {
        let Some(batch) = self.active.take() else {
            return;
        };
        if batch.is_empty() {
            return;
        }
        self.retained.push_back(batch);

        if self.policy != BackpressurePolicy::DropOldest {
            return;
        }
        while self.retained.len() > self.max_retained {
            if let Some(dropped) = self.retained.pop_front() {
                log::error!(
                    "{}: retry queue full, discarding batch {} ({} records)",
                    self.sink.name(),
                    dropped.sequence(),
                    dropped.len()
                );
                self.stats.records_dropped(dropped.len());
            }
        }
    }

    fn write_retained(&mut self) -> Result<()> {
        while let Some(batch) = self.retained.front() {
            if let Err(e) = self.sink.write_batch(batch) {
                self.stats.flush_failed();
                log::warn!(
                    "{}: writing batch {} failed, will retry: {}",
                    self.sink.name(),
                    batch.sequence(),
                    e
                );
                return Err(TranscoderError::FlushFailed {
                    sink: self.sink.name().to_string(),
                    retained_records: self.retained_records(),
                    reason: e.to_string(),
                });
            }

            log::debug!(
                "{}: wrote batch {} ({} records)",
                self.sink.name(),
                batch.sequence(),
                batch.len()
            );
            self.stats.batch_written(batch.len());
            self.retained.pop_front();
        }
        Ok(())
    }
}
