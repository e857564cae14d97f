//! Pipeline counters
//!
//! Shared by the facade and every sink worker. Counters are monotonic; read
//! them through [`TranscoderStats::snapshot`].

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::types::{DecodedRecord, RecordStatus, Result};

#[derive(Debug, Default)]
pub struct TranscoderStats {
    frames_submitted: AtomicU64,
    frames_decoded: AtomicU64,
    unknown_frames: AtomicU64,
    partial_frames: AtomicU64,
    records_written: AtomicU64,
    batches_written: AtomicU64,
    flush_failures: AtomicU64,
    backpressure_events: AtomicU64,
    frames_dropped: AtomicU64,
    records_dropped: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Frames accepted by `receive_raw_message`
    pub frames_submitted: u64,
    /// Frames decoded by workers (counted once per sink)
    pub frames_decoded: u64,
    pub unknown_frames: u64,
    pub partial_frames: u64,
    /// Records durably handed to sinks
    pub records_written: u64,
    pub batches_written: u64,
    pub flush_failures: u64,
    /// Times a producer found a worker queue full
    pub backpressure_events: u64,
    /// Frames evicted under `DropOldest`, or still queued when a worker
    /// stalled on its sink was shut down
    pub frames_dropped: u64,
    /// Records discarded on retry queue overflow (`DropOldest`) or left
    /// unwritten at shutdown
    pub records_dropped: u64,
}

impl StatsSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl TranscoderStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn frame_submitted(&self) {
        bump(&self.frames_submitted, 1);
    }

    pub(crate) fn frame_decoded(&self, record: &DecodedRecord) {
        bump(&self.frames_decoded, 1);
        match record.status {
            RecordStatus::Unknown => bump(&self.unknown_frames, 1),
            RecordStatus::Partial => bump(&self.partial_frames, 1),
            RecordStatus::Decoded => {}
        }
    }

    pub(crate) fn batch_written(&self, records: usize) {
        bump(&self.batches_written, 1);
        bump(&self.records_written, records as u64);
    }

    pub(crate) fn flush_failed(&self) {
        bump(&self.flush_failures, 1);
    }

    pub(crate) fn backpressure(&self) {
        bump(&self.backpressure_events, 1);
    }

    pub(crate) fn frame_dropped(&self) {
        bump(&self.frames_dropped, 1);
    }

    pub(crate) fn records_dropped(&self, records: usize) {
        bump(&self.records_dropped, records as u64);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            frames_submitted: self.frames_submitted.load(Ordering::Relaxed),
            frames_decoded: self.frames_decoded.load(Ordering::Relaxed),
            unknown_frames: self.unknown_frames.load(Ordering::Relaxed),
            partial_frames: self.partial_frames.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            batches_written: self.batches_written.load(Ordering::Relaxed),
            flush_failures: self.flush_failures.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            records_dropped: self.records_dropped.load(Ordering::Relaxed),
        }
    }
}
