//! In-memory sink
//!
//! Keeps every written record in a shared vector. Useful for embedding the
//! transcoder in another pipeline and for tests.

use std::sync::{Arc, Mutex, MutexGuard};

use crate::batch::Batch;
use crate::sinks::Sink;
use crate::types::{DecodedRecord, Result, TranscoderError};

#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    name: String,
    records: Arc<Mutex<Vec<DecodedRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::named("memory")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Arc::default(),
        }
    }

    /// Shared handle to the collected records; clone before handing the sink
    /// to a transcoder
    pub fn handle(&self) -> Arc<Mutex<Vec<DecodedRecord>>> {
        Arc::clone(&self.records)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Vec<DecodedRecord>>> {
        self.records
            .lock()
            .map_err(|_| TranscoderError::SinkWrite(format!("{}: record store poisoned", self.name)))
    }

    pub fn len(&self) -> usize {
        self.lock().map_or(0, |records| records.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of everything written so far
    pub fn records(&self) -> Vec<DecodedRecord> {
        self.lock().map(|records| records.clone()).unwrap_or_default()
    }
}

impl Sink for MemorySink {
    fn name(&self) -> &str {
        &self.name
    }

    fn write_batch(&mut self, batch: &Batch) -> Result<()> {
        self.lock()?.extend_from_slice(batch.records());
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CanFrame, TimestampedFrame};

    #[test]
    fn test_memory_sink_collects_batches() {
        let mut sink = MemorySink::new();
        let handle = sink.handle();

        let mut batch = Batch::new(0, 2);
        for id in [1u32, 2] {
            let frame = TimestampedFrame::from_nanos(0, CanFrame::new(id, &[id as u8]).unwrap());
            batch.push(DecodedRecord::unknown(&frame));
        }
        sink.write_batch(&batch).unwrap();

        assert_eq!(sink.len(), 2);
        let records = handle.lock().unwrap();
        assert_eq!(records[1].can_id, 2);
    }
}
