//! Main transcoder API
//!
//! The `Transcoder` is the entry point: it owns the published network
//! definition, one worker per sink, and the shared counters.

use std::path::Path;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::TranscoderConfig;
use crate::signals::database::{DatabaseStats, NetworkDefinition};
use crate::signals::dbc::{parse_dbc, read_dbc_file};
use crate::sinks::{Destination, Sink};
use crate::stats::{StatsSnapshot, TranscoderStats};
use crate::types::{Result, TimestampedFrame, TranscoderError};
use crate::worker::SinkWorker;

/// Decodes raw CAN frames and persists the records through its sinks
pub struct Transcoder {
    config: TranscoderConfig,
    network: Arc<ArcSwap<NetworkDefinition>>,
    workers: Vec<SinkWorker>,
    stats: Arc<TranscoderStats>,
}

impl Transcoder {
    /// Create a transcoder writing to one of the built-in destinations
    ///
    /// Every sink is opened before any worker starts; if one fails, nothing
    /// is left running.
    ///
    /// # Example
    /// ```no_run
    /// use can_transcoder::{Destination, Transcoder, TranscoderConfig};
    /// use std::path::PathBuf;
    ///
    /// let transcoder = Transcoder::create(
    ///     Destination::Sql(PathBuf::from("trace.db")),
    ///     TranscoderConfig::default(),
    /// ).unwrap();
    /// ```
    pub fn create(destination: Destination, config: TranscoderConfig) -> Result<Self> {
        config.validate()?;
        let sinks = destination.open()?;
        Self::with_sinks(sinks, config)
    }

    /// Create a transcoder over caller-supplied sinks, one worker each
    pub fn with_sinks(sinks: Vec<Box<dyn Sink>>, config: TranscoderConfig) -> Result<Self> {
        config.validate()?;
        if sinks.is_empty() {
            return Err(TranscoderError::SinkUnavailable(
                "at least one sink is required".into(),
            ));
        }

        let network = Arc::new(ArcSwap::from_pointee(NetworkDefinition::empty()));
        let stats = Arc::new(TranscoderStats::new());

        let mut workers: Vec<SinkWorker> = Vec::with_capacity(sinks.len());
        for sink in sinks {
            match SinkWorker::spawn(sink, &config, Arc::clone(&network), Arc::clone(&stats)) {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    for worker in &mut workers {
                        let _ = worker.shutdown();
                    }
                    return Err(e);
                }
            }
        }

        log::info!("Transcoder started with {} sink(s)", workers.len());

        Ok(Self {
            config,
            network,
            workers,
            stats,
        })
    }

    /// Parse DBC text and publish it as the current network definition
    ///
    /// On error the previous definition stays in effect.
    ///
    /// # Arguments
    /// * `text` - Complete DBC source
    ///
    /// # Returns
    /// * `Result<DatabaseStats>` - Counts for the new definition
    pub fn parse_dbc(&self, text: &str) -> Result<DatabaseStats> {
        let definition = parse_dbc(text)?;
        let stats = definition.stats();

        self.network.store(Arc::new(definition));
        for worker in &self.workers {
            worker.notify_network_changed()?;
        }

        Ok(stats)
    }

    /// Read and parse a DBC file (UTF-8, or Latin-1 as a fallback)
    pub fn parse_dbc_file(&self, path: &Path) -> Result<DatabaseStats> {
        log::info!("Loading DBC file: {:?}", path);
        let text = read_dbc_file(path)?;
        self.parse_dbc(&text)
    }

    /// Queue one frame for decoding on every sink
    ///
    /// Returns once the frame is queued; decoding and writing happen on the
    /// workers. Under `BackpressurePolicy::Block` this waits for queue space.
    pub fn receive_raw_message(&self, frame: TimestampedFrame) -> Result<()> {
        self.stats.frame_submitted();
        for worker in &self.workers {
            worker.send_frame(frame, self.config.backpressure, &self.stats)?;
        }
        Ok(())
    }

    /// Write every record received so far on every sink
    ///
    /// Blocks until all workers have answered. The first failure is returned
    /// after every worker has finished; failed batches stay queued and are
    /// retried on the next flush. A worker that has paused intake on a
    /// failing sink answers with `FlushFailed` as soon as a retry fails.
    pub fn flush_all_batches(&self) -> Result<()> {
        let mut pending = Vec::with_capacity(self.workers.len());
        let mut first_error = None;

        for worker in &self.workers {
            match worker.request_flush() {
                Ok(outcome) => pending.push((worker.name(), outcome)),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        for (name, outcome) in pending {
            if let Err(e) = outcome.wait() {
                log::warn!("Flush failed on sink '{}': {}", name, e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// The definition currently used for decoding
    pub fn network(&self) -> Arc<NetworkDefinition> {
        self.network.load_full()
    }

    pub fn config(&self) -> &TranscoderConfig {
        &self.config
    }

    /// Flush, stop and join every worker
    pub fn shutdown(mut self) -> Result<()> {
        self.close()
    }

    fn close(&mut self) -> Result<()> {
        if self.workers.is_empty() {
            return Ok(());
        }

        let mut result = self.flush_all_batches();
        for mut worker in self.workers.drain(..) {
            if let Err(e) = worker.shutdown() {
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        log::info!("Transcoder stopped: {:?}", self.stats.snapshot());
        result
    }
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("Transcoder dropped with unflushed data: {}", e);
        }
    }
}
