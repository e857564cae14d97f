//! CAN Transcoder Library
//!
//! Decodes a live stream of raw CAN frames against a DBC definition and
//! persists the decoded records through pluggable sinks (CSV files, SQLite,
//! or your own) using batched writes on background threads.
//!
//! # Architecture
//!
//! - The DBC parser turns DBC text into an immutable `NetworkDefinition`,
//!   published atomically so a re-parse never disturbs decoding in progress
//! - Each sink gets its own worker thread fed by a bounded queue; the worker
//!   decodes frames and hands them to a batching engine
//! - Batches are written when they reach `batch_size` records or
//!   `max_batch_age`, whichever comes first, and on `flush_all_batches`
//! - A failed write keeps the batch for retry; nothing is dropped silently
//!
//! The library does NOT:
//! - Talk to CAN hardware or transmit frames
//! - Install a logger (it logs through the `log` facade)
//!
//! # Example Usage
//!
//! ```no_run
//! use can_transcoder::{CanFrame, Destination, TimestampedFrame, Transcoder, TranscoderConfig};
//! use std::path::PathBuf;
//!
//! let transcoder = Transcoder::create(
//!     Destination::Csv(PathBuf::from("out")),
//!     TranscoderConfig::new().with_batch_size(5_000),
//! ).unwrap();
//!
//! transcoder.parse_dbc_file("powertrain.dbc".as_ref()).unwrap();
//!
//! let frame = CanFrame::new(0x64, &[0xE8, 0x03]).unwrap();
//! transcoder.receive_raw_message(TimestampedFrame::now(frame)).unwrap();
//!
//! transcoder.flush_all_batches().unwrap();
//! println!("{:?}", transcoder.stats());
//! transcoder.shutdown().unwrap();
//! ```

// Public modules
pub mod batch;
pub mod config;
pub mod message_decoder;
pub mod signals;
pub mod sinks;
pub mod stats;
pub mod transcoder;
pub mod types;

// Internal modules (not exposed in public API)
mod worker;

// Re-export main types for convenience
pub use batch::{Batch, BatchingEngine};
pub use config::{BackpressurePolicy, TranscoderConfig};
pub use message_decoder::MessageDecoder;
pub use signals::{
    parse_dbc, read_dbc_file, ByteOrder, DatabaseStats, MessageDefinition, Multiplexing,
    NetworkDefinition, ParseError, SignalDefinition, ValueType,
};
pub use sinks::{CsvSink, Destination, MemorySink, Sink, SqlSink};
pub use stats::{StatsSnapshot, TranscoderStats};
pub use transcoder::Transcoder;
pub use types::{
    CanFrame, DecodeWarning, DecodedRecord, DecodedSignal, RecordStatus, Result, Timestamp,
    TimestampedFrame, TranscoderError,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
