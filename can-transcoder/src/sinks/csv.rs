//! CSV sink
//!
//! Writes two append-mode files in the output directory:
//!
//! - `frames.csv`: one row per frame, unknown frames included
//! - `decoded_signals.csv`: one row per decoded signal value (long layout,
//!   so signals first seen later never change the header)
//!
//! Headers are written only when a file is empty. Rows are produced through
//! Arrow record batches and the `arrow::csv` writer.
//!
//! A batch lands in both files or in neither: when either write fails, both
//! files are truncated back to their length after the last complete batch,
//! so a retried batch never duplicates rows.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, UInt32Array, UInt64Array,
    UInt8Array,
};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::batch::Batch;
use crate::sinks::Sink;
use crate::types::{DecodedRecord, Result, TranscoderError};

pub const FRAMES_FILE: &str = "frames.csv";
pub const SIGNALS_FILE: &str = "decoded_signals.csv";

/// One append-mode CSV file plus whether it still needs a header
struct CsvFile {
    path: PathBuf,
    dest: BufWriter<File>,
    header_written: bool,
    /// File length after the last complete batch
    committed_len: u64,
}

impl CsvFile {
    fn open(path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TranscoderError::SinkUnavailable(format!("{}: {}", path.display(), e)))?;
        let committed_len = file.metadata()?.len();

        Ok(Self {
            path,
            dest: BufWriter::new(file),
            header_written: committed_len > 0,
            committed_len,
        })
    }

    fn write(&mut self, batch: &RecordBatch) -> Result<()> {
        if batch.num_rows() == 0 {
            return Ok(());
        }

        let mut csv_writer = arrow::csv::WriterBuilder::new()
            .with_header(!self.header_written)
            .build(&mut self.dest);
        csv_writer.write(batch)?;
        drop(csv_writer);

        self.dest.flush()?;
        self.header_written = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        self.committed_len = self.dest.get_ref().metadata()?.len();
        Ok(())
    }

    /// Discard everything since the last commit, buffered or on disk
    fn rollback(&mut self) -> Result<()> {
        let file = self.dest.get_ref().try_clone()?;
        // into_parts hands back the buffer without writing it
        let (_, _unwritten) = std::mem::replace(&mut self.dest, BufWriter::new(file)).into_parts();
        self.dest.get_ref().set_len(self.committed_len)?;
        self.header_written = self.committed_len > 0;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.dest.flush()?;
        self.dest.get_ref().sync_data()?;
        Ok(())
    }
}

pub struct CsvSink {
    dir: PathBuf,
    frames: CsvFile,
    signals: CsvFile,
    frames_schema: SchemaRef,
    signals_schema: SchemaRef,
}

impl CsvSink {
    /// Create the output directory (if needed) and open both files for append
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| TranscoderError::SinkUnavailable(format!("{}: {}", dir.display(), e)))?;

        let frames = CsvFile::open(dir.join(FRAMES_FILE))?;
        let signals = CsvFile::open(dir.join(SIGNALS_FILE))?;
        log::info!("CSV sink writing to {}", dir.display());

        Ok(Self {
            dir: dir.to_path_buf(),
            frames,
            signals,
            frames_schema: frames_schema(),
            signals_schema: signals_schema(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn frames_path(&self) -> &Path {
        &self.frames.path
    }

    pub fn signals_path(&self) -> &Path {
        &self.signals.path
    }
}

impl Sink for CsvSink {
    fn name(&self) -> &str {
        "csv"
    }

    fn write_batch(&mut self, batch: &Batch) -> Result<()> {
        let records = batch.records();
        let frames = frames_batch(&self.frames_schema, records)?;
        let signals = signals_batch(&self.signals_schema, records)?;

        let written = self
            .frames
            .write(&frames)
            .and_then(|()| self.signals.write(&signals));
        if let Err(e) = written {
            for file in [&mut self.frames, &mut self.signals] {
                if let Err(rollback) = file.rollback() {
                    log::error!(
                        "{}: cannot roll back partial batch {}: {}",
                        file.path.display(),
                        batch.sequence(),
                        rollback
                    );
                }
            }
            return Err(e);
        }

        self.frames.commit()?;
        self.signals.commit()
    }

    fn flush(&mut self) -> Result<()> {
        self.frames.sync()?;
        self.signals.sync()
    }
}

fn frames_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("timestamp_us", DataType::Int64, false),
        Field::new("can_id", DataType::UInt32, false),
        Field::new("extended", DataType::Boolean, false),
        Field::new("dlc", DataType::UInt8, false),
        Field::new("data", DataType::Utf8, false),
        Field::new("message_name", DataType::Utf8, true),
        Field::new("status", DataType::Utf8, false),
    ]))
}

fn signals_schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("timestamp_us", DataType::Int64, false),
        Field::new("can_id", DataType::UInt32, false),
        Field::new("message_name", DataType::Utf8, true),
        Field::new("signal_name", DataType::Utf8, false),
        Field::new("value", DataType::Float64, true),
        Field::new("raw_value", DataType::UInt64, true),
        Field::new("unit", DataType::Utf8, true),
        Field::new("mux_value", DataType::UInt64, true),
        Field::new("description", DataType::Utf8, true),
    ]))
}

fn frames_batch(schema: &SchemaRef, records: &[DecodedRecord]) -> Result<RecordBatch> {
    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from_iter_values(
            records.iter().map(DecodedRecord::timestamp_micros),
        )),
        Arc::new(UInt32Array::from_iter_values(records.iter().map(|r| r.can_id))),
        Arc::new(BooleanArray::from(
            records.iter().map(|r| r.frame.is_extended).collect::<Vec<_>>(),
        )),
        Arc::new(UInt8Array::from_iter_values(records.iter().map(|r| r.frame.dlc()))),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.frame.hex_data()),
        )),
        Arc::new(
            records
                .iter()
                .map(|r| r.message_name.as_deref())
                .collect::<StringArray>(),
        ),
        Arc::new(StringArray::from_iter_values(
            records.iter().map(|r| r.status.as_str()),
        )),
    ];

    Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
}

fn signals_batch(schema: &SchemaRef, records: &[DecodedRecord]) -> Result<RecordBatch> {
    let rows: Vec<_> = records
        .iter()
        .flat_map(|record| record.signals.iter().map(move |signal| (record, signal)))
        .collect();

    let columns: Vec<ArrayRef> = vec![
        Arc::new(Int64Array::from_iter_values(
            rows.iter().map(|(r, _)| r.timestamp_micros()),
        )),
        Arc::new(UInt32Array::from_iter_values(rows.iter().map(|(r, _)| r.can_id))),
        Arc::new(
            rows.iter()
                .map(|(r, _)| r.message_name.as_deref())
                .collect::<StringArray>(),
        ),
        Arc::new(StringArray::from_iter_values(
            rows.iter().map(|(_, s)| s.name.as_str()),
        )),
        Arc::new(rows.iter().map(|(_, s)| s.value).collect::<Float64Array>()),
        Arc::new(rows.iter().map(|(_, s)| s.raw_value).collect::<UInt64Array>()),
        Arc::new(
            rows.iter()
                .map(|(_, s)| s.unit.as_deref())
                .collect::<StringArray>(),
        ),
        Arc::new(
            rows.iter()
                .map(|(r, _)| r.multiplexer_value)
                .collect::<UInt64Array>(),
        ),
        Arc::new(
            rows.iter()
                .map(|(_, s)| s.value_description.as_deref())
                .collect::<StringArray>(),
        ),
    ];

    Ok(RecordBatch::try_new(Arc::clone(schema), columns)?)
}
