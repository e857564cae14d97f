//! Sink adapters
//!
//! A sink durably stores batches of decoded records. Each sink is owned by
//! exactly one worker thread, so implementations need `Send` but not `Sync`.

pub mod csv;
pub mod memory;
pub mod sql;

use std::path::PathBuf;

use crate::batch::Batch;
use crate::signals::database::NetworkDefinition;
use crate::types::Result;

pub use self::csv::CsvSink;
pub use self::memory::MemorySink;
pub use self::sql::SqlSink;

/// Destination for decoded records
pub trait Sink: Send {
    /// Short name used in logs and errors
    fn name(&self) -> &str;

    /// Called once per published network definition, before any batch
    /// decoded with it is written
    fn describe_network(&mut self, _network: &NetworkDefinition) -> Result<()> {
        Ok(())
    }

    /// Write one batch. Either the whole batch is stored or an error is
    /// returned; the caller keeps the batch and retries it later.
    fn write_batch(&mut self, batch: &Batch) -> Result<()>;

    /// Make everything written so far durable
    fn flush(&mut self) -> Result<()>;
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn describe_network(&mut self, network: &NetworkDefinition) -> Result<()> {
        (**self).describe_network(network)
    }

    fn write_batch(&mut self, batch: &Batch) -> Result<()> {
        (**self).write_batch(batch)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Built-in sink selection for [`crate::Transcoder::create`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// CSV files in this directory
    Csv(PathBuf),
    /// SQLite database at this path
    Sql(PathBuf),
    /// Both of the above, each with its own worker
    Both { csv_dir: PathBuf, sql_path: PathBuf },
}

impl Destination {
    /// Open every sink this destination names.
    ///
    /// All sinks are opened before any is returned, so a failure leaves
    /// nothing running.
    pub fn open(&self) -> Result<Vec<Box<dyn Sink>>> {
        let sinks: Vec<Box<dyn Sink>> = match self {
            Destination::Csv(dir) => vec![Box::new(CsvSink::create(dir)?)],
            Destination::Sql(path) => vec![Box::new(SqlSink::open(path)?)],
            Destination::Both { csv_dir, sql_path } => vec![
                Box::new(CsvSink::create(csv_dir)?),
                Box::new(SqlSink::open(sql_path)?),
            ],
        };
        Ok(sinks)
    }
}
