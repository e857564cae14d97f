//! SQLite sink
//!
//! Tables:
//!
//! - `messages`, `signals`: the current network definition, rewritten on
//!   every `describe_network` (signal details as JSON)
//! - `frames`: one row per frame, unknown frames included
//! - `decoded_signals`: one row per decoded signal value, linked to its frame
//!
//! Decoded values share one narrow table rather than a table per message, so
//! loading a different DBC never requires a schema change. Existing data is
//! kept: the sink appends.

use std::path::{Path, PathBuf};

use rusqlite::{params, Connection};

use crate::batch::Batch;
use crate::signals::database::NetworkDefinition;
use crate::sinks::Sink;
use crate::types::{Result, TranscoderError};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS messages (
    can_id       INTEGER NOT NULL,
    extended     INTEGER NOT NULL,
    name         TEXT NOT NULL,
    size         INTEGER NOT NULL,
    transmitter  TEXT,
    comment      TEXT,
    PRIMARY KEY (can_id, extended)
);
CREATE TABLE IF NOT EXISTS signals (
    can_id    INTEGER NOT NULL,
    extended  INTEGER NOT NULL,
    name      TEXT NOT NULL,
    details   TEXT NOT NULL,
    PRIMARY KEY (can_id, extended, name)
);
CREATE TABLE IF NOT EXISTS frames (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp_us  INTEGER NOT NULL,
    can_id        INTEGER NOT NULL,
    extended      INTEGER NOT NULL,
    dlc           INTEGER NOT NULL,
    data          BLOB NOT NULL,
    message_name  TEXT,
    status        TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS decoded_signals (
    frame_id      INTEGER NOT NULL REFERENCES frames(id),
    timestamp_us  INTEGER NOT NULL,
    can_id        INTEGER NOT NULL,
    message_name  TEXT,
    signal_name   TEXT NOT NULL,
    value         REAL,
    raw_value     INTEGER,
    unit          TEXT,
    mux_value     INTEGER,
    description   TEXT
);
CREATE INDEX IF NOT EXISTS decoded_signals_by_signal
    ON decoded_signals (signal_name, timestamp_us);
";

const INSERT_FRAME: &str = "INSERT INTO frames
    (timestamp_us, can_id, extended, dlc, data, message_name, status)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)";

const INSERT_SIGNAL: &str = "INSERT INTO decoded_signals
    (frame_id, timestamp_us, can_id, message_name, signal_name, value, raw_value, unit, mux_value, description)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)";

pub struct SqlSink {
    path: PathBuf,
    conn: Connection,
}

impl SqlSink {
    /// Open or create the database and its tables
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| TranscoderError::SinkUnavailable(format!("{}: {}", path.display(), e)))?;
        Self::init(path.to_path_buf(), conn)
            .map_err(|e| TranscoderError::SinkUnavailable(format!("{}: {}", path.display(), e)))
    }

    fn init(path: PathBuf, conn: Connection) -> Result<Self> {
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        // FULL syncs the WAL on every commit, so a committed batch survives power loss
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA)?;
        log::info!("SQL sink writing to {} (journal_mode={})", path.display(), mode);

        Ok(Self { path, conn })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Sink for SqlSink {
    fn name(&self) -> &str {
        "sql"
    }

    fn describe_network(&mut self, network: &NetworkDefinition) -> Result<()> {
        let tx = self.conn.transaction()?;
        tx.execute("DELETE FROM signals", [])?;
        tx.execute("DELETE FROM messages", [])?;
        {
            let mut message_stmt = tx.prepare_cached(
                "INSERT INTO messages (can_id, extended, name, size, transmitter, comment)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            let mut signal_stmt = tx.prepare_cached(
                "INSERT INTO signals (can_id, extended, name, details) VALUES (?1, ?2, ?3, ?4)",
            )?;

            for message in network.messages() {
                message_stmt.execute(params![
                    message.id,
                    message.is_extended,
                    message.name,
                    message.size as i64,
                    message.transmitter,
                    message.comment,
                ])?;
                for signal in &message.signals {
                    signal_stmt.execute(params![
                        message.id,
                        message.is_extended,
                        signal.name,
                        serde_json::to_string(signal)?,
                    ])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    // One transaction per batch: either every row lands or none does
    fn write_batch(&mut self, batch: &Batch) -> Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut frame_stmt = tx.prepare_cached(INSERT_FRAME)?;
            let mut signal_stmt = tx.prepare_cached(INSERT_SIGNAL)?;

            for record in batch.records() {
                let timestamp_us = record.timestamp_micros();
                frame_stmt.execute(params![
                    timestamp_us,
                    record.can_id,
                    record.frame.is_extended,
                    record.frame.dlc(),
                    record.frame.data(),
                    record.message_name,
                    record.status.as_str(),
                ])?;
                let frame_id = tx.last_insert_rowid();

                for signal in &record.signals {
                    signal_stmt.execute(params![
                        frame_id,
                        timestamp_us,
                        record.can_id,
                        record.message_name,
                        signal.name,
                        signal.value,
                        // Stored bit-for-bit; 64-bit raw values above i64::MAX read back negative
                        signal.raw_value.map(|raw| raw as i64),
                        signal.unit,
                        record.multiplexer_value.map(|mux| mux as i64),
                        signal.value_description,
                    ])?;
                }
            }
        }
        tx.commit()?;
        Ok(())
    }

    // Commits are already synced (synchronous=FULL); checkpoint so the main
    // database file holds everything written so far
    fn flush(&mut self) -> Result<()> {
        self.conn.cache_flush()?;
        self.conn
            .query_row("PRAGMA wal_checkpoint(PASSIVE)", [], |_| Ok(()))?;
        Ok(())
    }
}
