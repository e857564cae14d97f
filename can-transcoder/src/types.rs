//! Core types for the CAN transcoder library
//!
//! This module defines the values that travel through the pipeline: raw frames
//! handed in by producers, decoded records handed out to sinks, the per-frame
//! decode warnings, and the crate-wide error type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::signals::dbc::ParseError;

/// Timestamp type used throughout the transcoder
pub type Timestamp = DateTime<Utc>;

/// Result type for transcoder operations
pub type Result<T> = std::result::Result<T, TranscoderError>;

/// Largest standard (11-bit) CAN identifier
pub const MAX_STANDARD_ID: u32 = 0x7FF;

/// Largest extended (29-bit) CAN identifier
pub const MAX_EXTENDED_ID: u32 = 0x1FFF_FFFF;

/// Payload capacity of a classic CAN frame
pub const MAX_DLC: usize = 8;

/// Raw classic CAN frame
///
/// Only the first `dlc` bytes of the payload are meaningful; the remaining
/// bytes are always zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanFrame {
    /// CAN message ID (11-bit or 29-bit)
    pub can_id: u32,
    /// True if this is an extended (29-bit) CAN ID
    pub is_extended: bool,
    dlc: u8,
    data: [u8; MAX_DLC],
}

impl CanFrame {
    /// Create a frame, inferring the extended flag from the identifier value
    pub fn new(can_id: u32, data: &[u8]) -> Result<Self> {
        Self::build(can_id, can_id > MAX_STANDARD_ID, data)
    }

    /// Create a frame with an explicit 29-bit identifier
    pub fn new_extended(can_id: u32, data: &[u8]) -> Result<Self> {
        Self::build(can_id, true, data)
    }

    fn build(can_id: u32, is_extended: bool, payload: &[u8]) -> Result<Self> {
        let max_id = if is_extended { MAX_EXTENDED_ID } else { MAX_STANDARD_ID };
        if can_id > max_id {
            return Err(TranscoderError::InvalidFrame(format!(
                "CAN ID 0x{:X} exceeds the {}-bit range",
                can_id,
                if is_extended { 29 } else { 11 }
            )));
        }
        if payload.len() > MAX_DLC {
            return Err(TranscoderError::InvalidFrame(format!(
                "payload of {} bytes exceeds the classic CAN limit of {}",
                payload.len(),
                MAX_DLC
            )));
        }

        let mut data = [0u8; MAX_DLC];
        data[..payload.len()].copy_from_slice(payload);

        Ok(Self {
            can_id,
            is_extended,
            dlc: payload.len() as u8,
            data,
        })
    }

    /// Get the data length code (DLC) - number of data bytes
    pub fn dlc(&self) -> u8 {
        self.dlc
    }

    /// The meaningful payload bytes
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// Payload as space separated lowercase hex, e.g. `"e8 03"`
    pub fn hex_data(&self) -> String {
        self.data()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// A raw frame paired with its capture time; the unit producers enqueue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampedFrame {
    pub timestamp: Timestamp,
    pub frame: CanFrame,
}

impl TimestampedFrame {
    pub fn new(timestamp: Timestamp, frame: CanFrame) -> Self {
        Self { timestamp, frame }
    }

    /// Stamp a frame with the current wall clock time
    pub fn now(frame: CanFrame) -> Self {
        Self::new(Utc::now(), frame)
    }

    /// Build from a timestamp in nanoseconds since the Unix epoch
    pub fn from_nanos(timestamp_ns: u64, frame: CanFrame) -> Self {
        let secs = (timestamp_ns / 1_000_000_000) as i64;
        let nsecs = (timestamp_ns % 1_000_000_000) as u32;
        let timestamp = DateTime::from_timestamp(secs, nsecs).unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        Self::new(timestamp, frame)
    }
}

/// Non-fatal shortfall found while decoding a single frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecodeWarning {
    /// No message definition exists for the frame's identifier
    UnknownIdentifier { can_id: u32 },
    /// The signal's bit window reaches past the frame's payload
    SignalTruncated {
        signal: String,
        required_bytes: usize,
        dlc: u8,
    },
    /// The signal's bit window reaches past the message's declared size
    SignalOutsideMessage {
        signal: String,
        required_bytes: usize,
        message_size: usize,
    },
}

impl fmt::Display for DecodeWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeWarning::UnknownIdentifier { can_id } => {
                write!(f, "unknown CAN ID 0x{:X}", can_id)
            }
            DecodeWarning::SignalTruncated {
                signal,
                required_bytes,
                dlc,
            } => write!(
                f,
                "signal '{}' needs {} bytes but frame has {}",
                signal, required_bytes, dlc
            ),
            DecodeWarning::SignalOutsideMessage {
                signal,
                required_bytes,
                message_size,
            } => write!(
                f,
                "signal '{}' needs {} bytes but the message is declared with {}",
                signal, required_bytes, message_size
            ),
        }
    }
}

/// How completely a frame was decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RecordStatus {
    /// Every active signal produced a value
    Decoded,
    /// At least one signal could not be extracted
    Partial,
    /// The identifier is not in the network definition
    Unknown,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Decoded => "decoded",
            RecordStatus::Partial => "partial",
            RecordStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded signal with its physical value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedSignal {
    /// Signal name from the DBC
    pub name: String,
    /// Physical value (`raw * factor + offset`), `None` if the bits were missing
    pub value: Option<f64>,
    /// Raw bits as extracted from the payload, before sign handling
    pub raw_value: Option<u64>,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
    /// Value description from `VAL_` (e.g., "Off")
    pub value_description: Option<String>,
}

impl DecodedSignal {
    pub fn is_missing(&self) -> bool {
        self.value.is_none()
    }
}

/// One decoded frame, the unit handed to sinks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedRecord {
    pub timestamp: Timestamp,
    pub can_id: u32,
    /// Message name from the DBC (if the identifier is known)
    pub message_name: Option<String>,
    pub status: RecordStatus,
    /// Active signals in declaration order
    pub signals: Vec<DecodedSignal>,
    /// Active multiplexer value (if the message is multiplexed)
    pub multiplexer_value: Option<u64>,
    /// The original frame, unchanged
    pub frame: CanFrame,
    pub warnings: Vec<DecodeWarning>,
}

impl DecodedRecord {
    /// Record for a frame whose identifier has no definition
    pub fn unknown(source: &TimestampedFrame) -> Self {
        Self {
            timestamp: source.timestamp,
            can_id: source.frame.can_id,
            message_name: None,
            status: RecordStatus::Unknown,
            signals: Vec::new(),
            multiplexer_value: None,
            frame: source.frame,
            warnings: vec![DecodeWarning::UnknownIdentifier {
                can_id: source.frame.can_id,
            }],
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.status == RecordStatus::Unknown
    }

    /// Look up a decoded signal by name
    pub fn signal(&self, name: &str) -> Option<&DecodedSignal> {
        self.signals.iter().find(|s| s.name == name)
    }

    /// Physical value of a signal, if present and decoded
    pub fn value(&self, name: &str) -> Option<f64> {
        self.signal(name).and_then(|s| s.value)
    }

    /// Timestamp as microseconds since the Unix epoch (the sink column format)
    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp.timestamp_micros()
    }
}

/// Errors that can occur in the transcoder
#[derive(Debug, thiserror::Error)]
pub enum TranscoderError {
    #[error("Failed to parse DBC: {0}")]
    DbcParse(#[from] ParseError),

    #[error("Invalid network definition: {0}")]
    InvalidDefinition(String),

    #[error("Invalid CAN frame: {0}")]
    InvalidFrame(String),

    #[error("Sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("Sink write failed: {0}")]
    SinkWrite(String),

    #[error("Flush failed on sink '{sink}' ({retained_records} records retained): {reason}")]
    FlushFailed {
        sink: String,
        retained_records: usize,
        reason: String,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Sink worker '{0}' has stopped")]
    WorkerStopped(String),

    #[error("SQLite error: {0}")]
    Sql(#[from] rusqlite::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
