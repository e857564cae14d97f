//! Signal database and DBC parser
//!
//! This module contains the DBC parser, the immutable network definition it
//! produces, and the precomputed bit layouts used to extract signals.

pub mod database;
pub mod dbc;
pub mod layout;

// Re-export key types for convenience
pub use database::{
    ByteOrder, DatabaseStats, MessageDefinition, Multiplexing, NetworkDefinition,
    SignalDefinition, ValueType,
};
pub use dbc::{parse_dbc, read_dbc_file, ParseError};
pub use layout::{BitLayout, BitSpan};
