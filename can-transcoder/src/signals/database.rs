//! Network definition
//!
//! The in-memory form of a parsed DBC file. A `NetworkDefinition` is built once
//! by the parser, never mutated afterwards, and shared between the facade and
//! the sink workers behind an `Arc`.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

use crate::signals::layout::BitLayout;
use crate::types::{Result, TranscoderError};

/// A complete CAN message definition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageDefinition {
    /// CAN message ID (29-bit value, without the DBC extended marker bit)
    pub id: u32,
    /// True if the DBC declared an extended identifier
    pub is_extended: bool,
    /// Message name
    pub name: String,
    /// Message size in bytes
    pub size: usize,
    /// Transmitting node (None for `Vector__XXX`)
    pub transmitter: Option<String>,
    /// Additional transmitters from `BO_TX_BU_`
    pub extra_transmitters: Vec<String>,
    /// Comment from `CM_ BO_`
    pub comment: Option<String>,
    /// All signals in this message, in declaration order
    pub signals: Vec<SignalDefinition>,
}

impl MessageDefinition {
    pub fn new(id: u32, name: impl Into<String>, size: usize) -> Self {
        Self {
            id,
            is_extended: id > crate::types::MAX_STANDARD_ID,
            name: name.into(),
            size,
            transmitter: None,
            extra_transmitters: Vec::new(),
            comment: None,
            signals: Vec::new(),
        }
    }

    /// Builder method: append a signal
    pub fn with_signal(mut self, signal: SignalDefinition) -> Self {
        self.signals.push(signal);
        self
    }

    pub fn signal(&self, name: &str) -> Option<&SignalDefinition> {
        self.signals.iter().find(|s| s.name == name)
    }

    pub(crate) fn signal_mut(&mut self, name: &str) -> Option<&mut SignalDefinition> {
        self.signals.iter_mut().find(|s| s.name == name)
    }

    /// The multiplexor switch signal, if any
    pub fn multiplexor(&self) -> Option<&SignalDefinition> {
        self.signals
            .iter()
            .find(|s| s.multiplexing == Multiplexing::Multiplexor)
    }

    pub fn is_multiplexed(&self) -> bool {
        self.signals
            .iter()
            .any(|s| s.multiplexing != Multiplexing::Plain)
    }
}

/// A CAN signal definition
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignalDefinition {
    /// Signal name
    pub name: String,
    start_bit: u16,
    length: u16,
    byte_order: ByteOrder,
    /// Value type (signed/unsigned/IEEE float)
    pub value_type: ValueType,
    /// Scale factor to convert raw value to physical value
    pub factor: f64,
    /// Offset to add after scaling
    pub offset: f64,
    /// Minimum physical value (documentation only)
    pub min: f64,
    /// Maximum physical value (documentation only)
    pub max: f64,
    /// Engineering unit (e.g., "km/h", "V")
    pub unit: Option<String>,
    /// Receiving nodes
    pub receivers: Vec<String>,
    /// Multiplexing role
    pub multiplexing: Multiplexing,
    /// Value descriptions from `VAL_` (raw value -> description)
    pub value_descriptions: BTreeMap<i64, String>,
    /// Comment from `CM_ SG_`
    pub comment: Option<String>,
    #[serde(skip)]
    layout: BitLayout,
}

impl SignalDefinition {
    /// Create a signal; the bit layout is computed here and fixed for the
    /// lifetime of the definition.
    pub fn new(name: impl Into<String>, start_bit: u16, length: u16, byte_order: ByteOrder) -> Self {
        Self {
            name: name.into(),
            start_bit,
            length,
            byte_order,
            value_type: ValueType::Unsigned,
            factor: 1.0,
            offset: 0.0,
            min: 0.0,
            max: 0.0,
            unit: None,
            receivers: Vec::new(),
            multiplexing: Multiplexing::Plain,
            value_descriptions: BTreeMap::new(),
            comment: None,
            layout: BitLayout::new(start_bit, length, byte_order),
        }
    }

    /// Builder method: set signedness
    pub fn with_value_type(mut self, value_type: ValueType) -> Self {
        self.value_type = value_type;
        self
    }

    /// Builder method: set the linear conversion
    pub fn with_scaling(mut self, factor: f64, offset: f64) -> Self {
        self.factor = factor;
        self.offset = offset;
        self
    }

    /// Builder method: set the documented physical range
    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Builder method: set the engineering unit
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        let unit = unit.into();
        self.unit = if unit.is_empty() { None } else { Some(unit) };
        self
    }

    /// Builder method: set the multiplexing role
    pub fn with_multiplexing(mut self, multiplexing: Multiplexing) -> Self {
        self.multiplexing = multiplexing;
        self
    }

    pub fn start_bit(&self) -> u16 {
        self.start_bit
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    pub fn layout(&self) -> &BitLayout {
        &self.layout
    }

    /// Inverse of the decode transform: physical value -> raw bits.
    ///
    /// Integer types round to the nearest raw step and wrap to the signal
    /// width (two's complement for signed signals).
    pub fn encode_physical(&self, physical: f64) -> u64 {
        let scaled = (physical - self.offset) / self.factor;
        let raw = match self.value_type {
            ValueType::Float32 => (scaled as f32).to_bits() as u64,
            ValueType::Float64 => scaled.to_bits(),
            ValueType::Signed => scaled.round() as i64 as u64,
            ValueType::Unsigned => scaled.round() as u64,
        };
        if self.length >= 64 {
            raw
        } else {
            raw & ((1u64 << self.length) - 1)
        }
    }

    /// Description for a raw value from the `VAL_` table, if any
    pub fn describe(&self, raw: i64) -> Option<&str> {
        self.value_descriptions.get(&raw).map(String::as_str)
    }
}

/// Byte order for signal extraction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ByteOrder {
    /// Little-endian (Intel format), DBC marker `1`
    LittleEndian,
    /// Big-endian (Motorola format), DBC marker `0`
    BigEndian,
}

/// Value type for signal interpretation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueType {
    /// Two's complement integer
    Signed,
    /// Unsigned integer
    Unsigned,
    /// IEEE 754 single precision (`SIG_VALTYPE_ ... 1`)
    Float32,
    /// IEEE 754 double precision (`SIG_VALTYPE_ ... 2`)
    Float64,
}

/// Role of a signal in simple DBC multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Multiplexing {
    /// Always present
    Plain,
    /// The switch signal (`M`)
    Multiplexor,
    /// Present only when the switch equals this value (`mN`)
    Multiplexed(u64),
}

/// The parsed, immutable network definition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkDefinition {
    version: Option<String>,
    nodes: Vec<String>,
    messages: Vec<MessageDefinition>,
    /// Key: (CAN ID, extended flag), Value: index into `messages`
    index: HashMap<(u32, bool), usize>,
}

impl NetworkDefinition {
    /// An empty definition: every frame decodes as unknown
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a definition from messages, rejecting duplicate identifiers
    pub fn new(messages: Vec<MessageDefinition>) -> Result<Self> {
        Self::with_metadata(None, Vec::new(), messages)
    }

    pub fn with_metadata(
        version: Option<String>,
        nodes: Vec<String>,
        messages: Vec<MessageDefinition>,
    ) -> Result<Self> {
        let mut index = HashMap::with_capacity(messages.len());
        for (idx, message) in messages.iter().enumerate() {
            if index.insert((message.id, message.is_extended), idx).is_some() {
                return Err(TranscoderError::InvalidDefinition(format!(
                    "duplicate message ID 0x{:X} ({})",
                    message.id, message.name
                )));
            }
        }

        Ok(Self {
            version,
            nodes,
            messages,
            index,
        })
    }

    /// Get the message definition for a frame's identifier and frame format.
    ///
    /// A standard frame never matches an extended definition with the same
    /// numeric ID, and vice versa.
    pub fn lookup(&self, can_id: u32, is_extended: bool) -> Option<&MessageDefinition> {
        self.index
            .get(&(can_id, is_extended))
            .map(|&idx| &self.messages[idx])
    }

    /// Get the message definition for a CAN ID, preferring the standard
    /// definition when both formats are defined
    pub fn message(&self, can_id: u32) -> Option<&MessageDefinition> {
        self.lookup(can_id, false)
            .or_else(|| self.lookup(can_id, true))
    }

    /// Get a message definition by name
    pub fn message_by_name(&self, name: &str) -> Option<&MessageDefinition> {
        self.messages.iter().find(|m| m.name == name)
    }

    /// All messages in DBC declaration order
    pub fn messages(&self) -> &[MessageDefinition] {
        &self.messages
    }

    /// Find all messages containing a specific signal name
    pub fn find_signal(&self, signal_name: &str) -> Vec<(u32, &SignalDefinition)> {
        self.messages
            .iter()
            .filter_map(|m| m.signal(signal_name).map(|s| (m.id, s)))
            .collect()
    }

    /// All CAN IDs, sorted
    pub fn can_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.index.keys().map(|&(id, _)| id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// DBC `VERSION` string
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    /// Nodes declared in `BU_`
    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Get definition statistics
    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            num_messages: self.messages.len(),
            num_signals: self.messages.iter().map(|m| m.signals.len()).sum(),
            num_multiplexed: self.messages.iter().filter(|m| m.is_multiplexed()).count(),
        }
    }
}

/// Definition statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DatabaseStats {
    /// Total number of message definitions
    pub num_messages: usize,
    /// Total number of signal definitions
    pub num_signals: usize,
    /// Messages that carry multiplexed signals
    pub num_multiplexed: usize,
}
