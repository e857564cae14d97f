//! Message Decoding Engine
//!
//! Turns a raw CAN frame into a [`DecodedRecord`] using the network
//! definition. Handles bit extraction (via each signal's precomputed layout),
//! sign extension, IEEE float reinterpretation, multiplexing, and physical
//! value conversion.

use crate::signals::database::{
    MessageDefinition, Multiplexing, NetworkDefinition, SignalDefinition, ValueType,
};
use crate::types::{DecodeWarning, DecodedRecord, DecodedSignal, RecordStatus, TimestampedFrame};

/// Message decoder - extracts signals from CAN frames
pub struct MessageDecoder;

impl MessageDecoder {
    /// Decode one frame.
    ///
    /// Never fails: an unknown identifier yields an `Unknown` record carrying
    /// the frame, and signals reaching past the payload or past the message's
    /// declared size decode as missing.
    pub fn decode(network: &NetworkDefinition, source: &TimestampedFrame) -> DecodedRecord {
        let frame = &source.frame;
        let Some(message) = network.lookup(frame.can_id, frame.is_extended) else {
            log::trace!("No definition for CAN ID 0x{:X}", frame.can_id);
            return DecodedRecord::unknown(source);
        };

        // The multiplexor is resolved first: Some(Err(_)) means it is defined but unreadable
        let switch = message
            .multiplexor()
            .map(|m| Self::extract(message, m, source));
        let multiplexer_value = match &switch {
            Some(Ok(value)) => Some(*value),
            _ => None,
        };

        let mut signals = Vec::with_capacity(message.signals.len());
        let mut warnings = Vec::new();

        for signal in &message.signals {
            let mut switch_missing = false;
            if let Multiplexing::Multiplexed(selector) = signal.multiplexing {
                match &switch {
                    Some(Ok(active)) if *active != selector => continue,
                    Some(Err(_)) => switch_missing = true,
                    _ => {}
                }
            }

            let raw = if switch_missing {
                None
            } else {
                match Self::extract(message, signal, source) {
                    Ok(raw) => Some(raw),
                    Err(warning) => {
                        warnings.push(warning);
                        None
                    }
                }
            };

            signals.push(Self::decode_signal(signal, raw));
        }

        let status = if signals.iter().any(DecodedSignal::is_missing) {
            RecordStatus::Partial
        } else {
            RecordStatus::Decoded
        };

        DecodedRecord {
            timestamp: source.timestamp,
            can_id: frame.can_id,
            message_name: Some(message.name.clone()),
            status,
            signals,
            multiplexer_value,
            frame: *frame,
            warnings,
        }
    }

    /// Raw bits of one signal, bounded by both the declared message size and the frame's DLC
    fn extract(
        message: &MessageDefinition,
        signal: &SignalDefinition,
        source: &TimestampedFrame,
    ) -> Result<u64, DecodeWarning> {
        let frame = &source.frame;
        let required_bytes = signal.layout().required_bytes();

        if required_bytes > message.size {
            log::warn!(
                "Signal '{}' of {} requires {} bytes but the message is declared with {}",
                signal.name,
                message.name,
                required_bytes,
                message.size
            );
            return Err(DecodeWarning::SignalOutsideMessage {
                signal: signal.name.clone(),
                required_bytes,
                message_size: message.size,
            });
        }

        signal.layout().extract(frame.data()).ok_or_else(|| {
            log::warn!(
                "Signal '{}' of {} requires {} bytes but frame only has {}",
                signal.name,
                message.name,
                required_bytes,
                frame.dlc()
            );
            DecodeWarning::SignalTruncated {
                signal: signal.name.clone(),
                required_bytes,
                dlc: frame.dlc(),
            }
        })
    }

    /// Build the decoded signal from its raw bits (`None` = missing)
    fn decode_signal(signal: &SignalDefinition, raw: Option<u64>) -> DecodedSignal {
        let (value, value_description) = match raw {
            Some(raw) => {
                let (base, key) = Self::interpret(signal, raw);
                let description = key
                    .and_then(|k| signal.describe(k))
                    .map(str::to_string);
                (Some(base * signal.factor + signal.offset), description)
            }
            None => (None, None),
        };

        DecodedSignal {
            name: signal.name.clone(),
            value,
            raw_value: raw,
            unit: signal.unit.clone(),
            value_description,
        }
    }

    /// Numeric value of the raw bits before scaling, plus the `VAL_` lookup key
    fn interpret(signal: &SignalDefinition, raw: u64) -> (f64, Option<i64>) {
        match signal.value_type {
            ValueType::Unsigned => (raw as f64, Some(raw as i64)),
            ValueType::Signed => {
                let value = Self::sign_extend(raw, signal.length());
                (value as f64, Some(value))
            }
            ValueType::Float32 => (f32::from_bits(raw as u32) as f64, None),
            ValueType::Float64 => (f64::from_bits(raw), None),
        }
    }

    /// Sign-extend a value from N bits to 64 bits
    ///
    /// If the value's MSB is 1, fill the upper bits with 1s.
    fn sign_extend(value: u64, bit_length: u16) -> i64 {
        if bit_length == 0 {
            return 0;
        }
        if bit_length >= 64 {
            return value as i64;
        }

        let sign_bit = 1u64 << (bit_length - 1);
        if (value & sign_bit) != 0 {
            let mask = !0u64 << bit_length;
            (value | mask) as i64
        } else {
            value as i64
        }
    }
}
