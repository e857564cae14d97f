//! Bit layout of a signal inside a frame payload
//!
//! A layout is computed once per signal when the DBC is parsed and then shared
//! by extraction (decode) and packing (encode), so the two are inverses by
//! construction.

use crate::signals::database::ByteOrder;

/// One contiguous run of bits within a single payload byte
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitSpan {
    pub byte_index: usize,
    /// Lowest bit position within the byte (0..=7)
    pub bit_offset: u8,
    /// Number of consecutive bits in this span (1..=8)
    pub num_bits: u8,
    /// Where these bits land in the raw value, LSB-relative
    pub value_shift: u8,
}

/// Precomputed mapping from DBC start bit + byte order to payload bytes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitLayout {
    segments: Vec<BitSpan>,
    length: u16,
}

impl BitLayout {
    /// Build a layout from DBC signal coordinates.
    ///
    /// Intel: `start_bit` is the LSB; bits walk upward and continue at bit 0
    /// of the next byte. Motorola: `start_bit` is the MSB in DBC sawtooth
    /// numbering (`byte * 8 + bit`, bit 0 = LSB of the byte); bits walk
    /// downward and continue at bit 7 of the next byte.
    pub fn new(start_bit: u16, length: u16, byte_order: ByteOrder) -> Self {
        let mut segments = Vec::new();
        let mut byte_index = (start_bit / 8) as usize;
        let mut bit_index = (start_bit % 8) as u8;
        let mut remaining = length as u32;

        match byte_order {
            ByteOrder::BigEndian => {
                // First bits taken are the MSBs of the raw value
                while remaining > 0 {
                    let num_bits = std::cmp::min(bit_index as u32 + 1, remaining) as u8;
                    let bit_offset = bit_index + 1 - num_bits;
                    remaining -= num_bits as u32;
                    segments.push(BitSpan {
                        byte_index,
                        bit_offset,
                        num_bits,
                        value_shift: remaining as u8,
                    });
                    byte_index += 1;
                    bit_index = 7;
                }
            }
            ByteOrder::LittleEndian => {
                let mut value_shift: u32 = 0;
                while remaining > 0 {
                    let num_bits = std::cmp::min(8 - bit_index as u32, remaining) as u8;
                    segments.push(BitSpan {
                        byte_index,
                        bit_offset: bit_index,
                        num_bits,
                        value_shift: value_shift as u8,
                    });
                    value_shift += num_bits as u32;
                    remaining -= num_bits as u32;
                    byte_index += 1;
                    bit_index = 0;
                }
            }
        }

        Self { segments, length }
    }

    pub fn length(&self) -> u16 {
        self.length
    }

    pub fn segments(&self) -> &[BitSpan] {
        &self.segments
    }

    /// Number of payload bytes the signal touches, counted from byte 0
    pub fn required_bytes(&self) -> usize {
        self.segments
            .iter()
            .map(|s| s.byte_index + 1)
            .max()
            .unwrap_or(0)
    }

    /// Extract the raw unsigned bits, or `None` if the payload is too short
    pub fn extract(&self, data: &[u8]) -> Option<u64> {
        if self.required_bytes() > data.len() {
            return None;
        }

        let mut result: u64 = 0;
        for span in &self.segments {
            let mask = ((1u16 << span.num_bits) - 1) as u8;
            let bits = (data[span.byte_index] >> span.bit_offset) & mask;
            result |= (bits as u64) << span.value_shift;
        }
        Some(result)
    }

    /// Write raw bits into the payload, leaving other signals' bits untouched.
    ///
    /// Segments beyond the end of `data` are skipped.
    pub fn pack(&self, raw: u64, data: &mut [u8]) {
        for span in &self.segments {
            if span.byte_index >= data.len() {
                continue;
            }
            let mask = ((1u16 << span.num_bits) - 1) as u8;
            let bits = ((raw >> span.value_shift) as u8) & mask;
            data[span.byte_index] &= !(mask << span.bit_offset);
            data[span.byte_index] |= bits << span.bit_offset;
        }
    }
}
