// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! E1.31 data packets: framing + DMP layers.
//!
//! Two shapes share the wire format:
//! - [`DataPacket`] is the decoded, owned view handed to receivers.
//! - [`DataTemplate`] is the encoder: a pre-sized buffer with every
//!   flags-and-length field back-patched at construction, mutated in place at
//!   fixed offsets so a source can emit 44 frames a second per universe
//!   without reserializing.

use super::constants::*;
use super::error::ParseError;
use super::root::{
    check_pdu_length, decode_source_name, encode_source_name, flags_and_length,
    read_flags_and_length, write_root,
};
use crate::cid::Cid;

/// Data framing options bitfield.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketOptions {
    /// Data is for visualizers/preview only; not for live output.
    pub preview: bool,
    /// The source is dropping this universe.
    pub terminated: bool,
    /// Hold output until synchronization resumes (parsed, not acted on).
    pub force_sync: bool,
}

impl PacketOptions {
    pub(crate) fn to_byte(self) -> u8 {
        let mut b = 0;
        if self.preview {
            b |= OPTION_PREVIEW;
        }
        if self.terminated {
            b |= OPTION_TERMINATED;
        }
        if self.force_sync {
            b |= OPTION_FORCE_SYNC;
        }
        b
    }

    pub(crate) fn from_byte(b: u8) -> Self {
        Self {
            preview: b & OPTION_PREVIEW != 0,
            terminated: b & OPTION_TERMINATED != 0,
            force_sync: b & OPTION_FORCE_SYNC != 0,
        }
    }
}

/// A decoded E1.31 data packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPacket {
    pub cid: Cid,
    pub source_name: String,
    /// Universe priority, 0..=200.
    pub priority: u8,
    /// Synchronization address; carried but not acted on.
    pub sync_address: u16,
    pub sequence: u8,
    pub options: PacketOptions,
    pub universe: u16,
    /// 0x00 for levels, 0xDD for per-address priority.
    pub start_code: u8,
    /// Slot values; up to 512.
    pub values: Vec<u8>,
}

impl DataPacket {
    /// Whether this is a per-address-priority (0xDD) frame.
    pub fn is_priority_frame(&self) -> bool {
        self.start_code == STARTCODE_PRIORITY
    }

    /// Encode into a fresh buffer. The transmit path uses [`DataTemplate`]
    /// instead; this exists for tests and one-shot senders.
    pub fn encode(&self) -> Vec<u8> {
        let mut template = DataTemplate::new(
            &self.cid,
            &self.source_name,
            self.universe,
            self.priority,
            self.start_code,
            self.values.len(),
        );
        template.set_sync_address(self.sync_address);
        template.set_sequence(self.sequence);
        template.set_options(self.options);
        template.set_values(&self.values);
        template.into_bytes()
    }
}

/// Parse the framing + DMP layers of a data packet. The root layer has
/// already been validated and yielded `cid`.
pub(crate) fn parse_data(cid: Cid, data: &[u8]) -> Result<DataPacket, ParseError> {
    if data.len() < DATA_PACKET_MIN {
        return Err(ParseError::TooShort {
            expected: DATA_PACKET_MIN,
            actual: data.len(),
        });
    }

    // Framing layer.
    let declared = read_flags_and_length(data, OFF_FRAMING_FLAGS, "framing")?;
    check_pdu_length(data, OFF_FRAMING_FLAGS, declared, "framing")?;
    let vector = u32::from_be_bytes([data[40], data[41], data[42], data[43]]);
    if vector != VECTOR_FRAMING_DATA {
        return Err(ParseError::UnknownVector {
            layer: "framing",
            vector,
        });
    }

    let source_name = decode_source_name(&data[OFF_SOURCE_NAME..OFF_SOURCE_NAME + SOURCE_NAME_LEN]);
    let priority = data[OFF_PRIORITY];
    if priority > PRIORITY_MAX {
        return Err(ParseError::InvalidPriority(priority));
    }
    let sync_address = u16::from_be_bytes([data[OFF_SYNC_ADDRESS], data[OFF_SYNC_ADDRESS + 1]]);
    let sequence = data[OFF_SEQUENCE];
    let options = PacketOptions::from_byte(data[OFF_OPTIONS]);
    let universe = u16::from_be_bytes([data[OFF_UNIVERSE], data[OFF_UNIVERSE + 1]]);
    if !(UNIVERSE_MIN..=UNIVERSE_MAX).contains(&universe) {
        return Err(ParseError::InvalidUniverse(universe));
    }

    // DMP layer.
    let declared = read_flags_and_length(data, OFF_DMP_FLAGS, "DMP")?;
    check_pdu_length(data, OFF_DMP_FLAGS, declared, "DMP")?;
    if data[OFF_DMP_VECTOR] != VECTOR_DMP_SET_PROPERTY {
        return Err(ParseError::UnknownVector {
            layer: "DMP",
            vector: u32::from(data[OFF_DMP_VECTOR]),
        });
    }
    if data[OFF_DMP_ADDRESS..OFF_DMP_ADDRESS + 5] != DMP_ADDRESS_BLOCK {
        return Err(ParseError::UnknownVector {
            layer: "DMP address",
            vector: u32::from(data[OFF_DMP_ADDRESS]),
        });
    }

    // Count includes the start code byte.
    let count = u16::from_be_bytes([data[OFF_PROPERTY_COUNT], data[OFF_PROPERTY_COUNT + 1]]);
    if count == 0 || count as usize > SLOT_COUNT + 1 {
        return Err(ParseError::BadPropertyCount(count));
    }
    if count as usize - 1 != data.len() - OFF_VALUES {
        return Err(ParseError::BadPropertyCount(count));
    }

    let start_code = data[OFF_STARTCODE];
    if start_code != STARTCODE_LEVELS && start_code != STARTCODE_PRIORITY {
        return Err(ParseError::UnknownStartCode(start_code));
    }

    Ok(DataPacket {
        cid,
        source_name,
        priority,
        sync_address,
        sequence,
        options,
        universe,
        start_code,
        values: data[OFF_VALUES..].to_vec(),
    })
}

/// Pre-serialized data packet with in-place mutators.
///
/// All flags-and-length fields are written once at construction; the value
/// count is fixed for the template's lifetime (sources always carry the full
/// 512 slots).
#[derive(Debug, Clone)]
pub struct DataTemplate {
    buf: Vec<u8>,
}

impl DataTemplate {
    /// Build a template for `value_count` slot values (1..=512).
    pub fn new(
        cid: &Cid,
        source_name: &str,
        universe: u16,
        priority: u8,
        start_code: u8,
        value_count: usize,
    ) -> Self {
        debug_assert!((1..=SLOT_COUNT).contains(&value_count));
        let total = OFF_VALUES + value_count;
        let mut buf = vec![0u8; total];

        write_root(&mut buf, cid, VECTOR_ROOT_DATA);

        buf[OFF_FRAMING_FLAGS..OFF_FRAMING_FLAGS + 2]
            .copy_from_slice(&flags_and_length(total - OFF_FRAMING_FLAGS).to_be_bytes());
        buf[OFF_FRAMING_VECTOR..OFF_FRAMING_VECTOR + 4]
            .copy_from_slice(&VECTOR_FRAMING_DATA.to_be_bytes());
        buf[OFF_SOURCE_NAME..OFF_SOURCE_NAME + SOURCE_NAME_LEN]
            .copy_from_slice(&encode_source_name(source_name));
        buf[OFF_PRIORITY] = priority;
        buf[OFF_UNIVERSE..OFF_UNIVERSE + 2].copy_from_slice(&universe.to_be_bytes());

        buf[OFF_DMP_FLAGS..OFF_DMP_FLAGS + 2]
            .copy_from_slice(&flags_and_length(total - OFF_DMP_FLAGS).to_be_bytes());
        buf[OFF_DMP_VECTOR] = VECTOR_DMP_SET_PROPERTY;
        buf[OFF_DMP_ADDRESS..OFF_DMP_ADDRESS + 5].copy_from_slice(&DMP_ADDRESS_BLOCK);
        buf[OFF_PROPERTY_COUNT..OFF_PROPERTY_COUNT + 2]
            .copy_from_slice(&((value_count + 1) as u16).to_be_bytes());
        buf[OFF_STARTCODE] = start_code;

        Self { buf }
    }

    /// Full-size template for a source universe: 512 slots.
    pub fn full(cid: &Cid, source_name: &str, universe: u16, priority: u8, start_code: u8) -> Self {
        Self::new(cid, source_name, universe, priority, start_code, SLOT_COUNT)
    }

    pub fn set_sequence(&mut self, sequence: u8) {
        self.buf[OFF_SEQUENCE] = sequence;
    }

    pub fn set_options(&mut self, options: PacketOptions) {
        self.buf[OFF_OPTIONS] = options.to_byte();
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.buf[OFF_PRIORITY] = priority;
    }

    pub fn set_sync_address(&mut self, sync_address: u16) {
        self.buf[OFF_SYNC_ADDRESS..OFF_SYNC_ADDRESS + 2]
            .copy_from_slice(&sync_address.to_be_bytes());
    }

    pub fn set_name(&mut self, source_name: &str) {
        self.buf[OFF_SOURCE_NAME..OFF_SOURCE_NAME + SOURCE_NAME_LEN]
            .copy_from_slice(&encode_source_name(source_name));
    }

    /// Overwrite the slot values. `values` must match the template's count.
    pub fn set_values(&mut self, values: &[u8]) {
        debug_assert_eq!(values.len(), self.buf.len() - OFF_VALUES);
        self.buf[OFF_VALUES..].copy_from_slice(values);
    }

    /// Overwrite one slot value.
    pub fn set_value(&mut self, slot: usize, value: u8) {
        self.buf[OFF_VALUES + slot] = value;
    }

    /// The wire bytes, ready for `send`.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}
