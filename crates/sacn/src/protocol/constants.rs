// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Wire-format and timing constants for E1.31-2018.

use std::time::Duration;

// ============================================================================
// ACN root layer
// ============================================================================

/// RLP preamble size field, always 0x0010.
pub const PREAMBLE_SIZE: u16 = 0x0010;
/// RLP postamble size field, always 0x0000.
pub const POSTAMBLE_SIZE: u16 = 0x0000;
/// ACN packet identifier: "ASC-E1.17" NUL-padded to 12 bytes.
pub const ACN_IDENTIFIER: [u8; 12] = *b"ASC-E1.17\0\0\0";

/// Root vector: an E1.31 data framing layer follows.
pub const VECTOR_ROOT_DATA: u32 = 0x0000_0004;
/// Root vector: an E1.31 extended (discovery or sync) framing layer follows.
pub const VECTOR_ROOT_EXTENDED: u32 = 0x0000_0008;

// ============================================================================
// Framing layers
// ============================================================================

/// Data framing vector.
pub const VECTOR_FRAMING_DATA: u32 = 0x0000_0002;
/// Extended framing vector: universe discovery.
pub const VECTOR_EXTENDED_DISCOVERY: u32 = 0x0000_0002;
/// Extended framing vector: universe synchronization (decoded as unknown;
/// sync is not part of this runtime).
pub const VECTOR_EXTENDED_SYNC: u32 = 0x0000_0001;

/// Options bit 7: data is for preview/visualization only.
pub const OPTION_PREVIEW: u8 = 0x80;
/// Options bit 6: the source is terminating this universe.
pub const OPTION_TERMINATED: u8 = 0x40;
/// Options bit 5: hold output until synchronization resumes.
pub const OPTION_FORCE_SYNC: u8 = 0x20;

/// Source name field width (NUL-padded UTF-8).
pub const SOURCE_NAME_LEN: usize = 64;

// ============================================================================
// DMP layer
// ============================================================================

/// DMP vector: Set Property.
pub const VECTOR_DMP_SET_PROPERTY: u8 = 0x02;
/// Fixed address-and-data-type block: 0xa1, first address 0x0000, increment 1.
pub const DMP_ADDRESS_BLOCK: [u8; 5] = [0xa1, 0x00, 0x00, 0x00, 0x01];

/// DMX start code for level data.
pub const STARTCODE_LEVELS: u8 = 0x00;
/// DMX alternate start code for per-address priority.
pub const STARTCODE_PRIORITY: u8 = 0xDD;

/// DMX512-A slot count.
pub const SLOT_COUNT: usize = 512;

// ============================================================================
// Universe discovery layer
// ============================================================================

/// Universe discovery layer vector.
pub const VECTOR_DISCOVERY_UNIVERSE_LIST: u32 = 0x0000_0001;
/// Universe numbers carried per discovery page.
pub const DISCOVERY_UNIVERSES_PER_PAGE: usize = 512;
/// Pages are an 8-bit index, so at most 256 of them.
pub const DISCOVERY_MAX_PAGES: usize = 256;

// ============================================================================
// Addressing
// ============================================================================

/// sACN UDP port.
pub const SACN_PORT: u16 = 5568;
/// Lowest valid data universe.
pub const UNIVERSE_MIN: u16 = 1;
/// Highest valid data universe.
pub const UNIVERSE_MAX: u16 = 63999;
/// Reserved universe carrying discovery traffic (0xFAD6).
pub const DISCOVERY_UNIVERSE: u16 = 64214;

/// Highest valid priority (universe or per-address).
pub const PRIORITY_MAX: u8 = 200;
/// Default universe priority.
pub const PRIORITY_DEFAULT: u8 = 100;

// ============================================================================
// Fixed byte offsets
// ============================================================================
// The transmit hot path mutates sequence/options/levels in place, so the
// layout below is load-bearing, not documentation.

pub(crate) const OFF_ROOT_FLAGS: usize = 16;
pub(crate) const OFF_ROOT_VECTOR: usize = 18;
pub(crate) const OFF_CID: usize = 22;
pub(crate) const OFF_FRAMING_FLAGS: usize = 38;
pub(crate) const OFF_FRAMING_VECTOR: usize = 40;
pub(crate) const OFF_SOURCE_NAME: usize = 44;
pub(crate) const OFF_PRIORITY: usize = 108;
pub(crate) const OFF_SYNC_ADDRESS: usize = 109;
pub(crate) const OFF_SEQUENCE: usize = 111;
pub(crate) const OFF_OPTIONS: usize = 112;
pub(crate) const OFF_UNIVERSE: usize = 113;
pub(crate) const OFF_DMP_FLAGS: usize = 115;
pub(crate) const OFF_DMP_VECTOR: usize = 117;
pub(crate) const OFF_DMP_ADDRESS: usize = 118;
pub(crate) const OFF_PROPERTY_COUNT: usize = 123;
pub(crate) const OFF_STARTCODE: usize = 125;
pub(crate) const OFF_VALUES: usize = 126;

pub(crate) const OFF_DISCOVERY_RESERVED: usize = 108;
pub(crate) const OFF_DISCOVERY_LAYER_FLAGS: usize = 112;
pub(crate) const OFF_DISCOVERY_LAYER_VECTOR: usize = 114;
pub(crate) const OFF_DISCOVERY_PAGE: usize = 118;
pub(crate) const OFF_DISCOVERY_LAST_PAGE: usize = 119;
pub(crate) const OFF_DISCOVERY_LIST: usize = 120;

/// Data packet size carrying a full 512-slot payload.
pub const DATA_PACKET_MAX: usize = OFF_VALUES + SLOT_COUNT;
/// Smallest well-formed data packet (start code, zero value bytes).
pub const DATA_PACKET_MIN: usize = OFF_VALUES;
/// Smallest well-formed discovery packet (empty universe list).
pub const DISCOVERY_PACKET_MIN: usize = OFF_DISCOVERY_LIST;
/// Discovery packet carrying a full 512-universe page.
pub const DISCOVERY_PACKET_MAX: usize = OFF_DISCOVERY_LIST + 2 * DISCOVERY_UNIVERSES_PER_PAGE;

// ============================================================================
// Timing
// ============================================================================

/// Data transmit tick, 44 Hz.
pub const TICK_PERIOD: Duration = Duration::from_micros(22_730);
/// Ticks per keep-alive cycle; levels are refreshed on ticks 0/11/22/33.
pub const TICKS_PER_CYCLE: u8 = 44;
/// Universe discovery transmit interval.
pub const DISCOVERY_INTERVAL: Duration = Duration::from_secs(10);
/// Receiver sampling window after startup or socket addition.
pub const SAMPLING_PERIOD: Duration = Duration::from_millis(1500);
/// Wait for a 0xDD stream before acting on a new source's levels.
pub const PAP_WAIT: Duration = Duration::from_millis(1500);
/// Data/PAP loss timeout.
pub const SOURCE_LOSS_TIMEOUT: Duration = Duration::from_millis(2500);
/// Source-loss sweep cadence.
pub const LOSS_HEARTBEAT: Duration = Duration::from_millis(500);
/// Discovery source expiry: two missed discovery intervals.
pub const DISCOVERY_EXPIRY: Duration = Duration::from_secs(20);

/// Default cap on tracked sources per receiver universe.
pub const DEFAULT_SOURCE_LIMIT: usize = 4;
