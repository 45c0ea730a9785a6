// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! E1.31 universe discovery packets.
//!
//! A source announces the sorted list of universes it transmits, paged at 512
//! numbers per packet. Page and last-page are 8-bit, bounding a source at
//! 256 × 512 announced universes.

use super::constants::*;
use super::error::ParseError;
use super::root::{
    check_pdu_length, decode_source_name, encode_source_name, flags_and_length,
    read_flags_and_length, write_root,
};
use crate::cid::Cid;

/// A decoded universe discovery page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryPacket {
    pub cid: Cid,
    pub source_name: String,
    pub page: u8,
    pub last_page: u8,
    /// Universe numbers on this page, in wire order.
    pub universes: Vec<u16>,
}

impl DiscoveryPacket {
    /// Encode into a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        encode_page(
            &self.cid,
            &self.source_name,
            self.page,
            self.last_page,
            &self.universes,
        )
    }
}

/// Encode one discovery page.
pub(crate) fn encode_page(
    cid: &Cid,
    source_name: &str,
    page: u8,
    last_page: u8,
    universes: &[u16],
) -> Vec<u8> {
    debug_assert!(universes.len() <= DISCOVERY_UNIVERSES_PER_PAGE);
    let total = OFF_DISCOVERY_LIST + 2 * universes.len();
    let mut buf = vec![0u8; total];

    write_root(&mut buf, cid, VECTOR_ROOT_EXTENDED);

    buf[OFF_FRAMING_FLAGS..OFF_FRAMING_FLAGS + 2]
        .copy_from_slice(&flags_and_length(total - OFF_FRAMING_FLAGS).to_be_bytes());
    buf[OFF_FRAMING_VECTOR..OFF_FRAMING_VECTOR + 4]
        .copy_from_slice(&VECTOR_EXTENDED_DISCOVERY.to_be_bytes());
    buf[OFF_SOURCE_NAME..OFF_SOURCE_NAME + SOURCE_NAME_LEN]
        .copy_from_slice(&encode_source_name(source_name));
    // 4 reserved bytes at OFF_DISCOVERY_RESERVED stay zero.

    buf[OFF_DISCOVERY_LAYER_FLAGS..OFF_DISCOVERY_LAYER_FLAGS + 2]
        .copy_from_slice(&flags_and_length(total - OFF_DISCOVERY_LAYER_FLAGS).to_be_bytes());
    buf[OFF_DISCOVERY_LAYER_VECTOR..OFF_DISCOVERY_LAYER_VECTOR + 4]
        .copy_from_slice(&VECTOR_DISCOVERY_UNIVERSE_LIST.to_be_bytes());
    buf[OFF_DISCOVERY_PAGE] = page;
    buf[OFF_DISCOVERY_LAST_PAGE] = last_page;

    for (i, universe) in universes.iter().enumerate() {
        let off = OFF_DISCOVERY_LIST + 2 * i;
        buf[off..off + 2].copy_from_slice(&universe.to_be_bytes());
    }

    buf
}

/// Split a sorted universe list into discovery pages.
///
/// Returns `(page, last_page, slice)` triples. An empty list still yields one
/// empty page so receivers see "this source transmits nothing". Lists beyond
/// the 256-page cap are truncated.
pub(crate) fn paginate(universes: &[u16]) -> Vec<(u8, u8, &[u16])> {
    let max = DISCOVERY_MAX_PAGES * DISCOVERY_UNIVERSES_PER_PAGE;
    let universes = &universes[..universes.len().min(max)];

    let page_count = universes.len().div_ceil(DISCOVERY_UNIVERSES_PER_PAGE).max(1);
    let last_page = (page_count - 1) as u8;

    (0..page_count)
        .map(|p| {
            let start = p * DISCOVERY_UNIVERSES_PER_PAGE;
            let end = (start + DISCOVERY_UNIVERSES_PER_PAGE).min(universes.len());
            (p as u8, last_page, &universes[start..end])
        })
        .collect()
}

/// Parse the extended framing + universe discovery layers. The root layer has
/// already been validated and yielded `cid`.
pub(crate) fn parse_discovery(cid: Cid, data: &[u8]) -> Result<DiscoveryPacket, ParseError> {
    if data.len() < DISCOVERY_PACKET_MIN {
        return Err(ParseError::TooShort {
            expected: DISCOVERY_PACKET_MIN,
            actual: data.len(),
        });
    }

    // Extended framing layer.
    let declared = read_flags_and_length(data, OFF_FRAMING_FLAGS, "framing")?;
    check_pdu_length(data, OFF_FRAMING_FLAGS, declared, "framing")?;
    let vector = u32::from_be_bytes([data[40], data[41], data[42], data[43]]);
    if vector != VECTOR_EXTENDED_DISCOVERY {
        // Includes VECTOR_EXTENDED_SYNC: universe sync is not spoken here.
        return Err(ParseError::UnknownVector {
            layer: "extended framing",
            vector,
        });
    }

    let source_name = decode_source_name(&data[OFF_SOURCE_NAME..OFF_SOURCE_NAME + SOURCE_NAME_LEN]);

    // Universe discovery layer.
    let declared = read_flags_and_length(data, OFF_DISCOVERY_LAYER_FLAGS, "discovery")?;
    check_pdu_length(data, OFF_DISCOVERY_LAYER_FLAGS, declared, "discovery")?;
    let vector = u32::from_be_bytes([
        data[OFF_DISCOVERY_LAYER_VECTOR],
        data[OFF_DISCOVERY_LAYER_VECTOR + 1],
        data[OFF_DISCOVERY_LAYER_VECTOR + 2],
        data[OFF_DISCOVERY_LAYER_VECTOR + 3],
    ]);
    if vector != VECTOR_DISCOVERY_UNIVERSE_LIST {
        return Err(ParseError::UnknownVector {
            layer: "discovery",
            vector,
        });
    }

    let page = data[OFF_DISCOVERY_PAGE];
    let last_page = data[OFF_DISCOVERY_LAST_PAGE];

    let list_bytes = data.len() - OFF_DISCOVERY_LIST;
    if list_bytes % 2 != 0 || list_bytes / 2 > DISCOVERY_UNIVERSES_PER_PAGE {
        return Err(ParseError::BadUniverseList(list_bytes));
    }

    let universes = data[OFF_DISCOVERY_LIST..]
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();

    Ok(DiscoveryPacket {
        cid,
        source_name,
        page,
        last_page,
        universes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Packet;

    #[test]
    fn test_discovery_roundtrip() {
        let packet = DiscoveryPacket {
            cid: Cid::from_bytes([3; 16]),
            source_name: "Rack 4".into(),
            page: 1,
            last_page: 1,
            universes: vec![1, 2, 3, 700, 63999],
        };
        let bytes = packet.encode();
        match Packet::decode(&bytes).expect("decode should succeed") {
            Packet::Discovery(decoded) => assert_eq!(decoded, packet),
            Packet::Data(_) => panic!("wrong packet kind"),
        }
    }

    #[test]
    fn test_empty_page_roundtrip() {
        let packet = DiscoveryPacket {
            cid: Cid::zero(),
            source_name: String::new(),
            page: 0,
            last_page: 0,
            universes: vec![],
        };
        assert_eq!(packet.encode().len(), DISCOVERY_PACKET_MIN);
        assert!(Packet::decode(&packet.encode()).is_ok());
    }

    #[test]
    fn test_sync_framing_rejected() {
        let packet = DiscoveryPacket {
            cid: Cid::zero(),
            source_name: String::new(),
            page: 0,
            last_page: 0,
            universes: vec![],
        };
        let mut bytes = packet.encode();
        bytes[OFF_FRAMING_VECTOR..OFF_FRAMING_VECTOR + 4]
            .copy_from_slice(&VECTOR_EXTENDED_SYNC.to_be_bytes());
        assert_eq!(
            Packet::decode(&bytes),
            Err(ParseError::UnknownVector {
                layer: "extended framing",
                vector: VECTOR_EXTENDED_SYNC,
            })
        );
    }

    #[test]
    fn test_odd_list_rejected() {
        let packet = DiscoveryPacket {
            cid: Cid::zero(),
            source_name: String::new(),
            page: 0,
            last_page: 0,
            universes: vec![1],
        };
        let mut bytes = packet.encode();
        bytes.push(0);
        // Keep the length fields consistent so the list check is what fires.
        let total = bytes.len();
        bytes[OFF_ROOT_FLAGS..OFF_ROOT_FLAGS + 2]
            .copy_from_slice(&flags_and_length(total - OFF_ROOT_FLAGS).to_be_bytes());
        bytes[OFF_FRAMING_FLAGS..OFF_FRAMING_FLAGS + 2]
            .copy_from_slice(&flags_and_length(total - OFF_FRAMING_FLAGS).to_be_bytes());
        bytes[OFF_DISCOVERY_LAYER_FLAGS..OFF_DISCOVERY_LAYER_FLAGS + 2]
            .copy_from_slice(&flags_and_length(total - OFF_DISCOVERY_LAYER_FLAGS).to_be_bytes());
        assert_eq!(Packet::decode(&bytes), Err(ParseError::BadUniverseList(3)));
    }

    #[test]
    fn test_paginate_small_list() {
        let universes: Vec<u16> = (1..=5).collect();
        let pages = paginate(&universes);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0], (0, 0, &universes[..]));
    }

    #[test]
    fn test_paginate_700_universes() {
        let universes: Vec<u16> = (1..=700).collect();
        let pages = paginate(&universes);
        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].0, 0);
        assert_eq!(pages[0].1, 1);
        assert_eq!(pages[0].2.len(), 512);
        assert_eq!(pages[1].0, 1);
        assert_eq!(pages[1].2.len(), 188);
        assert_eq!(pages[1].2[187], 700);
    }

    #[test]
    fn test_paginate_empty() {
        let pages = paginate(&[]);
        assert_eq!(pages.len(), 1);
        assert!(pages[0].2.is_empty());
    }

    #[test]
    fn test_paginate_exact_page_boundary() {
        let universes: Vec<u16> = (1..=512).collect();
        let pages = paginate(&universes);
        assert_eq!(pages.len(), 1);
        assert_eq!(pages[0], (0, 0, &universes[..]));
    }
}
