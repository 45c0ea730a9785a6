// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! ACN root layer: preamble, packet identifier, flags-and-length helpers.

use super::constants::*;
use super::error::ParseError;
use crate::cid::Cid;

/// Encode a flags-and-length field: high nibble 0x7, low 12 bits the PDU
/// length counted from the field itself.
pub(crate) fn flags_and_length(length: usize) -> u16 {
    0x7000 | (length & 0x0fff) as u16
}

/// Read and validate a flags-and-length field at `off`.
///
/// Returns the declared PDU length. The caller compares it against the bytes
/// actually present; UDP delivers whole datagrams, so strict equality is the
/// right check.
pub(crate) fn read_flags_and_length(
    data: &[u8],
    off: usize,
    layer: &'static str,
) -> Result<usize, ParseError> {
    if data.len() < off + 2 {
        return Err(ParseError::TooShort {
            expected: off + 2,
            actual: data.len(),
        });
    }
    let raw = u16::from_be_bytes([data[off], data[off + 1]]);
    let flags = (raw >> 12) as u8;
    if flags != 0x7 {
        return Err(ParseError::BadFlags { layer, flags });
    }
    Ok((raw & 0x0fff) as usize)
}

/// Validate declared PDU length against the wire at `off`.
pub(crate) fn check_pdu_length(
    data: &[u8],
    off: usize,
    declared: usize,
    layer: &'static str,
) -> Result<(), ParseError> {
    let actual = data.len() - off;
    if declared != actual {
        return Err(ParseError::LengthMismatch {
            layer,
            declared,
            actual,
        });
    }
    Ok(())
}

/// Write the 38-byte root layer into the head of `buf`.
///
/// `buf` must already be sized for the full packet; the root PDU length is
/// derived from it.
pub(crate) fn write_root(buf: &mut [u8], cid: &Cid, vector: u32) {
    buf[0..2].copy_from_slice(&PREAMBLE_SIZE.to_be_bytes());
    buf[2..4].copy_from_slice(&POSTAMBLE_SIZE.to_be_bytes());
    buf[4..16].copy_from_slice(&ACN_IDENTIFIER);
    let root_len = buf.len() - OFF_ROOT_FLAGS;
    buf[OFF_ROOT_FLAGS..OFF_ROOT_FLAGS + 2].copy_from_slice(&flags_and_length(root_len).to_be_bytes());
    buf[OFF_ROOT_VECTOR..OFF_ROOT_VECTOR + 4].copy_from_slice(&vector.to_be_bytes());
    buf[OFF_CID..OFF_CID + 16].copy_from_slice(cid.as_bytes());
}

/// Parse and validate the root layer.
///
/// Returns the source CID and the root vector; the payload starts at byte 38.
pub(crate) fn parse_root(data: &[u8]) -> Result<(Cid, u32), ParseError> {
    if data.len() < OFF_FRAMING_FLAGS {
        return Err(ParseError::TooShort {
            expected: OFF_FRAMING_FLAGS,
            actual: data.len(),
        });
    }

    let preamble = u16::from_be_bytes([data[0], data[1]]);
    if preamble != PREAMBLE_SIZE {
        return Err(ParseError::BadPreamble(preamble));
    }
    let postamble = u16::from_be_bytes([data[2], data[3]]);
    if postamble != POSTAMBLE_SIZE {
        return Err(ParseError::BadPostamble(postamble));
    }
    if data[4..16] != ACN_IDENTIFIER {
        return Err(ParseError::BadIdentifier);
    }

    let declared = read_flags_and_length(data, OFF_ROOT_FLAGS, "root")?;
    check_pdu_length(data, OFF_ROOT_FLAGS, declared, "root")?;

    let vector = u32::from_be_bytes([data[18], data[19], data[20], data[21]]);
    let mut cid = [0u8; 16];
    cid.copy_from_slice(&data[OFF_CID..OFF_CID + 16]);

    Ok((Cid::from_bytes(cid), vector))
}

/// Serialize a source name into its 64-byte NUL-padded field, truncating on a
/// UTF-8 boundary so the field never ends mid-codepoint. At most 63 bytes of
/// name are kept; the final byte is always NUL.
pub(crate) fn encode_source_name(name: &str) -> [u8; SOURCE_NAME_LEN] {
    let mut field = [0u8; SOURCE_NAME_LEN];
    let mut end = name.len().min(SOURCE_NAME_LEN - 1);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    field[..end].copy_from_slice(&name.as_bytes()[..end]);
    field
}

/// Read a NUL-padded name field. Non-UTF-8 bytes are replaced rather than
/// rejecting the datagram; the name is informational.
pub(crate) fn decode_source_name(field: &[u8]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_and_length_nibble() {
        assert_eq!(flags_and_length(0x26e), 0x726e);
        assert_eq!(flags_and_length(8), 0x7008);
    }

    #[test]
    fn test_root_roundtrip() {
        let cid = Cid::from_bytes([9; 16]);
        let mut buf = vec![0u8; 64];
        write_root(&mut buf, &cid, VECTOR_ROOT_DATA);

        let (parsed_cid, vector) = parse_root(&buf).expect("root should parse");
        assert_eq!(parsed_cid, cid);
        assert_eq!(vector, VECTOR_ROOT_DATA);
    }

    #[test]
    fn test_bad_preamble_rejected() {
        let mut buf = vec![0u8; 64];
        write_root(&mut buf, &Cid::zero(), VECTOR_ROOT_DATA);
        buf[0] = 0xff;
        assert!(matches!(parse_root(&buf), Err(ParseError::BadPreamble(_))));
    }

    #[test]
    fn test_bad_identifier_rejected() {
        let mut buf = vec![0u8; 64];
        write_root(&mut buf, &Cid::zero(), VECTOR_ROOT_DATA);
        buf[5] = b'X';
        assert!(matches!(parse_root(&buf), Err(ParseError::BadIdentifier)));
    }

    #[test]
    fn test_bad_flags_rejected() {
        let mut buf = vec![0u8; 64];
        write_root(&mut buf, &Cid::zero(), VECTOR_ROOT_DATA);
        buf[OFF_ROOT_FLAGS] = 0x30; // high nibble 3
        assert!(matches!(
            parse_root(&buf),
            Err(ParseError::BadFlags { layer: "root", .. })
        ));
    }

    #[test]
    fn test_root_length_mismatch_rejected() {
        let mut buf = vec![0u8; 64];
        write_root(&mut buf, &Cid::zero(), VECTOR_ROOT_DATA);
        buf.push(0); // trailing garbage
        assert!(matches!(
            parse_root(&buf),
            Err(ParseError::LengthMismatch { layer: "root", .. })
        ));
    }

    #[test]
    fn test_name_truncates_on_char_boundary() {
        // 21 x "abc" = 63 bytes fits; one more multi-byte char must not split.
        let name = "é".repeat(40); // 80 bytes of 2-byte chars
        let field = encode_source_name(&name);
        assert_eq!(field[63], 0);
        let decoded = decode_source_name(&field);
        // 62 bytes = 31 chars; byte 63 would split a codepoint.
        assert_eq!(decoded.chars().count(), 31);
    }

    #[test]
    fn test_name_roundtrip() {
        let field = encode_source_name("Console A");
        assert_eq!(decode_source_name(&field), "Console A");
    }
}
