//! Header-only decoding of routing fields
//!
//! The routing server decides where a frame goes by reading at most the first
//! two fields of the envelope (`to`, then `from`). Everything after them stays
//! undecoded; a forwarded frame is never parsed beyond its header.

use super::error::NetError;
use super::types::{MAX_VARINT32_BYTES, NodeId, TAG_FROM, TAG_ID, TAG_TO};
use bytes::BufMut;

/// Maximum bytes of a 64-bit varint.
const MAX_VARINT64_BYTES: usize = 10;

// =============================================================================
// VARINT PRIMITIVES
// =============================================================================

/// Decode a protobuf int32 varint from the front of `buf`.
///
/// Returns `Ok(None)` when `buf` ends before the varint does. A fifth byte
/// with its continuation bit set belongs to a ten-byte negative varint, and a
/// fifth byte that sets bit 31 decodes negative; both are rejected.
pub fn decode_varint32(buf: &[u8], what: &str) -> Result<Option<(u32, usize)>, NetError> {
    let mut result: u32 = 0;

    for (i, &byte) in buf.iter().take(MAX_VARINT32_BYTES).enumerate() {
        if i == MAX_VARINT32_BYTES - 1 {
            if byte & 0x80 != 0 {
                return Err(NetError::corrupted(format!("invalid {}", what)));
            }
            result |= (byte as u32) << 28;
            if (result as i32) < 0 {
                return Err(NetError::corrupted(format!("invalid {}", what)));
            }
            return Ok(Some((result, MAX_VARINT32_BYTES)));
        }

        result |= ((byte & 0x7f) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((result, i + 1)));
        }
    }

    Ok(None)
}

/// Decode an unsigned 64-bit varint from the front of `buf`.
pub fn decode_varint64(buf: &[u8]) -> Result<Option<(u64, usize)>, NetError> {
    let mut result: u64 = 0;

    for (i, &byte) in buf.iter().take(MAX_VARINT64_BYTES).enumerate() {
        if i == MAX_VARINT64_BYTES - 1 && byte > 1 {
            return Err(NetError::corrupted("varint overflows 64 bits"));
        }
        result |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((result, i + 1)));
        }
    }

    if buf.len() >= MAX_VARINT64_BYTES {
        return Err(NetError::corrupted("varint longer than 10 bytes"));
    }
    Ok(None)
}

/// Append `value` as a varint.
pub fn encode_varint<B: BufMut>(mut value: u64, dst: &mut B) {
    while value >= 0x80 {
        dst.put_u8((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Number of bytes `value` occupies as a varint.
pub fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

// =============================================================================
// HEADER READER
// =============================================================================

/// Routing fields found at the front of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RoutingHeader {
    pub to: Option<NodeId>,
    pub from: Option<NodeId>,
    pub id: Option<u32>,
}

/// Cursor over a complete frame that reads only the leading routing fields.
///
/// The frame itself is never modified; `rewind` returns the cursor to the
/// start so the same buffer can be fully decoded afterwards.
#[derive(Debug)]
pub struct WireHeaderReader<'a> {
    frame: &'a [u8],
    cursor: usize,
}

impl<'a> WireHeaderReader<'a> {
    pub fn new(frame: &'a [u8]) -> Self {
        Self { frame, cursor: 0 }
    }

    /// Read `to` if it is the first field. Any other first byte, or an empty
    /// frame, leaves the cursor at the start and yields `None`.
    pub fn read_to(&mut self) -> Result<Option<NodeId>, NetError> {
        self.cursor = 0;
        self.read_tagged(TAG_TO)
    }

    /// Read `from` if it is the next field after the cursor.
    pub fn read_from(&mut self) -> Result<Option<NodeId>, NetError> {
        self.read_tagged(TAG_FROM)
    }

    /// Read the correlation `id` if it is the next field after the cursor.
    /// The id is a uint32, so unlike the identifiers it may use all 32 bits.
    pub fn read_id(&mut self) -> Result<Option<u32>, NetError> {
        if self.frame.get(self.cursor) != Some(&TAG_ID) {
            return Ok(None);
        }

        let start = self.cursor + 1;
        match decode_varint64(&self.frame[start..])? {
            Some((value, len)) => {
                self.cursor = start + len;
                Ok(Some(value as u32))
            }
            None => Err(NetError::corrupted("truncated header field")),
        }
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    fn read_tagged(&mut self, tag: u8) -> Result<Option<NodeId>, NetError> {
        if self.frame.get(self.cursor) != Some(&tag) {
            return Ok(None);
        }

        let start = self.cursor + 1;
        match decode_varint32(&self.frame[start..], "identifier")? {
            Some((value, len)) => {
                self.cursor = start + len;
                Ok(Some(value))
            }
            None => Err(NetError::corrupted("truncated header field")),
        }
    }
}

/// Peek the routing header of `frame` (`to`, then `from`, then `id`, each only
/// if present in that order at the front of the frame).
pub fn peek_routing_header(frame: &[u8]) -> Result<RoutingHeader, NetError> {
    let mut reader = WireHeaderReader::new(frame);
    let mut header = RoutingHeader::default();

    header.to = reader.read_to()?;
    if header.to.is_some() {
        header.from = reader.read_from()?;
    }
    header.id = reader.read_id()?;

    reader.rewind();
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn varint(value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        encode_varint(value, &mut out);
        out
    }

    #[test]
    fn test_single_byte_varint() {
        assert_eq!(decode_varint32(&[0x05], "x").unwrap(), Some((5, 1)));
        assert_eq!(decode_varint32(&[0x7f, 0xff], "x").unwrap(), Some((127, 1)));
    }

    #[test]
    fn test_five_byte_max_identifier() {
        let bytes = [0xff, 0xff, 0xff, 0xff, 0x07];
        assert_eq!(decode_varint32(&bytes, "x").unwrap(), Some((i32::MAX as u32, 5)));
    }

    #[test]
    fn test_fifth_byte_sign_bit_rejected() {
        let bytes = [0x80, 0x80, 0x80, 0x80, 0x08];
        assert!(matches!(decode_varint32(&bytes, "x"), Err(NetError::CorruptedFrame(_))));
    }

    #[test]
    fn test_ten_byte_negative_rejected() {
        // -1 as a protobuf int32
        let bytes = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x01];
        assert!(matches!(decode_varint32(&bytes, "x"), Err(NetError::CorruptedFrame(_))));
    }

    #[test]
    fn test_incomplete_varint() {
        assert_eq!(decode_varint32(&[0x80, 0x80], "x").unwrap(), None);
        assert_eq!(decode_varint32(&[], "x").unwrap(), None);
    }

    #[test]
    fn test_varint64_overflow() {
        let bytes = [0xff; 11];
        assert!(decode_varint64(&bytes).is_err());
        assert_eq!(decode_varint64(&varint(u64::MAX)).unwrap(), Some((u64::MAX, 10)));
    }

    #[test]
    fn test_varint_len() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(127), 1);
        assert_eq!(varint_len(128), 2);
        assert_eq!(varint_len(u64::MAX), 10);
    }

    #[test]
    fn test_empty_frame_has_no_destination() {
        let header = peek_routing_header(&[]).unwrap();
        assert_eq!(header, RoutingHeader::default());
    }

    #[test]
    fn test_from_first_is_not_routed() {
        // from=5 with no `to` in front
        let header = peek_routing_header(&[TAG_FROM, 0x05]).unwrap();
        assert_eq!(header.to, None);
        assert_eq!(header.from, None);
    }

    #[test]
    fn test_to_without_from() {
        let mut reader = WireHeaderReader::new(&[TAG_TO, 0x02, TAG_ID, 0x01]);
        assert_eq!(reader.read_to().unwrap(), Some(2));
        assert_eq!(reader.read_from().unwrap(), None);
        assert_eq!(reader.position(), 2);
        reader.rewind();
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_full_routing_header() {
        let mut frame = vec![TAG_TO];
        frame.extend(varint(2000));
        frame.push(TAG_FROM);
        frame.extend(varint(1234));
        frame.push(TAG_ID);
        frame.extend(varint(9));
        frame.extend([0x20, 0x05]);

        let header = peek_routing_header(&frame).unwrap();
        assert_eq!(header.to, Some(2000));
        assert_eq!(header.from, Some(1234));
        assert_eq!(header.id, Some(9));
    }

    #[test]
    fn test_full_width_correlation_id() {
        let mut frame = vec![TAG_TO, 0x01, TAG_FROM, 0x02, TAG_ID];
        frame.extend(varint(u32::MAX as u64));

        let header = peek_routing_header(&frame).unwrap();
        assert_eq!(header.id, Some(u32::MAX));
    }

    #[test]
    fn test_truncated_to_is_corrupted() {
        assert!(matches!(
            peek_routing_header(&[TAG_TO, 0x80]),
            Err(NetError::CorruptedFrame(_))
        ));
    }

    proptest! {
        #[test]
        fn prop_negative_to_always_corrupted(
            to in i32::MIN..0i32,
            tail in proptest::collection::vec(any::<u8>(), 0..32),
        ) {
            let mut frame = vec![TAG_TO];
            // protobuf sign-extends negative int32 to 64 bits
            frame.extend(varint(to as i64 as u64));
            frame.extend(tail);
            let mut reader = WireHeaderReader::new(&frame);
            prop_assert!(matches!(reader.read_to(), Err(NetError::CorruptedFrame(_))));
        }

        #[test]
        fn prop_non_negative_to_and_from_decode(to in 0..=i32::MAX, from in 0..=i32::MAX) {
            let mut frame = vec![TAG_TO];
            frame.extend(varint(to as u64));
            frame.push(TAG_FROM);
            frame.extend(varint(from as u64));

            let header = peek_routing_header(&frame).unwrap();
            prop_assert_eq!(header.to, Some(to as u32));
            prop_assert_eq!(header.from, Some(from as u32));
        }
    }
}
