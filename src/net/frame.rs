//! Length-delimited framing: `<varint32 length><payload>`

use super::error::NetError;
use super::header::{decode_varint32, encode_varint, varint_len};
use super::types::{MAX_FRAME_SIZE, MAX_VARINT32_BYTES};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Splits a byte stream into opaque frames and prefixes outgoing frames with
/// their length.
///
/// The decoder is restartable: a partial prefix or body leaves the buffer
/// untouched until more bytes arrive.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn check_len(&self, len: usize) -> Result<(), NetError> {
        if len > self.max_frame_size {
            return Err(NetError::corrupted(format!(
                "frame of {} bytes exceeds limit of {}",
                len, self.max_frame_size
            )));
        }
        Ok(())
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = NetError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, NetError> {
        let (len, prefix) = match decode_varint32(src, "frame length")? {
            Some(v) => v,
            None => return Ok(None),
        };
        let len = len as usize;

        // Reject before reserving anything for the body
        self.check_len(len)?;

        let total = prefix + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(prefix);
        Ok(Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, NetError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(NetError::corrupted(format!(
                "stream ended mid-frame ({} bytes buffered)",
                src.len()
            ))),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = NetError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<(), NetError> {
        self.check_len(frame.len())?;

        dst.reserve(varint_len(frame.len() as u64) + frame.len());
        encode_varint(frame.len() as u64, dst);
        dst.put_slice(&frame);
        Ok(())
    }
}

/// Prefix a single frame with its length.
pub fn encode_frame(frame: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(MAX_VARINT32_BYTES + frame.len());
    encode_varint(frame.len() as u64, &mut out);
    out.put_slice(frame);
    out.freeze()
}
