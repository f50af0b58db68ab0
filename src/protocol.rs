//! Datagram frame format for UDP traffic carried over the TLS stream.
//!
//! A frame is `varint(len) || payload`. The varint uses the MSB as a
//! continuation flag and the lower 7 bits for data, least significant group
//! first. One frame carries exactly one UDP datagram, so the receiving side
//! can re-emit datagrams with their original boundaries.

use bytes::{BufMut, BytesMut};
use thiserror::Error;

/// Largest payload a frame may carry (the largest possible UDP payload).
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// Maximum varint size in bytes (for u64).
const MAX_VARINT_SIZE: usize = 10;

/// Protocol error types.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("varint overflow")]
    VarintOverflow,

    #[error("frame payload of {0} bytes exceeds the {MAX_FRAME_PAYLOAD} byte limit")]
    FrameTooLarge(u64),
}

/// Result type for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

/// Encode a u64 value as a varint.
pub fn encode_varint(mut value: u64, buf: &mut BytesMut) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if value == 0 {
            break;
        }
    }
}

/// Decode a varint from a buffer, advancing it past the consumed bytes.
///
/// Returns `Ok(None)` if there isn't enough data.
/// Returns `Err(VarintOverflow)` if the varint is too large.
pub fn decode_varint(buf: &mut &[u8]) -> ProtocolResult<Option<u64>> {
    let mut result: u64 = 0;
    let mut shift: u32 = 0;

    for i in 0..MAX_VARINT_SIZE {
        if buf.is_empty() {
            return Ok(None);
        }

        let byte = buf[0];
        *buf = &buf[1..];

        let value = (byte & 0x7F) as u64;

        if shift >= 64 || (shift == 63 && value > 1) {
            return Err(ProtocolError::VarintOverflow);
        }

        result |= value << shift;
        shift += 7;

        if byte & 0x80 == 0 {
            return Ok(Some(result));
        }

        if i == MAX_VARINT_SIZE - 1 {
            return Err(ProtocolError::VarintOverflow);
        }
    }

    Err(ProtocolError::VarintOverflow)
}

/// Calculate the encoded size of a varint.
pub fn varint_size(value: u64) -> usize {
    if value == 0 {
        return 1;
    }
    let bits = 64 - value.leading_zeros();
    bits.div_ceil(7) as usize
}

/// Encode one datagram as a frame.
pub fn encode_frame(payload: &[u8], buf: &mut BytesMut) -> ProtocolResult<()> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(ProtocolError::FrameTooLarge(payload.len() as u64));
    }
    buf.reserve(varint_size(payload.len() as u64) + payload.len());
    encode_varint(payload.len() as u64, buf);
    buf.put_slice(payload);
    Ok(())
}

/// Locate the next complete frame in `buf`.
///
/// Returns `Ok(None)` if there isn't enough data for a complete frame.
/// On success, returns the payload range within `buf` and the total number
/// of bytes the frame occupies.
pub fn decode_frame(buf: &[u8]) -> ProtocolResult<Option<(std::ops::Range<usize>, usize)>> {
    let mut remaining = buf;

    let length = match decode_varint(&mut remaining)? {
        Some(len) => len,
        None => return Ok(None),
    };

    if length > MAX_FRAME_PAYLOAD as u64 {
        return Err(ProtocolError::FrameTooLarge(length));
    }
    let length = length as usize;

    let header_size = buf.len() - remaining.len();
    if remaining.len() < length {
        return Ok(None);
    }

    Ok(Some((header_size..header_size + length, header_size + length)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_encode_decode_zero() {
        let mut buf = BytesMut::new();
        encode_varint(0, &mut buf);
        assert_eq!(&buf[..], &[0x00]);

        let mut slice = &buf[..];
        assert_eq!(decode_varint(&mut slice).unwrap(), Some(0));
        assert!(slice.is_empty());
    }

    #[test]
    fn test_varint_encode_decode_two_bytes() {
        let mut buf = BytesMut::new();
        encode_varint(300, &mut buf);
        assert_eq!(&buf[..], &[0xAC, 0x02]);

        let mut slice = &buf[..];
        assert_eq!(decode_varint(&mut slice).unwrap(), Some(300));
    }

    #[test]
    fn test_varint_incomplete() {
        let mut slice: &[u8] = &[0x80];
        assert_eq!(decode_varint(&mut slice).unwrap(), None);
    }

    #[test]
    fn test_varint_overflow() {
        let mut slice: &[u8] = &[0xFF; 11];
        assert_eq!(
            decode_varint(&mut slice),
            Err(ProtocolError::VarintOverflow)
        );
    }

    #[test]
    fn test_varint_size() {
        assert_eq!(varint_size(0), 1);
        assert_eq!(varint_size(127), 1);
        assert_eq!(varint_size(128), 2);
        assert_eq!(varint_size(65_535), 3);
    }

    #[test]
    fn test_frame_roundtrip() {
        let mut buf = BytesMut::new();
        encode_frame(b"hello", &mut buf).unwrap();
        assert_eq!(buf.len(), 6);

        let (range, consumed) = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(&buf[range], b"hello");
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_empty_datagram_is_a_frame() {
        let mut buf = BytesMut::new();
        encode_frame(b"", &mut buf).unwrap();
        assert_eq!(&buf[..], &[0x00]);

        let (range, consumed) = decode_frame(&buf).unwrap().unwrap();
        assert!(range.is_empty());
        assert_eq!(consumed, 1);
    }

    #[test]
    fn test_decode_incomplete_payload() {
        let mut buf = BytesMut::new();
        encode_frame(b"hello", &mut buf).unwrap();
        assert_eq!(decode_frame(&buf[..4]).unwrap(), None);
        assert_eq!(decode_frame(&[]).unwrap(), None);
    }

    #[test]
    fn test_multiple_frames_in_buffer() {
        let mut buf = BytesMut::new();
        encode_frame(b"one", &mut buf).unwrap();
        encode_frame(b"three", &mut buf).unwrap();

        let (first, consumed) = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(&buf[first], b"one");

        let rest = &buf[consumed..];
        let (second, consumed2) = decode_frame(rest).unwrap().unwrap();
        assert_eq!(&rest[second], b"three");
        assert_eq!(consumed + consumed2, buf.len());
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_FRAME_PAYLOAD + 1];
        let mut buf = BytesMut::new();
        assert_eq!(
            encode_frame(&payload, &mut buf),
            Err(ProtocolError::FrameTooLarge(MAX_FRAME_PAYLOAD as u64 + 1))
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        encode_varint(MAX_FRAME_PAYLOAD as u64 + 1, &mut buf);
        assert!(matches!(
            decode_frame(&buf),
            Err(ProtocolError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_largest_frame_roundtrip() {
        let payload = vec![0x5Au8; MAX_FRAME_PAYLOAD];
        let mut buf = BytesMut::new();
        encode_frame(&payload, &mut buf).unwrap();

        let (range, consumed) = decode_frame(&buf).unwrap().unwrap();
        assert_eq!(range.len(), MAX_FRAME_PAYLOAD);
        assert_eq!(consumed, buf.len());
    }
}
