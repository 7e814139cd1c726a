//! Variable-length Integer Encoding (Varint)
//!
//! Datapoint blocks and log message bodies store lengths and timestamp deltas
//! as varints:
//! - Small numbers (0-127) use just 1 byte
//! - Larger numbers use 2-10 bytes depending on magnitude
//! - Each byte uses 7 bits for data and 1 bit as a "continuation" flag
//!
//! Signed values are ZigZag mapped first (0 → 0, -1 → 1, 1 → 2, ...), so the
//! small negative deltas that show up in out-of-order blocks stay short.
//!
//! Decoding is fallible: input comes off the log and may be truncated or
//! corrupt, which must surface as a decode error rather than a panic.

use bytes::{Buf, BufMut};

use crate::error::{CoreError, Result};

/// Encode a signed integer as a varint (ZigZag encoding)
pub fn encode_varint(buf: &mut impl BufMut, value: i64) {
    let unsigned = ((value << 1) ^ (value >> 63)) as u64;

    encode_varint_u64(buf, unsigned);
}

/// Encode an unsigned integer as a varint
pub fn encode_varint_u64(buf: &mut impl BufMut, mut value: u64) {
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

/// Decode a varint to a signed integer
pub fn decode_varint(buf: &mut impl Buf) -> Result<i64> {
    let unsigned = decode_varint_u64(buf)?;

    let value = (unsigned >> 1) as i64;
    if (unsigned & 1) != 0 {
        Ok(!value)
    } else {
        Ok(value)
    }
}

/// Decode a varint to an unsigned integer
pub fn decode_varint_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0;

    loop {
        if !buf.has_remaining() {
            return Err(CoreError::MalformedBlock("truncated varint".to_string()));
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            break;
        }

        shift += 7;

        if shift >= 64 {
            return Err(CoreError::MalformedBlock("varint too large".to_string()));
        }
    }

    Ok(value)
}

/// Decode a varint length and check it against the bytes left in `buf`.
pub fn decode_len(buf: &mut impl Buf) -> Result<usize> {
    let len = decode_varint_u64(buf)? as usize;
    if len > buf.remaining() {
        return Err(CoreError::MalformedBlock(format!(
            "length {} exceeds remaining {} bytes",
            len,
            buf.remaining()
        )));
    }
    Ok(len)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn test_varint_small_negative() {
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, -5);

        let mut cursor = buf.as_ref();
        assert_eq!(decode_varint(&mut cursor).unwrap(), -5);
    }

    #[test]
    fn test_varint_i64_extremes() {
        for val in [i64::MIN, i64::MIN + 1, i64::MAX, i64::MAX - 1] {
            let mut buf = BytesMut::new();
            encode_varint(&mut buf, val);
            let mut cursor = buf.as_ref();
            assert_eq!(decode_varint(&mut cursor).unwrap(), val);
        }
    }

    #[test]
    fn test_varint_compression() {
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, 63);
        assert_eq!(buf.len(), 1);

        let mut buf = BytesMut::new();
        encode_varint(&mut buf, 64);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn test_varint_u64_max_uses_ten_bytes() {
        let mut buf = BytesMut::new();
        encode_varint_u64(&mut buf, u64::MAX);
        assert_eq!(buf.len(), 10);
        let mut cursor = buf.as_ref();
        assert_eq!(decode_varint_u64(&mut cursor).unwrap(), u64::MAX);
    }

    #[test]
    fn test_truncated_varint_is_an_error() {
        // Continuation bit set but nothing follows
        let data = [0x80u8];
        let mut cursor = &data[..];
        assert!(matches!(
            decode_varint_u64(&mut cursor),
            Err(CoreError::MalformedBlock(_))
        ));
    }

    #[test]
    fn test_overlong_varint_is_an_error() {
        let data = [0xFFu8; 11];
        let mut cursor = &data[..];
        assert!(decode_varint_u64(&mut cursor).is_err());
    }

    #[test]
    fn test_decode_len_rejects_oversized_length() {
        let mut buf = BytesMut::new();
        encode_varint_u64(&mut buf, 10);
        buf.extend_from_slice(b"abc");
        let mut cursor = buf.as_ref();
        assert!(decode_len(&mut cursor).is_err());
    }
}
