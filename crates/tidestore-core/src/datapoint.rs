//! Datapoints and Datapoint Blocks
//!
//! A datapoint is one reading of a series: timestamp, optional location,
//! optional elevation and a typed value. Producers pack many datapoints of a
//! single series into an opaque block that travels inside a `Store` log
//! message.
//!
//! The pipeline only depends on the [`DatapointCodec`] trait. [`VarintBlockCodec`]
//! is the default implementation:
//!
//! ```text
//! per datapoint:
//!   ts_delta   varint (ZigZag, relative to the previous timestamp, first is absolute)
//!   flags      u8     bit0 = location, bit1 = elevation, bits 4..8 = value type
//!   location   u64    (if bit0)
//!   elevation  varint (if bit1)
//!   value      type dependent (varint / f64 / nothing / len-prefixed bytes)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CoreError, Result};
use crate::varint::{decode_len, decode_varint, encode_varint, encode_varint_u64};

const FLAG_LOCATION: u8 = 0x01;
const FLAG_ELEVATION: u8 = 0x02;

const TYPE_LONG: u8 = 1;
const TYPE_DOUBLE: u8 = 2;
const TYPE_FALSE: u8 = 3;
const TYPE_TRUE: u8 = 4;
const TYPE_TEXT: u8 = 5;
const TYPE_BINARY: u8 = 6;

/// Typed value carried by a datapoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Long(i64),
    Double(f64),
    Boolean(bool),
    Text(String),
    Binary(Bytes),
}

/// A single reading belonging to one series.
#[derive(Debug, Clone, PartialEq)]
pub struct Datapoint {
    /// Timestamp in platform time units (microseconds by convention)
    pub timestamp: i64,
    pub location: Option<u64>,
    pub elevation: Option<i64>,
    pub value: Value,
}

impl Datapoint {
    pub fn new(timestamp: i64, value: Value) -> Self {
        Self {
            timestamp,
            location: None,
            elevation: None,
            value,
        }
    }

    pub fn with_location(mut self, location: u64) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with_elevation(mut self, elevation: i64) -> Self {
        self.elevation = Some(elevation);
        self
    }
}

/// Encoder/decoder for datapoint blocks.
///
/// Implementations must be deterministic: encoding the same datapoints twice
/// yields identical bytes, which keeps replayed writes idempotent.
pub trait DatapointCodec: Send + Sync {
    /// Decode every datapoint of a block, in block order.
    fn decode_block(&self, block: &[u8]) -> Result<Vec<Datapoint>>;

    /// Encode datapoints into a block.
    fn encode_block(&self, points: &[Datapoint]) -> Bytes;
}

/// Default delta/varint block codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct VarintBlockCodec;

impl DatapointCodec for VarintBlockCodec {
    fn decode_block(&self, block: &[u8]) -> Result<Vec<Datapoint>> {
        let mut cursor = block;
        let mut points = Vec::new();
        let mut last_ts: i64 = 0;

        while cursor.has_remaining() {
            let delta = decode_varint(&mut cursor)?;
            let timestamp = last_ts.wrapping_add(delta);
            last_ts = timestamp;

            if !cursor.has_remaining() {
                return Err(CoreError::MalformedBlock("missing flags".to_string()));
            }
            let flags = cursor.get_u8();

            let location = if flags & FLAG_LOCATION != 0 {
                if cursor.remaining() < 8 {
                    return Err(CoreError::MalformedBlock("truncated location".to_string()));
                }
                Some(cursor.get_u64())
            } else {
                None
            };

            let elevation = if flags & FLAG_ELEVATION != 0 {
                Some(decode_varint(&mut cursor)?)
            } else {
                None
            };

            let value = match flags >> 4 {
                TYPE_LONG => Value::Long(decode_varint(&mut cursor)?),
                TYPE_DOUBLE => {
                    if cursor.remaining() < 8 {
                        return Err(CoreError::MalformedBlock("truncated double".to_string()));
                    }
                    Value::Double(cursor.get_f64())
                }
                TYPE_FALSE => Value::Boolean(false),
                TYPE_TRUE => Value::Boolean(true),
                TYPE_TEXT => {
                    let len = decode_len(&mut cursor)?;
                    let text = std::str::from_utf8(&cursor[..len])
                        .map_err(|e| CoreError::MalformedBlock(format!("invalid utf8: {}", e)))?
                        .to_string();
                    cursor.advance(len);
                    Value::Text(text)
                }
                TYPE_BINARY => {
                    let len = decode_len(&mut cursor)?;
                    let bytes = Bytes::copy_from_slice(&cursor[..len]);
                    cursor.advance(len);
                    Value::Binary(bytes)
                }
                other => {
                    return Err(CoreError::MalformedBlock(format!(
                        "unknown value type {}",
                        other
                    )))
                }
            };

            points.push(Datapoint {
                timestamp,
                location,
                elevation,
                value,
            });
        }

        Ok(points)
    }

    fn encode_block(&self, points: &[Datapoint]) -> Bytes {
        let mut buf = BytesMut::new();
        let mut last_ts: i64 = 0;

        for point in points {
            encode_varint(&mut buf, point.timestamp.wrapping_sub(last_ts));
            last_ts = point.timestamp;

            let mut flags = 0u8;
            if point.location.is_some() {
                flags |= FLAG_LOCATION;
            }
            if point.elevation.is_some() {
                flags |= FLAG_ELEVATION;
            }
            let value_type = match &point.value {
                Value::Long(_) => TYPE_LONG,
                Value::Double(_) => TYPE_DOUBLE,
                Value::Boolean(false) => TYPE_FALSE,
                Value::Boolean(true) => TYPE_TRUE,
                Value::Text(_) => TYPE_TEXT,
                Value::Binary(_) => TYPE_BINARY,
            };
            buf.put_u8(flags | (value_type << 4));

            if let Some(location) = point.location {
                buf.put_u64(location);
            }
            if let Some(elevation) = point.elevation {
                encode_varint(&mut buf, elevation);
            }

            match &point.value {
                Value::Long(v) => encode_varint(&mut buf, *v),
                Value::Double(v) => buf.put_f64(*v),
                Value::Boolean(_) => {}
                Value::Text(s) => {
                    encode_varint_u64(&mut buf, s.len() as u64);
                    buf.put_slice(s.as_bytes());
                }
                Value::Binary(b) => {
                    encode_varint_u64(&mut buf, b.len() as u64);
                    buf.put_slice(b);
                }
            }
        }

        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_preserves_order_and_fields() {
        let codec = VarintBlockCodec;
        let points = vec![
            Datapoint::new(300, Value::Long(-7)).with_location(0xDEAD_BEEF),
            Datapoint::new(100, Value::Double(3.5)).with_elevation(-12),
            Datapoint::new(200, Value::Boolean(true)),
            Datapoint::new(400, Value::Text("héllo".to_string())),
            Datapoint::new(401, Value::Binary(Bytes::from_static(b"\x00\x01"))),
        ];

        let block = codec.encode_block(&points);
        let decoded = codec.decode_block(&block).unwrap();
        assert_eq!(decoded, points);
    }

    #[test]
    fn test_empty_block_decodes_to_nothing() {
        assert!(VarintBlockCodec.decode_block(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let points = vec![Datapoint::new(42, Value::Double(1.25))];
        assert_eq!(
            VarintBlockCodec.encode_block(&points),
            VarintBlockCodec.encode_block(&points)
        );
    }

    #[test]
    fn test_truncated_block_is_rejected() {
        let block = VarintBlockCodec.encode_block(&[Datapoint::new(1, Value::Double(2.0))]);
        let truncated = &block[..block.len() - 3];
        assert!(matches!(
            VarintBlockCodec.decode_block(truncated),
            Err(CoreError::MalformedBlock(_))
        ));
    }

    #[test]
    fn test_unknown_value_type_is_rejected() {
        // ts delta 0, flags with value type 15
        let block = [0x00u8, 0xF0];
        assert!(VarintBlockCodec.decode_block(&block).is_err());
    }
}
