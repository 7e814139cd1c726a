//! Log Message Wire Format
//!
//! Every record on the ingest log carries exactly one [`LogMessage`] once the
//! crypto envelope has been removed.
//!
//! ## Format
//!
//! ```text
//! ┌─────────┬──────┬──────────┬───────────┬──────────┐
//! │ version │ kind │ class_id │ labels_id │   body   │
//! │   u8    │  u8  │   u64    │    u64    │ variable │
//! └─────────┴──────┴──────────┴───────────┴──────────┘
//!
//! Store / Archive body:  len (varint) | data
//! Delete body:           start i64 | end i64 | min_age_ms i64 | has_metadata u8
//!                        [ name string | label count varint | (key string, value string)* ]
//! string:                len (varint) | utf8
//! ```
//!
//! All fixed-width integers are big-endian. Trailing bytes after the body are
//! rejected so a corrupted length cannot silently swallow the next field.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CoreError, Result};
use crate::varint::{decode_len, decode_varint_u64, encode_varint_u64};

/// Current wire version.
pub const MESSAGE_VERSION: u8 = 1;

const KIND_STORE: u8 = 1;
const KIND_DELETE: u8 = 2;
const KIND_ARCHIVE: u8 = 3;

const HEADER_SIZE: usize = 1 + 1 + 8 + 8;

/// Datapoints to persist for one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreMessage {
    pub class_id: u64,
    pub labels_id: u64,
    /// Opaque datapoint block, decoded with a `DatapointCodec`.
    pub data: Bytes,
}

/// Series name and labels attached to a delete, for accounting only.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SeriesMetadata {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

/// Range delete for one series.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteMessage {
    pub class_id: u64,
    pub labels_id: u64,
    /// Inclusive lower bound; `i64::MIN` means unbounded
    pub start: i64,
    /// Inclusive upper bound; `i64::MAX` means unbounded
    pub end: i64,
    /// Only delete versions older than this many milliseconds (0 = no constraint)
    pub min_age_ms: i64,
    pub metadata: Option<SeriesMetadata>,
}

impl DeleteMessage {
    /// True when the delete covers the whole time axis of the series.
    pub fn is_unbounded(&self) -> bool {
        self.start == i64::MIN && self.end == i64::MAX
    }
}

/// Archived datapoints. Recognized on the wire but not handled by the ingest path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveMessage {
    pub class_id: u64,
    pub labels_id: u64,
    pub data: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogMessage {
    Store(StoreMessage),
    Delete(DeleteMessage),
    Archive(ArchiveMessage),
}

impl LogMessage {
    pub fn kind_name(&self) -> &'static str {
        match self {
            LogMessage::Store(_) => "store",
            LogMessage::Delete(_) => "delete",
            LogMessage::Archive(_) => "archive",
        }
    }

    pub fn series(&self) -> (u64, u64) {
        match self {
            LogMessage::Store(m) => (m.class_id, m.labels_id),
            LogMessage::Delete(m) => (m.class_id, m.labels_id),
            LogMessage::Archive(m) => (m.class_id, m.labels_id),
        }
    }

    /// Serialize to the wire format.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + 32);
        buf.put_u8(MESSAGE_VERSION);

        match self {
            LogMessage::Store(m) => {
                buf.put_u8(KIND_STORE);
                buf.put_u64(m.class_id);
                buf.put_u64(m.labels_id);
                put_bytes(&mut buf, &m.data);
            }
            LogMessage::Delete(m) => {
                buf.put_u8(KIND_DELETE);
                buf.put_u64(m.class_id);
                buf.put_u64(m.labels_id);
                buf.put_i64(m.start);
                buf.put_i64(m.end);
                buf.put_i64(m.min_age_ms);
                match &m.metadata {
                    Some(meta) => {
                        buf.put_u8(1);
                        put_bytes(&mut buf, meta.name.as_bytes());
                        encode_varint_u64(&mut buf, meta.labels.len() as u64);
                        for (k, v) in &meta.labels {
                            put_bytes(&mut buf, k.as_bytes());
                            put_bytes(&mut buf, v.as_bytes());
                        }
                    }
                    None => buf.put_u8(0),
                }
            }
            LogMessage::Archive(m) => {
                buf.put_u8(KIND_ARCHIVE);
                buf.put_u64(m.class_id);
                buf.put_u64(m.labels_id);
                put_bytes(&mut buf, &m.data);
            }
        }

        buf.freeze()
    }

    /// Deserialize from the wire format.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(CoreError::MalformedMessage(format!(
                "message too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = data;
        let version = cursor.get_u8();
        if version != MESSAGE_VERSION {
            return Err(CoreError::UnsupportedVersion(version));
        }
        let kind = cursor.get_u8();
        let class_id = cursor.get_u64();
        let labels_id = cursor.get_u64();

        let message = match kind {
            KIND_STORE => LogMessage::Store(StoreMessage {
                class_id,
                labels_id,
                data: get_bytes(&mut cursor)?,
            }),
            KIND_ARCHIVE => LogMessage::Archive(ArchiveMessage {
                class_id,
                labels_id,
                data: get_bytes(&mut cursor)?,
            }),
            KIND_DELETE => {
                if cursor.remaining() < 8 * 3 + 1 {
                    return Err(CoreError::MalformedMessage(
                        "truncated delete body".to_string(),
                    ));
                }
                let start = cursor.get_i64();
                let end = cursor.get_i64();
                let min_age_ms = cursor.get_i64();
                let metadata = match cursor.get_u8() {
                    0 => None,
                    1 => {
                        let name = get_string(&mut cursor)?;
                        let count = decode_varint_u64(&mut cursor).map_err(to_message_error)?;
                        let mut labels = BTreeMap::new();
                        for _ in 0..count {
                            let key = get_string(&mut cursor)?;
                            let value = get_string(&mut cursor)?;
                            labels.insert(key, value);
                        }
                        Some(SeriesMetadata { name, labels })
                    }
                    other => {
                        return Err(CoreError::MalformedMessage(format!(
                            "invalid metadata flag {}",
                            other
                        )))
                    }
                };
                LogMessage::Delete(DeleteMessage {
                    class_id,
                    labels_id,
                    start,
                    end,
                    min_age_ms,
                    metadata,
                })
            }
            other => {
                return Err(CoreError::MalformedMessage(format!(
                    "unknown message kind {}",
                    other
                )))
            }
        };

        if cursor.has_remaining() {
            return Err(CoreError::MalformedMessage(format!(
                "{} trailing bytes",
                cursor.remaining()
            )));
        }

        Ok(message)
    }
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    encode_varint_u64(buf, data.len() as u64);
    buf.put_slice(data);
}

fn get_bytes(cursor: &mut &[u8]) -> Result<Bytes> {
    let len = decode_len(cursor).map_err(to_message_error)?;
    let bytes = Bytes::copy_from_slice(&cursor[..len]);
    cursor.advance(len);
    Ok(bytes)
}

fn get_string(cursor: &mut &[u8]) -> Result<String> {
    let len = decode_len(cursor).map_err(to_message_error)?;
    let s = std::str::from_utf8(&cursor[..len])
        .map_err(|e| CoreError::MalformedMessage(format!("invalid utf8: {}", e)))?
        .to_string();
    cursor.advance(len);
    Ok(s)
}

// Varint helpers report block errors; on this path they are message errors.
fn to_message_error(e: CoreError) -> CoreError {
    match e {
        CoreError::MalformedBlock(msg) => CoreError::MalformedMessage(msg),
        other => other,
    }
}
