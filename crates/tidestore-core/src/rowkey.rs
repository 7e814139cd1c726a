//! Row Key Codec
//!
//! Maps `(class_id, labels_id, timestamp)` to the store's row key (and an
//! optional column qualifier) so that rows of one series are contiguous and
//! sorted newest first.
//!
//! ## Layout
//!
//! ```text
//! ┌────────┬──────────┬───────────┬─────────────────┐
//! │ prefix │ class_id │ labels_id │ reversed bucket │
//! │  1 B   │   8 B    │    8 B    │       8 B       │
//! └────────┴──────────┴───────────┴─────────────────┘
//! reversed bucket = i64::MAX - (ts - ts % modulus), big-endian
//! ```
//!
//! With a modulus above 1, several timestamps share a row and the qualifier
//! `i64::MAX - ts` (8 bytes, big-endian) tells them apart.
//!
//! `i64::MAX - ts` is computed with wrapping arithmetic and compared as an
//! unsigned big-endian value. Over the whole `i64` range that value strictly
//! decreases as `ts` grows, so negative timestamps sort correctly too.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{CoreError, Result};

/// Prefix of raw datapoint rows.
pub const RAW_PREFIX: u8 = b'R';
/// Prefix of archived datapoint rows.
pub const ARCHIVE_PREFIX: u8 = b'A';

/// prefix + class_id + labels_id
pub const SERIES_PREFIX_LEN: usize = 1 + 8 + 8;
/// series prefix + reversed bucket
pub const ROW_KEY_LEN: usize = SERIES_PREFIX_LEN + 8;

/// Encoded row key and optional column qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RowKey {
    pub key: Bytes,
    pub qualifier: Option<Bytes>,
}

/// Half-open key range `[start_key, stop_key)` for a series scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanRange {
    pub start_key: Bytes,
    pub stop_key: Bytes,
}

impl ScanRange {
    pub fn contains(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_ref() && key < self.stop_key.as_ref()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RowKeyCodec {
    modulus: i64,
    prefix: u8,
}

impl RowKeyCodec {
    /// Codec for raw rows. `modulus` must be at least 1.
    pub fn new(modulus: i64) -> Result<Self> {
        if modulus < 1 {
            return Err(CoreError::InvalidModulus(modulus));
        }
        Ok(Self {
            modulus,
            prefix: RAW_PREFIX,
        })
    }

    /// Codec for archived rows.
    pub fn archived(modulus: i64) -> Result<Self> {
        Ok(Self {
            prefix: ARCHIVE_PREFIX,
            ..Self::new(modulus)?
        })
    }

    pub fn modulus(&self) -> i64 {
        self.modulus
    }

    pub fn encode(&self, class_id: u64, labels_id: u64, timestamp: i64) -> RowKey {
        let bucket = timestamp - timestamp % self.modulus;

        let mut key = BytesMut::with_capacity(ROW_KEY_LEN);
        self.put_prefix(&mut key, class_id, labels_id);
        key.put_i64(reverse(bucket));

        let qualifier = if self.modulus > 1 {
            Some(Bytes::copy_from_slice(&reverse(timestamp).to_be_bytes()))
        } else {
            None
        };

        RowKey {
            key: key.freeze(),
            qualifier,
        }
    }

    /// The 17-byte prefix shared by every row of a series.
    pub fn series_prefix(&self, class_id: u64, labels_id: u64) -> Bytes {
        let mut buf = BytesMut::with_capacity(SERIES_PREFIX_LEN);
        self.put_prefix(&mut buf, class_id, labels_id);
        buf.freeze()
    }

    /// Key range covering every row of a series with a timestamp in `[start, end]`.
    ///
    /// The stop key carries one extra trailing byte so the row of `start`
    /// itself falls inside the half-open range.
    pub fn scan_range(&self, class_id: u64, labels_id: u64, start: i64, end: i64) -> ScanRange {
        let mut start_key = BytesMut::with_capacity(ROW_KEY_LEN);
        let mut stop_key = BytesMut::with_capacity(ROW_KEY_LEN + 1);
        self.put_prefix(&mut start_key, class_id, labels_id);
        self.put_prefix(&mut stop_key, class_id, labels_id);

        if start == i64::MIN && end == i64::MAX {
            start_key.put_bytes(0x00, 8);
            stop_key.put_bytes(0xFF, 8);
        } else {
            start_key.put_i64(reverse(end));
            stop_key.put_i64(reverse(start));
        }
        stop_key.put_u8(0x00);

        ScanRange {
            start_key: start_key.freeze(),
            stop_key: stop_key.freeze(),
        }
    }

    fn put_prefix(&self, buf: &mut BytesMut, class_id: u64, labels_id: u64) {
        buf.put_u8(self.prefix);
        buf.put_u64(class_id);
        buf.put_u64(labels_id);
    }
}

fn reverse(ts: i64) -> i64 {
    i64::MAX.wrapping_sub(ts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_rejects_modulus_below_one() {
        assert!(matches!(
            RowKeyCodec::new(0),
            Err(CoreError::InvalidModulus(0))
        ));
        assert!(RowKeyCodec::new(-3).is_err());
    }

    #[test]
    fn test_layout() {
        let codec = RowKeyCodec::new(1).unwrap();
        let row = codec.encode(0xAA, 0xBB, 1_000);

        assert_eq!(row.key.len(), ROW_KEY_LEN);
        assert_eq!(row.key[0], RAW_PREFIX);
        assert_eq!(&row.key[1..9], &0xAAu64.to_be_bytes());
        assert_eq!(&row.key[9..17], &0xBBu64.to_be_bytes());
        assert_eq!(&row.key[17..], &(i64::MAX - 1_000).to_be_bytes());
        assert!(row.qualifier.is_none());
    }

    #[test]
    fn test_archived_prefix() {
        let codec = RowKeyCodec::archived(1).unwrap();
        assert_eq!(codec.encode(1, 2, 3).key[0], ARCHIVE_PREFIX);
    }

    #[test]
    fn test_newest_sorts_first() {
        // Datapoints at t=100, 200, 300 scan back as 300, 200, 100
        let codec = RowKeyCodec::new(1).unwrap();
        let mut keys: Vec<(Bytes, i64)> = [100, 200, 300]
            .iter()
            .map(|&ts| (codec.encode(5, 6, ts).key, ts))
            .collect();
        keys.sort();

        let order: Vec<i64> = keys.into_iter().map(|(_, ts)| ts).collect();
        assert_eq!(order, vec![300, 200, 100]);
    }

    #[test]
    fn test_order_holds_across_sign() {
        let codec = RowKeyCodec::new(1).unwrap();
        let timestamps = [i64::MIN, -1_000, -1, 0, 1, 1_000, i64::MAX];
        for pair in timestamps.windows(2) {
            let older = codec.encode(1, 1, pair[0]).key;
            let newer = codec.encode(1, 1, pair[1]).key;
            assert!(newer < older, "{} should sort before {}", pair[1], pair[0]);
        }
    }

    #[test]
    fn test_distinct_timestamps_give_distinct_keys() {
        for modulus in [1, 10, 3_600] {
            let codec = RowKeyCodec::new(modulus).unwrap();
            let mut seen = HashSet::new();
            for ts in -50..50 {
                assert!(seen.insert(codec.encode(3, 4, ts * 7)));
            }
        }
    }

    #[test]
    fn test_modulus_buckets_share_row() {
        let codec = RowKeyCodec::new(10).unwrap();
        let a = codec.encode(1, 1, 21);
        let b = codec.encode(1, 1, 29);
        let c = codec.encode(1, 1, 30);

        assert_eq!(a.key, b.key);
        assert_ne!(a.key, c.key);
        assert_ne!(a.qualifier, b.qualifier);
        assert_eq!(
            a.qualifier.unwrap().as_ref(),
            &(i64::MAX - 21).to_be_bytes()
        );
    }

    #[test]
    fn test_bounded_scan_range() {
        let codec = RowKeyCodec::new(1).unwrap();
        let range = codec.scan_range(1, 2, 100, 200);

        assert_eq!(range.start_key, codec.encode(1, 2, 200).key);
        assert_eq!(range.stop_key.len(), ROW_KEY_LEN + 1);
        assert_eq!(&range.stop_key[..ROW_KEY_LEN], codec.encode(1, 2, 100).key.as_ref());
        assert_eq!(range.stop_key[ROW_KEY_LEN], 0x00);

        for ts in [100, 150, 200] {
            assert!(range.contains(&codec.encode(1, 2, ts).key));
        }
        assert!(!range.contains(&codec.encode(1, 2, 99).key));
        assert!(!range.contains(&codec.encode(1, 2, 201).key));
        assert!(!range.contains(&codec.encode(1, 3, 150).key));
    }

    #[test]
    fn test_unbounded_scan_range() {
        let codec = RowKeyCodec::new(1).unwrap();
        let range = codec.scan_range(9, 8, i64::MIN, i64::MAX);
        let prefix = codec.series_prefix(9, 8);

        assert_eq!(&range.start_key[..SERIES_PREFIX_LEN], prefix.as_ref());
        assert!(range.start_key[SERIES_PREFIX_LEN..].iter().all(|&b| b == 0));

        assert_eq!(&range.stop_key[..SERIES_PREFIX_LEN], prefix.as_ref());
        assert!(range.stop_key[SERIES_PREFIX_LEN..ROW_KEY_LEN]
            .iter()
            .all(|&b| b == 0xFF));
        assert_eq!(range.stop_key[ROW_KEY_LEN], 0x00);

        for ts in [i64::MIN, -1, 0, i64::MAX] {
            assert!(range.contains(&codec.encode(9, 8, ts).key));
        }
    }
}
