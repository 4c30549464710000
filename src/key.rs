//! Cell keys
//!
//!  Every record in a store is addressed by an ordered binary key. The layout
//!  is a stable contract shared with the dump/repair tooling:
//!
//! ```text
//! byte 0       accumulator kind (0 current, 1 day, 2 month, 3 year)
//! bytes 1..5   bucket, big endian
//! bytes 5..9   station id, big endian (0 = global)
//! byte 9       0x00 metadata row, 0x01 cell row
//! bytes 10..18 cell id, big endian (cell rows only)
//! ```
//!
//! Lexicographic byte order therefore sorts by kind, bucket, station and
//! cell id, with the metadata row of a group ahead of all of its cells.

use std::fmt;
use std::str::FromStr;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Numeric station identifier. Zero addresses the global store.
pub type StationId = u32;

pub const GLOBAL_STATION: StationId = 0;

const PREFIX_LEN: usize = 9;
const META_KEY_LEN: usize = PREFIX_LEN + 1;
const CELL_KEY_LEN: usize = META_KEY_LEN + 8;

const MARKER_META: u8 = 0x00;
const MARKER_CELL: u8 = 0x01;

/// Hexagonal grid cell index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellId(pub u64);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for CellId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        u64::from_str_radix(s.trim(), 16).map(CellId)
    }
}

// Cell ids travel as hex strings, u64 does not survive JSON number handling
impl Serialize for CellId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CellId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Retention granularity of an accumulator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccumulatorKind {
    Current = 0,
    Day = 1,
    Month = 2,
    Year = 3,
}

impl AccumulatorKind {
    pub const ALL: [AccumulatorKind; 4] = [
        AccumulatorKind::Current,
        AccumulatorKind::Day,
        AccumulatorKind::Month,
        AccumulatorKind::Year,
    ];

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(AccumulatorKind::Current),
            1 => Some(AccumulatorKind::Day),
            2 => Some(AccumulatorKind::Month),
            3 => Some(AccumulatorKind::Year),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AccumulatorKind::Current => "current",
            AccumulatorKind::Day => "day",
            AccumulatorKind::Month => "month",
            AccumulatorKind::Year => "year",
        }
    }
}

impl fmt::Display for AccumulatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of one record: a cell row, or the metadata row of a group
/// when `cell` is `None`.
///
/// The derived ordering matches the byte ordering of [`CellKey::db_key`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellKey {
    pub kind: AccumulatorKind,
    pub bucket: u32,
    pub station: StationId,
    pub cell: Option<CellId>,
}

impl CellKey {
    pub fn new(station: StationId, kind: AccumulatorKind, bucket: u32, cell: CellId) -> Self {
        Self {
            kind,
            bucket,
            station,
            cell: Some(cell),
        }
    }

    pub fn meta(station: StationId, kind: AccumulatorKind, bucket: u32) -> Self {
        Self {
            kind,
            bucket,
            station,
            cell: None,
        }
    }

    /// Parse raw key bytes
    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() != META_KEY_LEN && raw.len() != CELL_KEY_LEN {
            return Err(Error::invalid_key(format!("unexpected length {}", raw.len())));
        }

        let mut buf = raw;
        let kind_byte = buf.get_u8();
        let kind = AccumulatorKind::from_byte(kind_byte)
            .ok_or_else(|| Error::invalid_key(format!("unknown accumulator kind {kind_byte}")))?;
        let bucket = buf.get_u32();
        let station = buf.get_u32();

        let cell = match (buf.get_u8(), raw.len()) {
            (MARKER_META, META_KEY_LEN) => None,
            (MARKER_CELL, CELL_KEY_LEN) => Some(CellId(buf.get_u64())),
            (marker, len) => {
                return Err(Error::invalid_key(format!(
                    "marker {marker:#04x} does not match key length {len}"
                )));
            }
        };

        Ok(Self {
            kind,
            bucket,
            station,
            cell,
        })
    }

    pub fn is_meta(&self) -> bool {
        self.cell.is_none()
    }

    pub fn db_key(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(CELL_KEY_LEN);
        put_prefix(&mut buf, self.kind, self.bucket, self.station);
        match self.cell {
            None => buf.put_u8(MARKER_META),
            Some(cell) => {
                buf.put_u8(MARKER_CELL);
                buf.put_u64(cell.0);
            }
        }
        buf.freeze()
    }

    /// Identifies the (kind, bucket, station) group for mutual exclusion.
    /// Every cell of a group shares the same lock key.
    pub fn lock_key(&self) -> Bytes {
        group_prefix(self.kind, self.bucket, self.station)
    }
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cell {
            Some(cell) => write!(f, "{}/{}/{}/{}", self.kind, self.bucket, self.station, cell),
            None => write!(f, "{}/{}/{}/meta", self.kind, self.bucket, self.station),
        }
    }
}

fn put_prefix(buf: &mut BytesMut, kind: AccumulatorKind, bucket: u32, station: StationId) {
    buf.put_u8(kind.as_byte());
    buf.put_u32(bucket);
    buf.put_u32(station);
}

fn group_prefix(kind: AccumulatorKind, bucket: u32, station: StationId) -> Bytes {
    let mut buf = BytesMut::with_capacity(PREFIX_LEN);
    put_prefix(&mut buf, kind, bucket, station);
    buf.freeze()
}

/// First key of the (kind, bucket) group across all stations
pub fn accumulator_begin(kind: AccumulatorKind, bucket: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(5);
    buf.put_u8(kind.as_byte());
    buf.put_u32(bucket);
    buf.freeze()
}

/// Exclusive upper bound of the (kind, bucket) group. Seeking here skips the
/// whole bucket without visiting its cells.
pub fn accumulator_end(kind: AccumulatorKind, bucket: u32) -> Bytes {
    match bucket.checked_add(1) {
        Some(next) => accumulator_begin(kind, next),
        None => Bytes::copy_from_slice(&[kind.as_byte() + 1]),
    }
}

/// Half-open key range, `gte <= key < lt`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRange {
    pub gte: Bytes,
    pub lt: Bytes,
}

pub fn search_range(kind: AccumulatorKind, bucket: u32) -> SearchRange {
    SearchRange {
        gte: accumulator_begin(kind, bucket),
        lt: accumulator_end(kind, bucket),
    }
}

/// Range covering only the cell rows of one (kind, bucket, station) group
pub fn cell_range(kind: AccumulatorKind, bucket: u32, station: StationId) -> SearchRange {
    let prefix = group_prefix(kind, bucket, station);
    let mut gte = BytesMut::with_capacity(META_KEY_LEN);
    gte.extend_from_slice(&prefix);
    gte.put_u8(MARKER_CELL);
    let mut lt = BytesMut::with_capacity(META_KEY_LEN);
    lt.extend_from_slice(&prefix);
    lt.put_u8(MARKER_CELL + 1);
    SearchRange {
        gte: gte.freeze(),
        lt: lt.freeze(),
    }
}

/// Cell rows of one group that sort strictly after `cell`
pub fn cell_range_after(
    kind: AccumulatorKind,
    bucket: u32,
    station: StationId,
    cell: CellId,
) -> SearchRange {
    let range = cell_range(kind, bucket, station);
    let gte = match cell.0.checked_add(1) {
        Some(next) => CellKey::new(station, kind, bucket, CellId(next)).db_key(),
        None => range.lt.clone(),
    };
    SearchRange { gte, lt: range.lt }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_key_roundtrip() {
        let key = CellKey::new(42, AccumulatorKind::Day, 2026290, CellId(0x87283472bffffff));
        let parsed = CellKey::parse(&key.db_key()).unwrap();
        assert_eq!(parsed, key);
        assert!(!parsed.is_meta());

        let meta = CellKey::meta(42, AccumulatorKind::Day, 2026290);
        let parsed = CellKey::parse(&meta.db_key()).unwrap();
        assert_eq!(parsed, meta);
        assert!(parsed.is_meta());
    }

    #[test]
    fn test_cell_key_layout_is_stable() {
        let key = CellKey::new(0x01020304, AccumulatorKind::Month, 202610, CellId(0xAB));
        assert_eq!(
            key.db_key().as_ref(),
            &[
                0x02, 0x00, 0x03, 0x17, 0x72, 0x01, 0x02, 0x03, 0x04, 0x01, 0, 0, 0, 0, 0, 0, 0,
                0xAB
            ]
        );
        let meta = CellKey::meta(0x01020304, AccumulatorKind::Month, 202610);
        assert_eq!(meta.db_key().len(), 10);
        assert_eq!(meta.db_key()[9], 0x00);
    }

    #[test]
    fn test_parse_rejects_bad_keys() {
        assert!(CellKey::parse(&[]).is_err());
        assert!(CellKey::parse(&[9, 0, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
        // cell marker on a metadata-length key
        assert!(CellKey::parse(&[1, 0, 0, 0, 1, 0, 0, 0, 0, 1]).is_err());
        let mut long = CellKey::new(1, AccumulatorKind::Day, 1, CellId(1)).db_key().to_vec();
        long[9] = MARKER_META;
        assert!(CellKey::parse(&long).is_err());
    }

    #[test]
    fn test_cells_sort_by_id() {
        let ids = [0u64, 1, 0xff, 0x100, 0x8000_0000_0000_0000, u64::MAX];
        for pair in ids.windows(2) {
            let a = CellKey::new(7, AccumulatorKind::Current, 10, CellId(pair[0]));
            let b = CellKey::new(7, AccumulatorKind::Current, 10, CellId(pair[1]));
            assert!(a.db_key() < b.db_key());
            assert!(a < b);
        }
    }

    #[test]
    fn test_meta_sorts_first_in_group() {
        let meta = CellKey::meta(7, AccumulatorKind::Year, 2026);
        let first = CellKey::new(7, AccumulatorKind::Year, 2026, CellId(0));
        assert!(meta.db_key() < first.db_key());
        assert!(meta < first);
    }

    #[test]
    fn test_buckets_sort_increasing() {
        let a = CellKey::new(3, AccumulatorKind::Day, 2026001, CellId(u64::MAX));
        let b = CellKey::meta(3, AccumulatorKind::Day, 2026002);
        assert!(a.db_key() < b.db_key());
    }

    #[test]
    fn test_accumulator_range_bounds_group() {
        let kind = AccumulatorKind::Day;
        let begin = accumulator_begin(kind, 100);
        let end = accumulator_end(kind, 100);

        for station in [0u32, 1, u32::MAX] {
            let meta = CellKey::meta(station, kind, 100).db_key();
            let last = CellKey::new(station, kind, 100, CellId(u64::MAX)).db_key();
            assert!(begin <= meta);
            assert!(last < end);
        }

        let next = CellKey::meta(0, kind, 101).db_key();
        assert!(end <= next);
        let next_kind = CellKey::meta(0, AccumulatorKind::Month, 0).db_key();
        assert!(end < next_kind);
    }

    #[test]
    fn test_accumulator_end_at_max_bucket() {
        let end = accumulator_end(AccumulatorKind::Current, u32::MAX);
        let last = CellKey::new(u32::MAX, AccumulatorKind::Current, u32::MAX, CellId(u64::MAX));
        assert!(last.db_key() < end);
        assert!(end <= CellKey::meta(0, AccumulatorKind::Day, 0).db_key());
    }

    #[test]
    fn test_search_range_matches_accumulator_bounds() {
        let range = search_range(AccumulatorKind::Month, 202610);
        assert_eq!(range.gte, accumulator_begin(AccumulatorKind::Month, 202610));
        assert_eq!(range.lt, accumulator_end(AccumulatorKind::Month, 202610));
    }

    #[test]
    fn test_cell_range_excludes_meta() {
        let range = cell_range(AccumulatorKind::Day, 5, 9);
        let meta = CellKey::meta(9, AccumulatorKind::Day, 5).db_key();
        let cell = CellKey::new(9, AccumulatorKind::Day, 5, CellId(0)).db_key();
        let other = CellKey::meta(10, AccumulatorKind::Day, 5).db_key();
        assert!(meta < range.gte);
        assert!(range.gte <= cell && cell < range.lt);
        assert!(range.lt <= other);

        let after = cell_range_after(AccumulatorKind::Day, 5, 9, CellId(10));
        let at = CellKey::new(9, AccumulatorKind::Day, 5, CellId(10)).db_key();
        let past = CellKey::new(9, AccumulatorKind::Day, 5, CellId(11)).db_key();
        assert!(at < after.gte);
        assert_eq!(after.gte, past);
    }

    #[test]
    fn test_lock_key_is_per_group() {
        let a = CellKey::new(1, AccumulatorKind::Current, 5, CellId(1));
        let b = CellKey::new(1, AccumulatorKind::Current, 5, CellId(2));
        let c = CellKey::new(2, AccumulatorKind::Current, 5, CellId(1));
        assert_eq!(a.lock_key(), b.lock_key());
        assert_eq!(a.lock_key(), CellKey::meta(1, AccumulatorKind::Current, 5).lock_key());
        assert_ne!(a.lock_key(), c.lock_key());
    }

    #[test]
    fn test_cell_id_hex() {
        let cell: CellId = "87283472bffffff".parse().unwrap();
        assert_eq!(cell, CellId(0x87283472bffffff));
        assert_eq!(cell.to_string(), "87283472bffffff");
        let json = serde_json::to_string(&cell).unwrap();
        assert_eq!(json, "\"87283472bffffff\"");
    }
}
