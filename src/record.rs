//! Aggregate coverage records
//!
//!  One record holds the statistics for a single grid cell inside one
//!  accumulator bucket. Station stores hold the plain variant; the global
//!  store additionally tracks which stations contributed and roughly how much.

use std::collections::HashSet;
use std::fmt::Write as _;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::key::{CellId, GLOBAL_STATION, StationId};

/// Signal strength is summed at reduced resolution to keep sums in a u32
pub const SIGNAL_QUANT: u8 = 4;

/// Maximum number of contributing stations tracked per global record
pub const MAX_STATION_SLOTS: usize = 30;

const TAG_STATION_V1: u8 = 0x01;
const TAG_GLOBAL_V1: u8 = 0x02;

const STATS_LEN: usize = 22;
const STATION_RECORD_LEN: usize = 1 + STATS_LEN;
const GLOBAL_HEADER_LEN: usize = STATION_RECORD_LEN + 1;
const SLOT_LEN: usize = 5;

/// A single accepted observation, already resolved to a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Altitude in metres
    pub altitude: i32,
    /// Height above ground in metres
    pub agl: i32,
    /// Number of checksum errors corrected in the packet
    pub crc_errors: u32,
    /// Signal strength
    pub signal: u32,
    /// Seconds since the previous packet from the same tracker
    pub gap: u32,
    /// Station that heard the packet
    pub station: StationId,
}

/// Which store a record belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    Station,
    Global,
}

impl Variant {
    /// Variant of the records kept in `owner`'s store
    pub fn for_owner(owner: StationId) -> Self {
        if owner == GLOBAL_STATION {
            Variant::Global
        } else {
            Variant::Station
        }
    }
}

/// Scalar statistics shared by both record variants
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CellStats {
    pub count: u32,
    pub min_alt: u16,
    pub min_alt_agl: u16,
    /// Strongest signal seen at `min_alt`
    pub min_alt_max_signal: u8,
    pub max_signal: u8,
    /// Sum of `signal / SIGNAL_QUANT`
    pub sum_signal: u32,
    pub sum_crc: u32,
    pub sum_gap: u32,
}

impl CellStats {
    fn update(&mut self, obs: &Observation) {
        let altitude = clamp_u16(obs.altitude);
        let agl = clamp_u16(obs.agl);
        let signal = obs.signal.min(u8::MAX as u32) as u8;

        self.count = self.count.saturating_add(1);
        self.sum_signal = self
            .sum_signal
            .saturating_add((signal / SIGNAL_QUANT) as u32);
        self.sum_crc = self.sum_crc.saturating_add(obs.crc_errors);
        self.sum_gap = self.sum_gap.saturating_add(obs.gap);

        if self.count == 1 || altitude < self.min_alt {
            self.min_alt = altitude;
            self.min_alt_max_signal = signal;
        } else if altitude == self.min_alt && signal > self.min_alt_max_signal {
            self.min_alt_max_signal = signal;
        }

        if self.count == 1 || agl < self.min_alt_agl {
            self.min_alt_agl = agl;
        }

        self.max_signal = self.max_signal.max(signal);
    }

    fn merge(&self, other: &CellStats) -> CellStats {
        if other.count == 0 {
            return *self;
        }
        if self.count == 0 {
            return *other;
        }

        let min_alt_max_signal = match self.min_alt.cmp(&other.min_alt) {
            std::cmp::Ordering::Less => self.min_alt_max_signal,
            std::cmp::Ordering::Greater => other.min_alt_max_signal,
            std::cmp::Ordering::Equal => self.min_alt_max_signal.max(other.min_alt_max_signal),
        };

        CellStats {
            count: self.count.saturating_add(other.count),
            min_alt: self.min_alt.min(other.min_alt),
            min_alt_agl: self.min_alt_agl.min(other.min_alt_agl),
            min_alt_max_signal,
            max_signal: self.max_signal.max(other.max_signal),
            sum_signal: self.sum_signal.saturating_add(other.sum_signal),
            sum_crc: self.sum_crc.saturating_add(other.sum_crc),
            sum_gap: self.sum_gap.saturating_add(other.sum_gap),
        }
    }

    /// Take `removed` observations out of the count and scale the sums down
    /// in proportion. Minimum and maximum fields cannot be un-merged.
    fn remove(&mut self, removed: u32) {
        let old = self.count;
        if old == 0 || removed == 0 {
            return;
        }
        let removed = removed.min(old);
        let scale = |sum: u32| -> u32 {
            let taken = (sum as u64 * removed as u64) / old as u64;
            sum - taken as u32
        };
        self.sum_signal = scale(self.sum_signal);
        self.sum_crc = scale(self.sum_crc);
        self.sum_gap = scale(self.sum_gap);
        self.count = old - removed;
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.count);
        buf.put_u16_le(self.min_alt);
        buf.put_u16_le(self.min_alt_agl);
        buf.put_u8(self.min_alt_max_signal);
        buf.put_u8(self.max_signal);
        buf.put_u32_le(self.sum_signal);
        buf.put_u32_le(self.sum_crc);
        buf.put_u32_le(self.sum_gap);
    }

    fn decode(buf: &mut &[u8]) -> CellStats {
        CellStats {
            count: buf.get_u32_le(),
            min_alt: buf.get_u16_le(),
            min_alt_agl: buf.get_u16_le(),
            min_alt_max_signal: buf.get_u8(),
            max_signal: buf.get_u8(),
            sum_signal: buf.get_u32_le(),
            sum_crc: buf.get_u32_le(),
            sum_gap: buf.get_u32_le(),
        }
    }
}

/// A station's coarse share of a global record's count
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StationShare {
    pub station: StationId,
    /// 0..=10, tenths of the record's count
    pub decile: u8,
}

/// Result of dropping invalid stations from a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    Unchanged,
    Updated,
    Emptied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregateRecord {
    Station(CellStats),
    Global {
        stats: CellStats,
        /// Oldest contributor first
        stations: Vec<StationShare>,
    },
}

impl AggregateRecord {
    pub fn new(variant: Variant) -> Self {
        match variant {
            Variant::Station => AggregateRecord::Station(CellStats::default()),
            Variant::Global => AggregateRecord::Global {
                stats: CellStats::default(),
                stations: Vec::new(),
            },
        }
    }

    pub fn variant(&self) -> Variant {
        match self {
            AggregateRecord::Station(_) => Variant::Station,
            AggregateRecord::Global { .. } => Variant::Global,
        }
    }

    pub fn stats(&self) -> &CellStats {
        match self {
            AggregateRecord::Station(stats) => stats,
            AggregateRecord::Global { stats, .. } => stats,
        }
    }

    pub fn count(&self) -> u32 {
        self.stats().count
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn stations(&self) -> &[StationShare] {
        match self {
            AggregateRecord::Station(_) => &[],
            AggregateRecord::Global { stations, .. } => stations,
        }
    }

    /// Merge one observation into the record
    pub fn update(&mut self, obs: &Observation) {
        match self {
            AggregateRecord::Station(stats) => stats.update(obs),
            AggregateRecord::Global { stats, stations } => {
                let old_count = stats.count;
                stats.update(obs);

                let mut estimates = estimates_of(stations, old_count);
                match estimates.iter_mut().find(|(id, _)| *id == obs.station) {
                    Some((_, estimate)) => *estimate += 1,
                    None => {
                        if estimates.len() >= MAX_STATION_SLOTS {
                            estimates.remove(0);
                        }
                        estimates.push((obs.station, 1));
                    }
                }
                *stations = shares_from(&estimates, stats.count);
            }
        }
    }

    /// Combine `self` with `other`, the same cell in a different time window.
    ///
    /// Counts and sums add, minimums and maximums combine. For global records
    /// the station tables are unioned with `self`'s stations kept ahead of
    /// `other`'s; when the union exceeds [`MAX_STATION_SLOTS`] the oldest
    /// entries are dropped, which makes the global merge order-dependent.
    /// A station record merged with a global one stays a station record.
    pub fn merge_into(&self, other: &AggregateRecord) -> AggregateRecord {
        if other.is_empty() {
            return self.clone();
        }
        if self.is_empty() && self.variant() == other.variant() {
            return other.clone();
        }

        let stats = self.stats().merge(other.stats());
        match self {
            AggregateRecord::Station(_) => AggregateRecord::Station(stats),
            AggregateRecord::Global { stats: ours, stations } => {
                let mut estimates = estimates_of(stations, ours.count);
                for (id, estimate) in estimates_of(other.stations(), other.count()) {
                    match estimates.iter_mut().find(|(existing, _)| *existing == id) {
                        Some((_, total)) => *total += estimate,
                        None => estimates.push((id, estimate)),
                    }
                }
                if estimates.len() > MAX_STATION_SLOTS {
                    let excess = estimates.len() - MAX_STATION_SLOTS;
                    estimates.drain(..excess);
                }
                AggregateRecord::Global {
                    stations: shares_from(&estimates, stats.count),
                    stats,
                }
            }
        }
    }

    /// Remove a station's estimated contribution from a global record.
    ///
    /// Returns true when the record is left empty and its key should be
    /// deleted. Station records have no per-station breakdown and are left
    /// untouched.
    pub fn remove_station(&mut self, station: StationId) -> bool {
        let AggregateRecord::Global { stats, stations } = self else {
            return self.is_empty();
        };
        let Some(pos) = stations.iter().position(|s| s.station == station) else {
            return stats.count == 0;
        };

        let old_count = stats.count;
        let share = stations.remove(pos);
        let removed = if stations.is_empty() {
            old_count
        } else {
            let estimate = estimate_of(share.decile, old_count);
            estimate.min(old_count.saturating_sub(1) as u64) as u32
        };

        let estimates = estimates_of(stations, old_count);
        stats.remove(removed);
        if stats.count == 0 {
            *stats = CellStats::default();
            stations.clear();
            return true;
        }
        *stations = shares_from(&estimates, stats.count);
        false
    }

    /// Drop every tracked station that is not in `valid`
    pub fn remove_invalid_stations(&mut self, valid: &HashSet<StationId>) -> RemovalOutcome {
        let invalid: Vec<StationId> = self
            .stations()
            .iter()
            .map(|s| s.station)
            .filter(|id| !valid.contains(id))
            .collect();

        if invalid.is_empty() {
            return RemovalOutcome::Unchanged;
        }
        for station in invalid {
            if self.remove_station(station) {
                return RemovalOutcome::Emptied;
            }
        }
        RemovalOutcome::Updated
    }

    pub fn serialize(&self) -> Vec<u8> {
        let stations = self.stations();
        let mut buf = BytesMut::with_capacity(GLOBAL_HEADER_LEN + stations.len() * SLOT_LEN);
        match self {
            AggregateRecord::Station(stats) => {
                buf.put_u8(TAG_STATION_V1);
                stats.encode(&mut buf);
            }
            AggregateRecord::Global { stats, stations } => {
                buf.put_u8(TAG_GLOBAL_V1);
                stats.encode(&mut buf);
                buf.put_u8(stations.len() as u8);
                for share in stations {
                    buf.put_u32_le(share.station);
                    buf.put_u8(share.decile);
                }
            }
        }
        buf.to_vec()
    }

    pub fn deserialize(raw: &[u8]) -> Result<Self> {
        let Some(&tag) = raw.first() else {
            return Err(Error::corrupt("empty value"));
        };

        match tag {
            TAG_STATION_V1 => {
                if raw.len() != STATION_RECORD_LEN {
                    return Err(Error::corrupt(format!(
                        "station record of {} bytes, expected {STATION_RECORD_LEN}",
                        raw.len()
                    )));
                }
                let mut buf = &raw[1..];
                Ok(AggregateRecord::Station(CellStats::decode(&mut buf)))
            }
            TAG_GLOBAL_V1 => {
                if raw.len() < GLOBAL_HEADER_LEN {
                    return Err(Error::corrupt(format!(
                        "global record of {} bytes is shorter than its header",
                        raw.len()
                    )));
                }
                let mut buf = &raw[1..];
                let stats = CellStats::decode(&mut buf);
                let slots = buf.get_u8() as usize;
                if slots > MAX_STATION_SLOTS {
                    return Err(Error::corrupt(format!("{slots} station slots")));
                }
                if buf.remaining() != slots * SLOT_LEN {
                    return Err(Error::corrupt(format!(
                        "{} bytes left for {slots} station slots",
                        buf.remaining()
                    )));
                }
                let mut stations = Vec::with_capacity(slots);
                for _ in 0..slots {
                    let station = buf.get_u32_le();
                    let decile = buf.get_u8();
                    if decile > 10 {
                        return Err(Error::corrupt(format!(
                            "decile {decile} for station {station}"
                        )));
                    }
                    stations.push(StationShare { station, decile });
                }
                Ok(AggregateRecord::Global { stats, stations })
            }
            other => Err(Error::corrupt(format!("unknown record tag {other:#04x}"))),
        }
    }

    pub fn to_row(&self, cell: CellId) -> CellRow {
        let stats = self.stats();
        let stations = match self {
            AggregateRecord::Station(_) => None,
            AggregateRecord::Global { stations, .. } => Some(encode_shares(stations)),
        };
        CellRow {
            cell,
            count: stats.count,
            min_alt: stats.min_alt,
            min_alt_agl: stats.min_alt_agl,
            min_alt_max_signal: stats.min_alt_max_signal,
            max_signal: stats.max_signal,
            sum_signal: stats.sum_signal,
            sum_crc: stats.sum_crc,
            sum_gap: stats.sum_gap,
            num_stations: self.stations().len() as u8,
            stations,
        }
    }

    pub fn from_row(row: &CellRow) -> Result<Self> {
        let stats = CellStats {
            count: row.count,
            min_alt: row.min_alt,
            min_alt_agl: row.min_alt_agl,
            min_alt_max_signal: row.min_alt_max_signal,
            max_signal: row.max_signal,
            sum_signal: row.sum_signal,
            sum_crc: row.sum_crc,
            sum_gap: row.sum_gap,
        };
        match &row.stations {
            None => Ok(AggregateRecord::Station(stats)),
            Some(encoded) => {
                let stations = decode_shares(encoded)?;
                if stations.len() != row.num_stations as usize {
                    return Err(Error::corrupt(format!(
                        "row for {} lists {} stations but claims {}",
                        row.cell,
                        stations.len(),
                        row.num_stations
                    )));
                }
                Ok(AggregateRecord::Global { stats, stations })
            }
        }
    }
}

/// Flat representation of a record used at the export/repair boundary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRow {
    pub cell: CellId,
    pub count: u32,
    pub min_alt: u16,
    pub min_alt_agl: u16,
    pub min_alt_max_signal: u8,
    pub max_signal: u8,
    pub sum_signal: u32,
    pub sum_crc: u32,
    pub sum_gap: u32,
    pub num_stations: u8,
    /// `station:decile` pairs joined by commas, absent for station records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stations: Option<String>,
}

fn clamp_u16(v: i32) -> u16 {
    v.clamp(0, u16::MAX as i32) as u16
}

fn estimate_of(decile: u8, count: u32) -> u64 {
    (decile as u64 * count as u64 + 5) / 10
}

fn estimates_of(stations: &[StationShare], count: u32) -> Vec<(StationId, u64)> {
    stations
        .iter()
        .map(|s| (s.station, estimate_of(s.decile, count)))
        .collect()
}

fn shares_from(estimates: &[(StationId, u64)], count: u32) -> Vec<StationShare> {
    estimates
        .iter()
        .map(|&(station, estimate)| {
            let decile = if count == 0 {
                0
            } else {
                ((estimate * 10 + count as u64 / 2) / count as u64).min(10) as u8
            };
            StationShare { station, decile }
        })
        .collect()
}

fn encode_shares(stations: &[StationShare]) -> String {
    let mut out = String::new();
    for (i, share) in stations.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        let _ = write!(out, "{}:{}", share.station, share.decile);
    }
    out
}

fn decode_shares(encoded: &str) -> Result<Vec<StationShare>> {
    if encoded.trim().is_empty() {
        return Ok(Vec::new());
    }
    encoded
        .split(',')
        .map(|part| {
            let (station, decile) = part
                .split_once(':')
                .ok_or_else(|| Error::corrupt(format!("station share '{part}'")))?;
            let station = station
                .trim()
                .parse()
                .map_err(|_| Error::corrupt(format!("station id '{station}'")))?;
            let decile: u8 = decile
                .trim()
                .parse()
                .map_err(|_| Error::corrupt(format!("decile '{decile}'")))?;
            if decile > 10 {
                return Err(Error::corrupt(format!("decile {decile}")));
            }
            Ok(StationShare { station, decile })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(altitude: i32, agl: i32, signal: u32, station: StationId) -> Observation {
        Observation {
            altitude,
            agl,
            crc_errors: 0,
            signal,
            gap: 1,
            station,
        }
    }

    fn global_from(stations: &[StationId]) -> AggregateRecord {
        let mut record = AggregateRecord::new(Variant::Global);
        for &station in stations {
            record.update(&obs(1000, 500, 40, station));
        }
        record
    }

    #[test]
    fn test_new_record_is_empty() {
        let record = AggregateRecord::new(Variant::Station);
        assert_eq!(record.count(), 0);
        assert!(record.is_empty());
        assert_eq!(record.variant(), Variant::Station);
        assert!(AggregateRecord::new(Variant::Global).stations().is_empty());
    }

    #[test]
    fn test_repeated_update() {
        let mut record = AggregateRecord::new(Variant::Station);
        record.update(&obs(100, 100, 10, 1));
        record.update(&obs(100, 100, 10, 1));
        let stats = record.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.max_signal, 10);
        assert_eq!(stats.min_alt, 100);
        assert_eq!(stats.min_alt_max_signal, 10);
        assert_eq!(stats.sum_signal, 2 * (10 / SIGNAL_QUANT as u32));
        assert_eq!(stats.sum_gap, 2);
    }

    #[test]
    fn test_update_tracks_running_extremes() {
        let sequence = [
            (500, 300, 20),
            (700, 100, 90),
            (400, 350, 15),
            (400, 320, 30),
            (900, 50, 5),
            (400, 400, 25),
        ];
        let mut record = AggregateRecord::new(Variant::Station);
        for (i, &(alt, agl, sig)) in sequence.iter().enumerate() {
            record.update(&obs(alt, agl, sig, 1));
            let seen = &sequence[..=i];
            let stats = record.stats();
            assert_eq!(stats.count as usize, i + 1);
            assert_eq!(stats.min_alt as i32, seen.iter().map(|s| s.0).min().unwrap());
            assert_eq!(stats.min_alt_agl as i32, seen.iter().map(|s| s.1).min().unwrap());
            assert_eq!(stats.max_signal as u32, seen.iter().map(|s| s.2).max().unwrap());
        }
        // strongest signal among the observations at 400m
        assert_eq!(record.stats().min_alt_max_signal, 30);
    }

    #[test]
    fn test_lower_altitude_resets_signal_at_minimum() {
        let mut record = AggregateRecord::new(Variant::Station);
        record.update(&obs(500, 100, 90, 1));
        record.update(&obs(300, 100, 10, 1));
        assert_eq!(record.stats().min_alt, 300);
        assert_eq!(record.stats().min_alt_max_signal, 10);
        assert_eq!(record.stats().max_signal, 90);
    }

    #[test]
    fn test_agl_tracked_independently() {
        let mut record = AggregateRecord::new(Variant::Station);
        record.update(&obs(500, 400, 10, 1));
        record.update(&obs(800, 100, 10, 1));
        assert_eq!(record.stats().min_alt, 500);
        assert_eq!(record.stats().min_alt_agl, 100);
    }

    #[test]
    fn test_update_clamps_inputs() {
        let mut record = AggregateRecord::new(Variant::Station);
        record.update(&obs(-20, -5, 1000, 1));
        record.update(&obs(100_000, 100_000, 300, 1));
        let stats = record.stats();
        assert_eq!(stats.min_alt, 0);
        assert_eq!(stats.min_alt_agl, 0);
        assert_eq!(stats.max_signal, u8::MAX);
        assert_eq!(stats.sum_signal, 2 * (u8::MAX / SIGNAL_QUANT) as u32);
    }

    #[test]
    fn test_global_update_tracks_shares() {
        let record = global_from(&[1, 1, 1, 2]);
        assert_eq!(record.count(), 4);
        let stations = record.stations();
        assert_eq!(stations.len(), 2);
        assert_eq!(stations[0], StationShare { station: 1, decile: 8 });
        assert_eq!(stations[1], StationShare { station: 2, decile: 3 });
    }

    #[test]
    fn test_global_update_single_station_stays_full() {
        let record = global_from(&[5; 17]);
        assert_eq!(record.stations(), &[StationShare { station: 5, decile: 10 }]);
    }

    #[test]
    fn test_global_update_evicts_oldest_station() {
        let ids: Vec<StationId> = (1..=MAX_STATION_SLOTS as u32 + 1).collect();
        let record = global_from(&ids);
        let stations = record.stations();
        assert_eq!(stations.len(), MAX_STATION_SLOTS);
        assert!(stations.iter().all(|s| s.station != 1));
        assert_eq!(stations[0].station, 2);
        assert_eq!(stations.last().unwrap().station, MAX_STATION_SLOTS as u32 + 1);
    }

    #[test]
    fn test_merge_empty_is_identity() {
        let mut record = AggregateRecord::new(Variant::Station);
        record.update(&obs(100, 50, 10, 1));
        record.update(&obs(200, 20, 30, 1));
        let empty = AggregateRecord::new(Variant::Station);
        assert_eq!(record.merge_into(&empty), record);
        assert_eq!(empty.merge_into(&record), record);

        let global = global_from(&[1, 2, 2]);
        assert_eq!(global.merge_into(&AggregateRecord::new(Variant::Global)), global);
        assert_eq!(AggregateRecord::new(Variant::Global).merge_into(&global), global);
    }

    #[test]
    fn test_merge_with_self_doubles_sums() {
        let mut record = AggregateRecord::new(Variant::Station);
        record.update(&obs(100, 50, 10, 1));
        record.update(&obs(80, 60, 40, 1));
        let merged = record.merge_into(&record);
        let (a, m) = (record.stats(), merged.stats());
        assert_eq!(m.count, a.count * 2);
        assert_eq!(m.sum_signal, a.sum_signal * 2);
        assert_eq!(m.sum_gap, a.sum_gap * 2);
        assert_eq!(m.min_alt, a.min_alt);
        assert_eq!(m.min_alt_agl, a.min_alt_agl);
        assert_eq!(m.max_signal, a.max_signal);
        assert_eq!(m.min_alt_max_signal, a.min_alt_max_signal);
    }

    #[test]
    fn test_merge_combines_fields() {
        let mut a = AggregateRecord::new(Variant::Station);
        a.update(&obs(100, 90, 10, 1));
        let mut b = AggregateRecord::new(Variant::Station);
        b.update(&obs(100, 40, 30, 1));
        b.update(&obs(300, 10, 80, 1));

        let merged = a.merge_into(&b);
        let stats = merged.stats();
        assert_eq!(stats.count, 3);
        assert_eq!(stats.min_alt, 100);
        assert_eq!(stats.min_alt_agl, 10);
        assert_eq!(stats.min_alt_max_signal, 30);
        assert_eq!(stats.max_signal, 80);
        assert_eq!(merged, b.merge_into(&a));
    }

    #[test]
    fn test_global_merge_reweights_shares() {
        let current = global_from(&[1, 1]);
        let day = global_from(&[2, 2, 2, 2, 2, 2, 2, 2]);
        let merged = day.merge_into(&current);
        assert_eq!(merged.count(), 10);
        assert_eq!(
            merged.stations(),
            &[
                StationShare { station: 2, decile: 8 },
                StationShare { station: 1, decile: 2 }
            ]
        );
    }

    #[test]
    fn test_global_merge_order_matters_on_overflow() {
        let first: Vec<StationId> = (1..=20).collect();
        let second: Vec<StationId> = (101..=120).collect();
        let a = global_from(&first);
        let b = global_from(&second);

        let ab = a.merge_into(&b);
        let ba = b.merge_into(&a);
        assert_eq!(ab.stats(), ba.stats());
        assert_eq!(ab.stations().len(), MAX_STATION_SLOTS);
        assert_ne!(ab.stations(), ba.stations());
        // the oldest entries of the leading side are the ones dropped
        assert_eq!(ab.stations()[0].station, 11);
        assert_eq!(ba.stations()[0].station, 111);
    }

    #[test]
    fn test_remove_only_station_empties() {
        let mut record = global_from(&[1, 1, 1]);
        assert!(record.remove_station(1));
        assert_eq!(record.count(), 0);
        assert!(record.stations().is_empty());
    }

    #[test]
    fn test_remove_one_of_two_stations() {
        let mut record = global_from(&[1, 2]);
        let sum_gap = record.stats().sum_gap;
        assert!(!record.remove_station(1));
        assert_eq!(record.count(), 1);
        assert_eq!(record.stats().sum_gap, sum_gap / 2);
        assert_eq!(record.stations(), &[StationShare { station: 2, decile: 10 }]);
    }

    #[test]
    fn test_remove_unknown_station_is_noop() {
        let mut record = global_from(&[1, 2]);
        let before = record.clone();
        assert!(!record.remove_station(99));
        assert_eq!(record, before);

        let mut station = AggregateRecord::new(Variant::Station);
        station.update(&obs(1, 1, 1, 1));
        assert!(!station.remove_station(1));
        assert_eq!(station.count(), 1);
    }

    #[test]
    fn test_remove_invalid_stations_outcomes() {
        let valid: HashSet<StationId> = [2, 3].into_iter().collect();

        let mut untouched = global_from(&[2, 3]);
        assert_eq!(untouched.remove_invalid_stations(&valid), RemovalOutcome::Unchanged);

        let mut mixed = global_from(&[1, 2, 2, 2]);
        assert_eq!(mixed.remove_invalid_stations(&valid), RemovalOutcome::Updated);
        assert_eq!(mixed.count(), 3);
        assert_eq!(mixed.stations().len(), 1);

        let mut gone = global_from(&[1, 4, 1]);
        assert_eq!(gone.remove_invalid_stations(&valid), RemovalOutcome::Emptied);
        assert!(gone.is_empty());
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut station = AggregateRecord::new(Variant::Station);
        station.update(&obs(1234, 567, 89, 1));
        station.update(&obs(1000, 700, 200, 1));
        let global = global_from(&[7, 8, 8, 9, 70000]);

        for record in [
            station,
            global,
            AggregateRecord::new(Variant::Station),
            AggregateRecord::new(Variant::Global),
        ] {
            let bytes = record.serialize();
            assert_eq!(AggregateRecord::deserialize(&bytes).unwrap(), record);
        }
    }

    #[test]
    fn test_deserialize_rejects_corrupt() {
        let mut station = AggregateRecord::new(Variant::Station);
        station.update(&obs(1, 1, 1, 1));
        let bytes = station.serialize();
        assert!(AggregateRecord::deserialize(&[]).is_err());
        assert!(AggregateRecord::deserialize(&bytes[..bytes.len() - 1]).is_err());

        let mut extra = bytes.clone();
        extra.push(0);
        assert!(AggregateRecord::deserialize(&extra).is_err());

        let mut bad_tag = bytes.clone();
        bad_tag[0] = 0x7f;
        assert!(matches!(
            AggregateRecord::deserialize(&bad_tag),
            Err(Error::CorruptRecord { .. })
        ));

        let global = global_from(&[1, 2]).serialize();
        assert!(AggregateRecord::deserialize(&global[..global.len() - 2]).is_err());
        let mut too_many = global.clone();
        too_many[STATION_RECORD_LEN] = 3;
        assert!(AggregateRecord::deserialize(&too_many).is_err());
    }

    #[test]
    fn test_row_roundtrip() {
        let global = global_from(&[3, 3, 4]);
        let row = global.to_row(CellId(0x8928308280fffff));
        assert_eq!(row.num_stations, 2);
        assert_eq!(row.stations.as_deref(), Some("3:7,4:3"));
        assert_eq!(AggregateRecord::from_row(&row).unwrap(), global);

        let mut station = AggregateRecord::new(Variant::Station);
        station.update(&obs(10, 5, 60, 3));
        let row = station.to_row(CellId(1));
        assert!(row.stations.is_none());
        assert_eq!(AggregateRecord::from_row(&row).unwrap(), station);

        let json = serde_json::to_string(&row).unwrap();
        let back: CellRow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_from_row_rejects_bad_station_list() {
        let mut row = global_from(&[1]).to_row(CellId(5));
        row.stations = Some("1:11".to_string());
        assert!(AggregateRecord::from_row(&row).is_err());
        row.stations = Some("1-10".to_string());
        assert!(AggregateRecord::from_row(&row).is_err());
        row.stations = Some("1:10,2:0".to_string());
        assert!(AggregateRecord::from_row(&row).is_err());
    }
}
