//! Per-station stores
//!
//!  Each station owns one fjall keyspace with a single `cells` partition; the
//!  global store is the keyspace owned by station 0. Handles are opened on
//!  demand through [`StorePool`], which bounds how many are open at once.
//!  [`BucketLocks`] serialises whole-bucket passes against flushes.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use fjall::{Batch, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::key::{
    AccumulatorKind, CellId, CellKey, GLOBAL_STATION, StationId, accumulator_begin,
    accumulator_end, cell_range, cell_range_after, search_range,
};
use crate::meta::AccumulatorMeta;
use crate::record::{AggregateRecord, CellRow, Variant};

const CELLS_PARTITION: &str = "cells";
const DELETE_CHUNK: usize = 1024;

/// One cell read from a store, not yet decoded
pub struct RawCell {
    pub key: CellKey,
    pub value: Vec<u8>,
}

impl RawCell {
    pub fn cell(&self) -> CellId {
        self.key.cell.unwrap_or(CellId(0))
    }

    pub fn decode(&self) -> Result<AggregateRecord> {
        AggregateRecord::deserialize(&self.value)
    }
}

pub struct StationStore {
    station: StationId,
    path: PathBuf,
    keyspace: Keyspace,
    cells: PartitionHandle,
}

impl StationStore {
    pub fn open(path: &Path, station: StationId) -> Result<Self> {
        let unavailable = |source| Error::StoreUnavailable { station, source };
        std::fs::create_dir_all(path).map_err(|e| unavailable(fjall::Error::from(e)))?;
        let keyspace = fjall::Config::new(path).open().map_err(unavailable)?;
        let cells = keyspace
            .open_partition(CELLS_PARTITION, PartitionCreateOptions::default())
            .map_err(unavailable)?;

        debug!("Opened store for station {} at {}", station, path.display());
        Ok(Self {
            station,
            path: path.to_path_buf(),
            keyspace,
            cells,
        })
    }

    pub fn station(&self) -> StationId {
        self.station
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn variant(&self) -> Variant {
        Variant::for_owner(self.station)
    }

    /// Fetch and decode a single record. Absent keys are `Ok(None)`.
    pub fn get(&self, key: &CellKey) -> Result<Option<AggregateRecord>> {
        match self.cells.get(key.db_key().as_ref())? {
            Some(raw) => AggregateRecord::deserialize(&raw).map(Some),
            None => Ok(None),
        }
    }

    pub fn read_meta(&self, kind: AccumulatorKind, bucket: u32) -> Result<Option<AccumulatorMeta>> {
        let key = CellKey::meta(self.station, kind, bucket);
        match self.cells.get(key.db_key().as_ref())? {
            Some(raw) => AccumulatorMeta::from_json(&raw).map(Some),
            None => Ok(None),
        }
    }

    pub fn batch(&self) -> StoreBatch {
        StoreBatch {
            batch: self.keyspace.batch(),
            cells: self.cells.clone(),
            writes: 0,
        }
    }

    /// Write a group of cache entries for one (kind, bucket) and refresh the
    /// group's metadata row in the same batch.
    pub fn write_group(
        &self,
        kind: AccumulatorKind,
        bucket: u32,
        records: &[(CellKey, AggregateRecord)],
        now: i64,
    ) -> Result<()> {
        let mut meta = match self.read_meta(kind, bucket) {
            Ok(Some(meta)) => meta,
            Ok(None) => AccumulatorMeta::new(kind, bucket, now),
            Err(Error::Json(e)) => {
                warn!(
                    "Replacing unreadable metadata for {}/{} in station {}: {}",
                    kind, bucket, self.station, e
                );
                AccumulatorMeta::new(kind, bucket, now)
            }
            Err(e) => return Err(e),
        };
        meta.touch(now, records.len());

        let mut batch = self.batch();
        for (key, record) in records {
            if record.is_empty() {
                batch.remove(key);
            } else {
                batch.put_record(key, record);
            }
        }
        batch.put_meta(&CellKey::meta(self.station, kind, bucket), &meta)?;
        batch.commit()
    }

    /// Cell rows of one bucket in ascending cell order, optionally starting
    /// after `after`. Store failures end the iteration with an error; keys
    /// that do not parse are yielded as per-cell errors.
    pub fn cells(
        &self,
        kind: AccumulatorKind,
        bucket: u32,
        after: Option<CellId>,
    ) -> impl Iterator<Item = Result<RawCell>> + '_ {
        let range = match after {
            Some(cell) => cell_range_after(kind, bucket, self.station, cell),
            None => cell_range(kind, bucket, self.station),
        };
        self.cells
            .range(range.gte.to_vec()..range.lt.to_vec())
            .map(|item| {
                let (key, value) = item?;
                Ok(RawCell {
                    key: CellKey::parse(&key)?,
                    value: value.to_vec(),
                })
            })
    }

    /// Buckets of `kind` present in the store, ascending. Jumps from group
    /// to group with `accumulator_end` instead of walking every cell.
    pub fn buckets(&self, kind: AccumulatorKind) -> Result<Vec<u32>> {
        let kind_end = vec![kind.as_byte() + 1];
        let mut from = accumulator_begin(kind, 0).to_vec();
        let mut buckets = Vec::new();

        loop {
            let Some(item) = self.cells.range(from.clone()..kind_end.clone()).next() else {
                break;
            };
            let (raw, _) = item?;
            let key = CellKey::parse(&raw)?;
            buckets.push(key.bucket);
            if key.bucket == u32::MAX {
                break;
            }
            from = accumulator_end(kind, key.bucket).to_vec();
        }
        Ok(buckets)
    }

    /// Delete every key of a bucket, metadata included
    pub fn delete_bucket(&self, kind: AccumulatorKind, bucket: u32) -> Result<usize> {
        let range = search_range(kind, bucket);
        let mut deleted = 0;
        let mut batch = self.batch();

        for item in self.cells.range(range.gte.to_vec()..range.lt.to_vec()) {
            let (key, _) = item?;
            batch.remove_raw(&key);
            deleted += 1;
            if batch.len() >= DELETE_CHUNK {
                batch.commit()?;
                batch = self.batch();
            }
        }
        batch.commit()?;

        if deleted > 0 {
            debug!(
                "Deleted {} keys of {}/{} from station {}",
                deleted, kind, bucket, self.station
            );
        }
        Ok(deleted)
    }

    /// Number of cell rows in a bucket
    pub fn approximate_cells(&self, kind: AccumulatorKind, bucket: u32) -> Result<usize> {
        let range = search_range(kind, bucket);
        let mut count = 0;
        for item in self.cells.range(range.gte.to_vec()..range.lt.to_vec()) {
            let (key, _) = item?;
            if !matches!(CellKey::parse(&key), Ok(parsed) if parsed.is_meta()) {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Decoded rows of a bucket, sorted by cell id. Corrupt cells are
    /// logged and skipped.
    pub fn rows(&self, kind: AccumulatorKind, bucket: u32) -> Result<Vec<CellRow>> {
        let mut rows = Vec::new();
        for item in self.cells(kind, bucket, None) {
            let raw = match item {
                Ok(raw) => raw,
                Err(e) if e.is_per_cell() => {
                    warn!("Skipping unreadable key in station {}: {}", self.station, e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            match raw.decode() {
                Ok(record) => rows.push(record.to_row(raw.cell())),
                Err(e) => warn!("Skipping {} in station {}: {}", raw.key, self.station, e),
            }
        }
        Ok(rows)
    }

    /// Overwrite cells of a bucket from externally supplied rows. Every row
    /// is decoded and checked against the store's variant before anything
    /// is written; rows with a zero count delete their cell.
    pub fn rebuild_from_rows(
        &self,
        kind: AccumulatorKind,
        bucket: u32,
        rows: &[CellRow],
    ) -> Result<usize> {
        let variant = self.variant();
        let records = rows
            .iter()
            .map(|row| {
                let record = AggregateRecord::from_row(row)?;
                if record.variant() != variant {
                    return Err(Error::corrupt(format!(
                        "row for {} is a {:?} record, station {} keeps {:?} records",
                        row.cell,
                        record.variant(),
                        self.station,
                        variant
                    )));
                }
                Ok((CellKey::new(self.station, kind, bucket, row.cell), record))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut batch = self.batch();
        for (key, record) in &records {
            if record.is_empty() {
                batch.remove(key);
            } else {
                batch.put_record(key, record);
            }
        }
        batch.commit()?;

        info!(
            "Rebuilt {} cells of {}/{} in station {}",
            records.len(),
            kind,
            bucket,
            self.station
        );
        Ok(records.len())
    }

    pub fn persist(&self) -> Result<()> {
        self.keyspace.persist(PersistMode::SyncAll)?;
        Ok(())
    }
}

/// Atomic group of writes against one store
pub struct StoreBatch {
    batch: Batch,
    cells: PartitionHandle,
    writes: usize,
}

impl StoreBatch {
    pub fn put_record(&mut self, key: &CellKey, record: &AggregateRecord) {
        self.batch
            .insert(&self.cells, key.db_key().as_ref(), record.serialize());
        self.writes += 1;
    }

    pub fn put_meta(&mut self, key: &CellKey, meta: &AccumulatorMeta) -> Result<()> {
        self.batch
            .insert(&self.cells, key.db_key().as_ref(), meta.to_json()?);
        self.writes += 1;
        Ok(())
    }

    pub fn remove(&mut self, key: &CellKey) {
        self.remove_raw(&key.db_key());
    }

    fn remove_raw(&mut self, key: &[u8]) {
        self.batch.remove(&self.cells, key);
        self.writes += 1;
    }

    pub fn len(&self) -> usize {
        self.writes
    }

    pub fn commit(self) -> Result<()> {
        if self.writes > 0 {
            self.batch.commit()?;
        }
        Ok(())
    }
}

struct PooledStore {
    store: Arc<StationStore>,
    last_used: Instant,
}

/// LRU of open store handles
pub struct StorePool {
    root: PathBuf,
    max_open: usize,
    expiry: Duration,
    open: Mutex<LruCache<StationId, PooledStore>>,
}

impl StorePool {
    pub fn new(root: impl Into<PathBuf>, max_open: usize, expiry: Duration) -> Self {
        Self {
            root: root.into(),
            max_open: max_open.max(1),
            expiry,
            open: Mutex::new(LruCache::unbounded()),
        }
    }

    pub fn path_for(&self, station: StationId) -> PathBuf {
        if station == GLOBAL_STATION {
            self.root.join("global")
        } else {
            self.root.join("stations").join(station.to_string())
        }
    }

    /// Get an open handle, opening the store if needed
    pub fn get(&self, station: StationId) -> Result<Arc<StationStore>> {
        let mut open = self.open.lock();
        if let Some(entry) = open.get_mut(&station) {
            entry.last_used = Instant::now();
            return Ok(Arc::clone(&entry.store));
        }

        let store = Arc::new(StationStore::open(&self.path_for(station), station)?);
        open.put(
            station,
            PooledStore {
                store: Arc::clone(&store),
                last_used: Instant::now(),
            },
        );
        self.shrink(&mut open);
        Ok(store)
    }

    // Only handles nobody else holds are closed, so a path is never open twice
    fn shrink(&self, open: &mut LruCache<StationId, PooledStore>) {
        while open.len() > self.max_open {
            let idle = open
                .iter()
                .rev()
                .find(|(_, entry)| Arc::strong_count(&entry.store) == 1)
                .map(|(station, _)| *station);
            match idle {
                Some(station) => {
                    if let Some(entry) = open.pop(&station) {
                        close(entry.store);
                    }
                }
                None => break,
            }
        }
    }

    /// Close handles idle for longer than the expiry. Returns how many closed.
    pub fn expire(&self) -> usize {
        let mut open = self.open.lock();
        let now = Instant::now();
        let stale: Vec<StationId> = open
            .iter()
            .filter(|(_, entry)| {
                now.duration_since(entry.last_used) >= self.expiry
                    && Arc::strong_count(&entry.store) == 1
            })
            .map(|(station, _)| *station)
            .collect();

        for station in &stale {
            if let Some(entry) = open.pop(station) {
                close(entry.store);
            }
        }
        stale.len()
    }

    pub fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    /// Every station with a store on disk, global first
    pub fn known_stations(&self) -> Result<Vec<StationId>> {
        let mut stations = vec![GLOBAL_STATION];
        let dir = self.root.join("stations");
        if dir.is_dir() {
            let mut found: Vec<StationId> = std::fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
                .filter(|station| *station != GLOBAL_STATION)
                .collect();
            found.sort_unstable();
            stations.extend(found);
        }
        Ok(stations)
    }

    /// Persist and drop every handle
    pub fn close_all(&self) {
        let mut open = self.open.lock();
        while let Some((_, entry)) = open.pop_lru() {
            close(entry.store);
        }
    }
}

fn close(store: Arc<StationStore>) {
    if let Err(e) = store.persist() {
        warn!("Failed to persist store for station {}: {}", store.station(), e);
    }
    debug!(
        "Closed store for station {} at {}",
        store.station(),
        store.path().display()
    );
}

/// Locks keyed by [`CellKey::lock_key`], one per (kind, bucket, station)
#[derive(Default)]
pub struct BucketLocks {
    locks: Mutex<HashMap<Bytes, Arc<tokio::sync::Mutex<()>>>>,
}

impl BucketLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, lock_key: &Bytes) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(lock_key.clone()).or_default())
    }

    pub async fn lock(&self, lock_key: &Bytes) -> OwnedMutexGuard<()> {
        self.handle(lock_key).lock_owned().await
    }

    /// Blocking variant for worker threads. Must not be called from async code.
    pub fn blocking_lock(&self, lock_key: &Bytes) -> OwnedMutexGuard<()> {
        self.handle(lock_key).blocking_lock_owned()
    }

    /// Acquire several group locks in key order
    pub fn blocking_lock_all(&self, lock_keys: &[Bytes]) -> Vec<OwnedMutexGuard<()>> {
        let mut keys: Vec<&Bytes> = lock_keys.iter().collect::<HashSet<_>>().into_iter().collect();
        keys.sort();
        keys.into_iter().map(|key| self.blocking_lock(key)).collect()
    }

    /// Forget locks that nobody holds or waits on
    pub fn prune(&self) {
        self.locks
            .lock()
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Observation;
    use tempfile::TempDir;

    fn obs(station: StationId) -> Observation {
        Observation {
            altitude: 1200,
            agl: 300,
            crc_errors: 0,
            signal: 40,
            gap: 2,
            station,
        }
    }

    fn record(variant: Variant, updates: u32) -> AggregateRecord {
        let mut record = AggregateRecord::new(variant);
        for _ in 0..updates {
            record.update(&obs(3));
        }
        record
    }

    #[test]
    fn test_write_group_and_get() {
        let dir = TempDir::new().unwrap();
        let store = StationStore::open(dir.path(), 3).unwrap();
        let key = CellKey::new(3, AccumulatorKind::Current, 7, CellId(0x10));
        let rec = record(Variant::Station, 2);

        store
            .write_group(AccumulatorKind::Current, 7, &[(key, rec.clone())], 1000)
            .unwrap();
        assert_eq!(store.get(&key).unwrap(), Some(rec));
        let missing = CellKey::new(3, AccumulatorKind::Current, 7, CellId(0x11));
        assert!(store.get(&missing).unwrap().is_none());

        let meta = store.read_meta(AccumulatorKind::Current, 7).unwrap().unwrap();
        assert_eq!(meta.start, 1000);
        assert_eq!(meta.flushes, 1);
        assert_eq!(meta.cells_written, 1);
    }

    #[test]
    fn test_get_reports_corrupt_value() {
        let dir = TempDir::new().unwrap();
        let store = StationStore::open(dir.path(), 3).unwrap();
        let key = CellKey::new(3, AccumulatorKind::Day, 1, CellId(1));
        store.cells.insert(key.db_key().as_ref(), vec![0x01, 0x02]).unwrap();
        assert!(matches!(store.get(&key), Err(Error::CorruptRecord { .. })));
    }

    #[test]
    fn test_cells_iterate_in_order_and_resume() {
        let dir = TempDir::new().unwrap();
        let store = StationStore::open(dir.path(), 3).unwrap();
        let records: Vec<_> = [30u64, 10, 20]
            .iter()
            .map(|&c| {
                let key = CellKey::new(3, AccumulatorKind::Day, 5, CellId(c));
                (key, record(Variant::Station, 1))
            })
            .collect();
        store.write_group(AccumulatorKind::Day, 5, &records, 0).unwrap();
        // neighbouring bucket must not leak into the scan
        let other = CellKey::new(3, AccumulatorKind::Day, 6, CellId(1));
        store
            .write_group(AccumulatorKind::Day, 6, &[(other, record(Variant::Station, 1))], 0)
            .unwrap();

        let cells: Vec<u64> = store
            .cells(AccumulatorKind::Day, 5, None)
            .map(|c| c.unwrap().cell().0)
            .collect();
        assert_eq!(cells, vec![10, 20, 30]);

        let after: Vec<u64> = store
            .cells(AccumulatorKind::Day, 5, Some(CellId(10)))
            .map(|c| c.unwrap().cell().0)
            .collect();
        assert_eq!(after, vec![20, 30]);
        assert_eq!(store.approximate_cells(AccumulatorKind::Day, 5).unwrap(), 3);
    }

    #[test]
    fn test_buckets_skip_between_groups() {
        let dir = TempDir::new().unwrap();
        let store = StationStore::open(dir.path(), 0).unwrap();
        for bucket in [12u32, 3, 40] {
            let records: Vec<_> = (0..5u64)
                .map(|c| {
                    (
                        CellKey::new(0, AccumulatorKind::Current, bucket, CellId(c)),
                        record(Variant::Global, 1),
                    )
                })
                .collect();
            store
                .write_group(AccumulatorKind::Current, bucket, &records, 0)
                .unwrap();
        }
        let day = CellKey::new(0, AccumulatorKind::Day, 2026001, CellId(1));
        store
            .write_group(AccumulatorKind::Day, 2026001, &[(day, record(Variant::Global, 1))], 0)
            .unwrap();

        assert_eq!(store.buckets(AccumulatorKind::Current).unwrap(), vec![3, 12, 40]);
        assert_eq!(store.buckets(AccumulatorKind::Day).unwrap(), vec![2026001]);
        assert!(store.buckets(AccumulatorKind::Year).unwrap().is_empty());
    }

    #[test]
    fn test_delete_bucket() {
        let dir = TempDir::new().unwrap();
        let store = StationStore::open(dir.path(), 3).unwrap();
        let records: Vec<_> = (0..10u64)
            .map(|c| {
                let key = CellKey::new(3, AccumulatorKind::Current, 1, CellId(c));
                (key, record(Variant::Station, 1))
            })
            .collect();
        store.write_group(AccumulatorKind::Current, 1, &records, 0).unwrap();
        let kept = CellKey::new(3, AccumulatorKind::Current, 2, CellId(0));
        store
            .write_group(AccumulatorKind::Current, 2, &[(kept, record(Variant::Station, 1))], 0)
            .unwrap();

        // ten cells plus the metadata row
        assert_eq!(store.delete_bucket(AccumulatorKind::Current, 1).unwrap(), 11);
        assert!(store.read_meta(AccumulatorKind::Current, 1).unwrap().is_none());
        assert_eq!(store.buckets(AccumulatorKind::Current).unwrap(), vec![2]);
        assert!(store.get(&kept).unwrap().is_some());
    }

    #[test]
    fn test_rows_and_rebuild() {
        let dir = TempDir::new().unwrap();
        let store = StationStore::open(dir.path(), 0).unwrap();
        let records: Vec<_> = [5u64, 1, 9]
            .iter()
            .map(|&c| {
                let key = CellKey::new(0, AccumulatorKind::Month, 202610, CellId(c));
                (key, record(Variant::Global, c as u32))
            })
            .collect();
        store.write_group(AccumulatorKind::Month, 202610, &records, 0).unwrap();

        let rows = store.rows(AccumulatorKind::Month, 202610).unwrap();
        let cells: Vec<u64> = rows.iter().map(|r| r.cell.0).collect();
        assert_eq!(cells, vec![1, 5, 9]);
        assert_eq!(rows[2].count, 9);

        let mut repaired = rows.clone();
        repaired[0].count = 0;
        repaired[1].count = 50;
        let rebuilt = store
            .rebuild_from_rows(AccumulatorKind::Month, 202610, &repaired)
            .unwrap();
        assert_eq!(rebuilt, 3);
        let rows = store.rows(AccumulatorKind::Month, 202610).unwrap();
        let counts: Vec<(u64, u32)> = rows.iter().map(|r| (r.cell.0, r.count)).collect();
        assert_eq!(counts, vec![(5, 50), (9, 9)]);
    }

    #[test]
    fn test_rebuild_rejects_bad_rows_before_writing() {
        let dir = TempDir::new().unwrap();
        let store = StationStore::open(dir.path(), 0).unwrap();
        let mut good = record(Variant::Global, 2).to_row(CellId(1));
        good.count = 7;
        let mut bad = good.clone();
        bad.cell = CellId(2);
        bad.stations = Some("nonsense".to_string());

        assert!(store.rebuild_from_rows(AccumulatorKind::Day, 1, &[good, bad]).is_err());
        assert!(store.rows(AccumulatorKind::Day, 1).unwrap().is_empty());
    }

    #[test]
    fn test_rebuild_rejects_rows_of_the_other_variant() {
        let dir = TempDir::new().unwrap();
        let global = StationStore::open(&dir.path().join("global"), 0).unwrap();
        let station = StationStore::open(&dir.path().join("station"), 4).unwrap();
        let station_row = record(Variant::Station, 2).to_row(CellId(1));
        let global_row = record(Variant::Global, 2).to_row(CellId(2));

        let mixed = [global_row.clone(), station_row.clone()];
        let err = global
            .rebuild_from_rows(AccumulatorKind::Day, 2026290, &mixed)
            .unwrap_err();
        assert!(matches!(err, Error::CorruptRecord { .. }));
        assert!(global.rows(AccumulatorKind::Day, 2026290).unwrap().is_empty());

        let wrong = station.rebuild_from_rows(AccumulatorKind::Day, 2026290, &[global_row]);
        assert!(wrong.is_err());
        assert!(station.rows(AccumulatorKind::Day, 2026290).unwrap().is_empty());

        assert_eq!(
            station
                .rebuild_from_rows(AccumulatorKind::Day, 2026290, &[station_row])
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_pool_reuses_and_bounds_handles() {
        let dir = TempDir::new().unwrap();
        let pool = StorePool::new(dir.path(), 2, Duration::from_secs(600));

        let a = pool.get(1).unwrap();
        let again = pool.get(1).unwrap();
        assert!(Arc::ptr_eq(&a, &again));
        drop(again);
        drop(a);

        pool.get(2).unwrap();
        pool.get(3).unwrap();
        assert_eq!(pool.open_count(), 2);

        // handles in use are never closed
        let held: Vec<_> = [4, 5, 6].iter().map(|s| pool.get(*s).unwrap()).collect();
        assert_eq!(pool.open_count(), 3);
        drop(held);

        assert_eq!(pool.known_stations().unwrap(), vec![0, 1, 2, 3, 4, 5, 6]);
        pool.close_all();
        assert_eq!(pool.open_count(), 0);
    }

    #[test]
    fn test_pool_expires_idle_handles() {
        let dir = TempDir::new().unwrap();
        let pool = StorePool::new(dir.path(), 10, Duration::ZERO);
        let held = pool.get(GLOBAL_STATION).unwrap();
        pool.get(8).unwrap();
        assert_eq!(pool.expire(), 1);
        assert_eq!(pool.open_count(), 1);
        assert_eq!(held.path(), dir.path().join("global"));
    }

    #[tokio::test]
    async fn test_bucket_locks_are_exclusive() {
        let locks = Arc::new(BucketLocks::new());
        let key = CellKey::meta(1, AccumulatorKind::Current, 1).lock_key();
        let guard = locks.lock(&key).await;

        let other = Arc::clone(&locks);
        let other_key = key.clone();
        let waiter = tokio::spawn(async move {
            let _guard = other.lock(&other_key).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        waiter.await.unwrap();
        locks.prune();
        assert_eq!(locks.len(), 0);
    }
}
