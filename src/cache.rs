//! Write-behind record cache
//!
//!  Observations are merged into in-memory records; the store is only read on
//!  a cache miss and only written by [`WriteBehindCache::flush`]. A flush
//!  writes entries that have gone idle, plus any entry that has stayed dirty
//!  longer than the maximum dirty period, so durability lag is bounded even
//!  for cells that are updated constantly.
//!
//!  While a rollover rolls stale current buckets up, observations for those
//!  buckets are held back as deltas instead of being merged into the cached
//!  copy of the stored record. Once a station's stale buckets are gone from
//!  its store the deltas start fresh records, so nothing already rolled up is
//!  written back and counted again.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::key::{AccumulatorKind, CellKey, StationId};
use crate::record::{AggregateRecord, Observation, Variant};
use crate::store::{BucketLocks, StorePool};

struct CacheEntry {
    record: AggregateRecord,
    dirty: bool,
    /// Bumped on every update so a flush can tell whether it wrote the latest state
    version: u64,
    dirty_since: Option<Instant>,
    last_access: Instant,
}

impl CacheEntry {
    fn new(record: AggregateRecord, now: Instant) -> Self {
        Self {
            record,
            dirty: false,
            version: 0,
            dirty_since: None,
            last_access: now,
        }
    }

    fn apply(&mut self, obs: &Observation, now: Instant) {
        self.record.update(obs);
        self.touch(now);
    }

    fn absorb(&mut self, delta: &AggregateRecord, now: Instant) {
        self.record = self.record.merge_into(delta);
        self.touch(now);
    }

    fn touch(&mut self, now: Instant) {
        self.version += 1;
        self.last_access = now;
        if !self.dirty {
            self.dirty = true;
            self.dirty_since = Some(now);
        }
    }
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<CellKey, CacheEntry>,
    /// Current buckets below this are being rolled up
    retiring: Option<u32>,
    /// Observations held back for current buckets that are not rolled up yet
    late: HashMap<CellKey, AggregateRecord>,
    /// Bumped whenever `retiring` changes, so a read-through that spans
    /// the change is repeated
    epoch: u64,
}

impl CacheState {
    fn holds_back(&self, key: &CellKey) -> bool {
        key.kind == AccumulatorKind::Current
            && (self.retiring.is_some_and(|floor| key.bucket < floor)
                || self.late.contains_key(key))
    }

    fn hold_back(&mut self, key: CellKey, obs: &Observation) {
        self.late
            .entry(key)
            .or_insert_with(|| AggregateRecord::new(Variant::for_owner(key.station)))
            .update(obs);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushStats {
    /// Entries in the cache when the flush started
    pub total: usize,
    /// Clean idle entries dropped from the cache
    pub expired: usize,
    pub written: usize,
    pub stores_touched: usize,
    /// Entries that stay dirty because their store write failed
    pub failed: usize,
}

type Pending = Vec<(CellKey, AggregateRecord, u64)>;

pub struct WriteBehindCache {
    state: Mutex<CacheState>,
    stores: Arc<StorePool>,
    locks: Arc<BucketLocks>,
    expiry: Duration,
    max_dirty: Duration,
    flushing: tokio::sync::Mutex<()>,
}

impl WriteBehindCache {
    pub fn new(
        stores: Arc<StorePool>,
        locks: Arc<BucketLocks>,
        expiry: Duration,
        max_dirty: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            stores,
            locks,
            expiry,
            max_dirty,
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    /// Merge one observation into the record at `key`, reading the stored
    /// record first if the key is not cached.
    pub async fn update(&self, key: CellKey, obs: &Observation) -> Result<()> {
        let mut epoch = {
            let mut state = self.state.lock();
            if state.holds_back(&key) {
                state.hold_back(key, obs);
                return Ok(());
            }
            if let Some(entry) = state.entries.get_mut(&key) {
                entry.apply(obs, Instant::now());
                return Ok(());
            }
            state.epoch
        };

        loop {
            let stores = Arc::clone(&self.stores);
            let stored =
                tokio::task::spawn_blocking(move || stores.get(key.station)?.get(&key)).await??;

            let now = Instant::now();
            let mut guard = self.state.lock();
            let state = &mut *guard;
            if state.holds_back(&key) {
                state.hold_back(key, obs);
                return Ok(());
            }
            match state.entries.entry(key) {
                // another update won the race; its entry already holds the stored state
                Entry::Occupied(mut occupied) => occupied.get_mut().apply(obs, now),
                // a rollover started or finished while reading; the stored
                // state may already be rolled up
                Entry::Vacant(_) if state.epoch != epoch => {
                    epoch = state.epoch;
                    continue;
                }
                Entry::Vacant(vacant) => {
                    let record = stored
                        .unwrap_or_else(|| AggregateRecord::new(Variant::for_owner(key.station)));
                    vacant.insert(CacheEntry::new(record, now)).apply(obs, now);
                }
            }
            return Ok(());
        }
    }

    /// Start holding back observations for current buckets below `active`.
    /// Must be paired with [`WriteBehindCache::finish_retire`].
    pub fn begin_retire(&self, active: u32) {
        let mut state = self.state.lock();
        state.retiring = Some(active);
        state.epoch += 1;
    }

    /// Stations with unwritten records in current buckets below `active`.
    /// Their stale buckets must not be rolled up until those are written.
    pub fn stale_dirty_stations(&self, active: u32) -> HashSet<StationId> {
        self.state
            .lock()
            .entries
            .iter()
            .filter(|(key, entry)| {
                entry.dirty && key.kind == AccumulatorKind::Current && key.bucket < active
            })
            .map(|(key, _)| key.station)
            .collect()
    }

    /// End a retire started by [`WriteBehindCache::begin_retire`]. Clean
    /// cached copies of stale buckets are dropped, so later misses read
    /// whatever the store holds now. For every station in `rolled` the
    /// held-back observations become fresh dirty records; other stations keep
    /// them held back until a later rollover rolls their buckets. Returns how
    /// many records were released.
    pub fn finish_retire(&self, rolled: &HashSet<StationId>) -> usize {
        let now = Instant::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let Some(floor) = state.retiring.take() else {
            return 0;
        };
        state.epoch += 1;

        // dirty stale entries belong to stations whose rollup was postponed
        state.entries.retain(|key, entry| {
            entry.dirty || key.kind != AccumulatorKind::Current || key.bucket >= floor
        });

        let released: Vec<CellKey> = state
            .late
            .keys()
            .filter(|key| rolled.contains(&key.station))
            .copied()
            .collect();
        for key in &released {
            if let Some(delta) = state.late.remove(key) {
                match state.entries.entry(*key) {
                    Entry::Occupied(mut occupied) => occupied.get_mut().absorb(&delta, now),
                    Entry::Vacant(vacant) => {
                        let mut entry = CacheEntry::new(delta, now);
                        entry.touch(now);
                        vacant.insert(entry);
                    }
                }
            }
        }
        if !state.late.is_empty() {
            debug!("{} held back records wait for a later rollover", state.late.len());
        }
        released.len()
    }

    /// Merge every held-back observation into the stored state of its
    /// bucket. Used at shutdown, when no rollover will release them.
    pub async fn settle_late(&self) -> usize {
        let late = std::mem::take(&mut self.state.lock().late);
        let mut settled = 0;
        for (key, delta) in late {
            if let Some(entry) = self.state.lock().entries.get_mut(&key) {
                entry.absorb(&delta, Instant::now());
                settled += 1;
                continue;
            }

            let stores = Arc::clone(&self.stores);
            let stored = tokio::task::spawn_blocking(move || stores.get(key.station)?.get(&key))
                .await
                .map_err(Error::from)
                .and_then(|stored| stored);
            match stored {
                Ok(stored) => {
                    let now = Instant::now();
                    let mut state = self.state.lock();
                    match state.entries.entry(key) {
                        Entry::Occupied(mut occupied) => occupied.get_mut().absorb(&delta, now),
                        Entry::Vacant(vacant) => {
                            let record = match stored {
                                Some(base) => base.merge_into(&delta),
                                None => delta,
                            };
                            let mut entry = CacheEntry::new(record, now);
                            entry.touch(now);
                            vacant.insert(entry);
                        }
                    }
                    settled += 1;
                }
                Err(e) => error!(
                    "Dropping {} held back observations for {}: {}",
                    delta.count(),
                    key,
                    e
                ),
            }
        }
        settled
    }

    /// Write due entries to their stores and evict idle clean ones
    pub async fn flush(&self, force_all: bool) -> FlushStats {
        let _serial = self.flushing.lock().await;
        let now = Instant::now();
        let mut stats = FlushStats::default();

        let mut due: BTreeMap<StationId, BTreeMap<(AccumulatorKind, u32), Pending>> =
            BTreeMap::new();
        {
            let state = self.state.lock();
            stats.total = state.entries.len();
            for (key, entry) in state.entries.iter().filter(|(_, e)| e.dirty) {
                let idle = now.duration_since(entry.last_access) >= self.expiry;
                let overdue = entry
                    .dirty_since
                    .is_some_and(|since| now.duration_since(since) >= self.max_dirty);
                if force_all || idle || overdue {
                    due.entry(key.station)
                        .or_default()
                        .entry((key.kind, key.bucket))
                        .or_default()
                        .push((*key, entry.record.clone(), entry.version));
                }
            }
        }
        for (station, groups) in due {
            let mut touched = false;
            let mut groups = groups.into_iter();
            while let Some(((kind, bucket), pending)) = groups.next() {
                match self.write_group(station, kind, bucket, &pending).await {
                    Ok(()) => {
                        touched = true;
                        stats.written += pending.len();
                        self.mark_clean(&pending);
                    }
                    Err(e @ Error::StoreUnavailable { .. }) => {
                        warn!("Flush skipped station {}: {}", station, e);
                        stats.failed += pending.len() + groups.map(|(_, p)| p.len()).sum::<usize>();
                        break;
                    }
                    Err(e) => {
                        error!(
                            "Failed to flush {} cells of {}/{} for station {}: {}",
                            pending.len(),
                            kind,
                            bucket,
                            station,
                            e
                        );
                        stats.failed += pending.len();
                    }
                }
            }
            if touched {
                stats.stores_touched += 1;
            }
        }

        let mut state = self.state.lock();
        state.entries.retain(|_, entry| {
            let keep = entry.dirty || now.duration_since(entry.last_access) < self.expiry;
            if !keep {
                stats.expired += 1;
            }
            keep
        });
        drop(state);
        self.locks.prune();

        debug!(
            "Flush: {} cached, {} written, {} expired, {} stores, {} failed",
            stats.total, stats.written, stats.expired, stats.stores_touched, stats.failed
        );
        stats
    }

    async fn write_group(
        &self,
        station: StationId,
        kind: AccumulatorKind,
        bucket: u32,
        pending: &Pending,
    ) -> Result<()> {
        let lock_key = CellKey::meta(station, kind, bucket).lock_key();
        let _guard = self.locks.lock(&lock_key).await;

        let records: Vec<(CellKey, AggregateRecord)> = pending
            .iter()
            .map(|(key, record, _)| (*key, record.clone()))
            .collect();
        let stores = Arc::clone(&self.stores);
        let written_at = chrono::Utc::now().timestamp();
        tokio::task::spawn_blocking(move || {
            stores
                .get(station)?
                .write_group(kind, bucket, &records, written_at)
        })
        .await?
    }

    // entries updated after the snapshot stay dirty for the next flush
    fn mark_clean(&self, pending: &Pending) {
        let mut state = self.state.lock();
        for (key, _, version) in pending {
            if let Some(entry) = state.entries.get_mut(key) {
                if entry.version == *version {
                    entry.dirty = false;
                    entry.dirty_since = None;
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn dirty_count(&self) -> usize {
        self.state.lock().entries.values().filter(|e| e.dirty).count()
    }

    /// Observations held back while their bucket is rolled up
    pub fn held_back(&self) -> usize {
        self.state.lock().late.values().map(|r| r.count() as usize).sum()
    }
}
