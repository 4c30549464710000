//! Rollup and purge passes
//!
//!  A rollup merge-joins the cells of a source bucket (normally a stale
//!  `current` bucket) with the cells of a destination bucket in the same
//!  store. Both streams come out of the store in ascending cell order, so one
//!  forward pass over each is enough. Destination writes are committed every
//!  [`BATCH_CELLS`] cells together with a progress cursor in the source
//!  group's metadata row, which lets an interrupted pass pick up where it
//!  stopped without merging any source cell twice.
//!
//!  Passes run on a small pool of worker threads fed through a bounded
//!  queue. Each pass holds the bucket locks of every group it touches.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, bounded};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::AccumulatorClock;
use crate::error::{Error, Result};
use crate::key::{AccumulatorKind, CellId, CellKey, StationId};
use crate::meta::AccumulatorMeta;
use crate::record::{AggregateRecord, RemovalOutcome, Variant};
use crate::store::{BucketLocks, RawCell, StationStore, StoreBatch, StorePool};

/// Cells merged between two commits
pub const BATCH_CELLS: usize = 256;

const QUEUE_DEPTH: usize = 64;

/// Counters of one rollup or purge pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupStats {
    /// Source cells read
    pub source: u64,
    /// Destination-only cells left as they were
    pub no_change: u64,
    /// Source cells with no destination record yet
    pub missing: u64,
    /// Destination records merged with a source cell
    pub updated: u64,
    /// Destination-only cells outside the span of the source scan
    pub extra: u64,
    /// Records that lost an invalid station but kept observations
    pub stations_removed: u64,
    /// Records deleted because nothing was left
    pub emptied: u64,
}

impl RollupStats {
    pub fn absorb(&mut self, other: &RollupStats) {
        self.source += other.source;
        self.no_change += other.no_change;
        self.missing += other.missing;
        self.updated += other.updated;
        self.extra += other.extra;
        self.stations_removed += other.stations_removed;
        self.emptied += other.emptied;
    }

    fn count_outcome(&mut self, outcome: RemovalOutcome) {
        match outcome {
            RemovalOutcome::Unchanged => {}
            RemovalOutcome::Updated => self.stations_removed += 1,
            RemovalOutcome::Emptied => self.emptied += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RollupPhase {
    Idle,
    Scanning,
    Merging,
    Purging,
}

// Pulls the next decodable cell, logging and skipping per-cell failures
fn next_cell(
    store: &StationStore,
    iter: &mut impl Iterator<Item = Result<RawCell>>,
) -> Result<Option<(CellId, AggregateRecord)>> {
    for item in iter.by_ref() {
        let raw = match item {
            Ok(raw) => raw,
            Err(e) if e.is_per_cell() => {
                warn!("Skipping unreadable key in station {}: {}", store.station(), e);
                continue;
            }
            Err(e) => return Err(e),
        };
        match raw.decode() {
            Ok(record) => return Ok(Some((raw.cell(), record))),
            Err(e) => warn!("Skipping {} in station {}: {}", raw.key, store.station(), e),
        }
    }
    Ok(None)
}

fn write_checked(
    batch: &mut StoreBatch,
    key: &CellKey,
    mut record: AggregateRecord,
    valid: &HashSet<StationId>,
    stats: &mut RollupStats,
) {
    let outcome = record.remove_invalid_stations(valid);
    stats.count_outcome(outcome);
    if record.is_empty() {
        batch.remove(key);
    } else {
        batch.put_record(key, &record);
    }
}

/// Merge one source bucket into one destination bucket of the same store.
///
/// Returns [`Error::Cancelled`] when `cancel` fires; everything committed up
/// to that point stays and is skipped when the pass is run again.
pub fn rollup_into(
    store: &StationStore,
    source: (AccumulatorKind, u32),
    target: (AccumulatorKind, u32),
    valid: &HashSet<StationId>,
    cancel: &CancellationToken,
) -> Result<RollupStats> {
    let (src_kind, src_bucket) = source;
    let (dst_kind, dst_bucket) = target;
    let station = store.station();
    let now = chrono::Utc::now().timestamp();

    let mut src_meta = store
        .read_meta(src_kind, src_bucket)?
        .unwrap_or_else(|| AccumulatorMeta::new(src_kind, src_bucket, now));
    let resume = match src_meta.progress(dst_kind, dst_bucket) {
        Some(progress) if progress.complete => {
            debug!(
                "{}/{} of station {} already rolled into {}/{}",
                src_kind, src_bucket, station, dst_kind, dst_bucket
            );
            return Ok(RollupStats::default());
        }
        Some(progress) => progress.cursor,
        None => None,
    };

    let mut src_iter = store.cells(src_kind, src_bucket, resume);
    let mut dst_iter = store.cells(dst_kind, dst_bucket, resume);
    let mut src_head = next_cell(store, &mut src_iter)?;
    let mut dst_head = next_cell(store, &mut dst_iter)?;

    let mut stats = RollupStats::default();
    let mut seen_source = resume.is_some();
    let mut cursor = resume;
    let mut batch = store.batch();
    let mut pending = 0;

    loop {
        let src_cell = src_head.as_ref().map(|(cell, _)| *cell);
        let dst_cell = dst_head.as_ref().map(|(cell, _)| *cell);

        match (src_cell, dst_cell) {
            (None, None) => break,

            // destination only
            (s, Some(d)) if s.is_none_or(|s| d < s) => {
                let Some((cell, mut record)) = dst_head.take() else {
                    break;
                };
                let key = CellKey::new(station, dst_kind, dst_bucket, cell);
                let outcome = record.remove_invalid_stations(valid);
                if !seen_source || s.is_none() {
                    stats.extra += 1;
                } else if outcome == RemovalOutcome::Unchanged {
                    stats.no_change += 1;
                }
                stats.count_outcome(outcome);
                match outcome {
                    RemovalOutcome::Unchanged => {}
                    RemovalOutcome::Updated => batch.put_record(&key, &record),
                    RemovalOutcome::Emptied => batch.remove(&key),
                }
                cursor = Some(cell);
                dst_head = next_cell(store, &mut dst_iter)?;
            }

            // same cell on both sides
            (Some(s), Some(d)) if s == d => {
                let (Some((cell, incoming)), Some((_, existing))) =
                    (src_head.take(), dst_head.take())
                else {
                    break;
                };
                seen_source = true;
                stats.source += 1;
                stats.updated += 1;
                let key = CellKey::new(station, dst_kind, dst_bucket, cell);
                write_checked(&mut batch, &key, existing.merge_into(&incoming), valid, &mut stats);
                cursor = Some(cell);
                src_head = next_cell(store, &mut src_iter)?;
                dst_head = next_cell(store, &mut dst_iter)?;
            }

            // source only
            _ => {
                let Some((cell, incoming)) = src_head.take() else {
                    break;
                };
                seen_source = true;
                stats.source += 1;
                stats.missing += 1;
                let key = CellKey::new(station, dst_kind, dst_bucket, cell);
                write_checked(&mut batch, &key, incoming, valid, &mut stats);
                cursor = Some(cell);
                src_head = next_cell(store, &mut src_iter)?;
            }
        }

        pending += 1;
        if pending >= BATCH_CELLS {
            src_meta.set_progress(dst_kind, dst_bucket, cursor, false);
            batch.put_meta(&CellKey::meta(station, src_kind, src_bucket), &src_meta)?;
            batch.commit()?;
            batch = store.batch();
            pending = 0;

            if cancel.is_cancelled() {
                info!(
                    "Rollup of {}/{} into {}/{} for station {} interrupted at {:?}",
                    src_kind, src_bucket, dst_kind, dst_bucket, station, cursor
                );
                return Err(Error::Cancelled);
            }
        }
    }

    let mut dst_meta = match store.read_meta(dst_kind, dst_bucket) {
        Ok(Some(meta)) => meta,
        Ok(None) => AccumulatorMeta::new(dst_kind, dst_bucket, src_meta.start),
        Err(Error::Json(e)) => {
            warn!("Replacing unreadable metadata of {}/{}: {}", dst_kind, dst_bucket, e);
            AccumulatorMeta::new(dst_kind, dst_bucket, src_meta.start)
        }
        Err(e) => return Err(e),
    };
    dst_meta.start = dst_meta.start.min(src_meta.start);
    dst_meta.end = dst_meta.end.max(src_meta.end);
    dst_meta.last_rollup = Some(stats);

    src_meta.set_progress(dst_kind, dst_bucket, cursor, true);
    batch.put_meta(&CellKey::meta(station, src_kind, src_bucket), &src_meta)?;
    batch.put_meta(&CellKey::meta(station, dst_kind, dst_bucket), &dst_meta)?;
    batch.commit()?;

    Ok(stats)
}

/// Roll a source bucket into every target, then delete it
pub fn rollup_bucket(
    store: &StationStore,
    source: (AccumulatorKind, u32),
    targets: &[(AccumulatorKind, u32)],
    valid: &HashSet<StationId>,
    cancel: &CancellationToken,
) -> Result<RollupStats> {
    debug!(
        "Station {} rolling up {} cells of {}/{}",
        store.station(),
        store.approximate_cells(source.0, source.1)?,
        source.0,
        source.1
    );
    let mut total = RollupStats::default();
    for &target in targets {
        let stats = rollup_into(store, source, target, valid, cancel)?;
        debug!(
            "Station {} {}/{} -> {}/{}: {:?}",
            store.station(),
            source.0,
            source.1,
            target.0,
            target.1,
            stats
        );
        total.absorb(&stats);
    }
    store.delete_bucket(source.0, source.1)?;
    Ok(total)
}

/// Drop invalid stations from every cell of a bucket without new data.
/// Station stores carry no per-station breakdown and are left alone.
pub fn purge(
    store: &StationStore,
    kind: AccumulatorKind,
    bucket: u32,
    valid: &HashSet<StationId>,
    cancel: &CancellationToken,
) -> Result<RollupStats> {
    let mut stats = RollupStats::default();
    if store.variant() == Variant::Station {
        return Ok(stats);
    }

    let mut iter = store.cells(kind, bucket, None);
    let mut batch = store.batch();
    let mut pending = 0;
    while let Some((cell, mut record)) = next_cell(store, &mut iter)? {
        let key = CellKey::new(store.station(), kind, bucket, cell);
        let outcome = record.remove_invalid_stations(valid);
        match outcome {
            RemovalOutcome::Unchanged => stats.no_change += 1,
            RemovalOutcome::Updated => batch.put_record(&key, &record),
            RemovalOutcome::Emptied => batch.remove(&key),
        }
        stats.count_outcome(outcome);

        pending += 1;
        if pending >= BATCH_CELLS {
            batch.commit()?;
            batch = store.batch();
            pending = 0;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
        }
    }
    batch.commit()?;
    Ok(stats)
}

/// Work accepted by the rollup workers
#[derive(Debug, Clone)]
pub enum RollupJob {
    /// Roll up and delete every current bucket older than `active`
    Stale {
        station: StationId,
        active: u32,
        valid: Arc<HashSet<StationId>>,
    },
    Purge {
        station: StationId,
        kind: AccumulatorKind,
        bucket: u32,
        valid: Arc<HashSet<StationId>>,
    },
    /// Delete every bucket of `kind` older than `before`
    Retire {
        station: StationId,
        kind: AccumulatorKind,
        before: u32,
    },
}

impl RollupJob {
    pub fn station(&self) -> StationId {
        match self {
            RollupJob::Stale { station, .. }
            | RollupJob::Purge { station, .. }
            | RollupJob::Retire { station, .. } => *station,
        }
    }
}

struct Envelope {
    job: RollupJob,
    reply: oneshot::Sender<Result<RollupStats>>,
}

#[derive(Clone)]
struct Worker {
    stores: Arc<StorePool>,
    locks: Arc<BucketLocks>,
    clock: AccumulatorClock,
    cancel: CancellationToken,
    phases: Arc<Mutex<HashMap<StationId, RollupPhase>>>,
    last: Arc<Mutex<HashMap<StationId, RollupStats>>>,
}

impl Worker {
    fn run(self, rx: Receiver<Envelope>) {
        while let Ok(Envelope { job, reply }) = rx.recv() {
            let result = if self.cancel.is_cancelled() {
                Err(Error::Cancelled)
            } else {
                self.process(&job)
            };

            match &result {
                Ok(stats) => {
                    self.last.lock().insert(job.station(), *stats);
                }
                Err(Error::Cancelled) => {}
                Err(e) => error!("Rollup job for station {} failed: {}", job.station(), e),
            }
            self.set_phase(job.station(), RollupPhase::Idle);
            reply.send(result).ok();
        }
        debug!("Rollup worker exiting");
    }

    fn set_phase(&self, station: StationId, phase: RollupPhase) {
        let mut phases = self.phases.lock();
        if phase == RollupPhase::Idle {
            phases.remove(&station);
        } else {
            phases.insert(station, phase);
        }
    }

    fn process(&self, job: &RollupJob) -> Result<RollupStats> {
        let store = self.stores.get(job.station())?;
        let station = store.station();
        let mut total = RollupStats::default();

        match job {
            RollupJob::Stale { active, valid, .. } => {
                self.set_phase(station, RollupPhase::Scanning);
                let stale: Vec<u32> = store
                    .buckets(AccumulatorKind::Current)?
                    .into_iter()
                    .filter(|bucket| bucket < active)
                    .collect();

                for bucket in stale {
                    let source = (AccumulatorKind::Current, bucket);
                    let targets = self.clock.targets_for(bucket);
                    let mut keys = vec![CellKey::meta(station, source.0, source.1).lock_key()];
                    keys.extend(
                        targets
                            .iter()
                            .map(|(kind, b)| CellKey::meta(station, *kind, *b).lock_key()),
                    );

                    let _guards = self.locks.blocking_lock_all(&keys);
                    self.set_phase(station, RollupPhase::Merging);
                    let stats = rollup_bucket(&store, source, &targets, valid, &self.cancel)?;
                    info!(
                        "Rolled up current bucket {} of station {}: {} source cells, {} updated, {} new, {} emptied",
                        bucket, station, stats.source, stats.updated, stats.missing, stats.emptied
                    );
                    total.absorb(&stats);
                }
            }
            RollupJob::Purge { kind, bucket, valid, .. } => {
                let key = CellKey::meta(station, *kind, *bucket).lock_key();
                let _guard = self.locks.blocking_lock(&key);
                self.set_phase(station, RollupPhase::Purging);
                total = purge(&store, *kind, *bucket, valid, &self.cancel)?;
            }
            RollupJob::Retire { kind, before, .. } => {
                self.set_phase(station, RollupPhase::Purging);
                let expired: Vec<u32> = store
                    .buckets(*kind)?
                    .into_iter()
                    .filter(|bucket| bucket < before)
                    .collect();
                for bucket in expired {
                    let key = CellKey::meta(station, *kind, bucket).lock_key();
                    let _guard = self.locks.blocking_lock(&key);
                    let deleted = store.delete_bucket(*kind, bucket)?;
                    info!(
                        "Retired {}/{} of station {} ({} keys)",
                        kind, bucket, station, deleted
                    );
                }
            }
        }
        Ok(total)
    }
}

/// Fixed set of worker threads running rollup jobs
pub struct RollupPool {
    sender: Mutex<Option<Sender<Envelope>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    phases: Arc<Mutex<HashMap<StationId, RollupPhase>>>,
    last: Arc<Mutex<HashMap<StationId, RollupStats>>>,
}

impl RollupPool {
    pub fn new(
        workers: usize,
        stores: Arc<StorePool>,
        locks: Arc<BucketLocks>,
        clock: AccumulatorClock,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let (tx, rx) = bounded::<Envelope>(QUEUE_DEPTH);
        let worker = Worker {
            stores,
            locks,
            clock,
            cancel: cancel.clone(),
            phases: Arc::new(Mutex::new(HashMap::new())),
            last: Arc::new(Mutex::new(HashMap::new())),
        };

        let mut handles = Vec::new();
        for i in 0..workers.max(1) {
            let worker = worker.clone();
            let rx = rx.clone();
            let handle = std::thread::Builder::new()
                .name(format!("rollup-{i}"))
                .spawn(move || worker.run(rx))?;
            handles.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(tx)),
            handles: Mutex::new(handles),
            cancel,
            phases: worker.phases,
            last: worker.last,
        })
    }

    /// Queue a job and wait for its result
    pub async fn submit(&self, job: RollupJob) -> Result<RollupStats> {
        let sender = self.sender.lock().clone().ok_or(Error::WorkerGone)?;
        let (reply, rx) = oneshot::channel();

        // the queue is bounded, so sending may block
        tokio::task::spawn_blocking(move || sender.send(Envelope { job, reply }))
            .await?
            .map_err(|_| Error::WorkerGone)?;

        rx.await.map_err(|_| Error::WorkerGone)?
    }

    /// Stations with a pass in progress
    pub fn phases(&self) -> HashMap<StationId, RollupPhase> {
        self.phases.lock().clone()
    }

    /// Counters of the most recent finished job per station
    pub fn last_stats(&self) -> HashMap<StationId, RollupStats> {
        self.last.lock().clone()
    }

    /// Cancel running passes and join the workers. Blocks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        self.sender.lock().take();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("Rollup worker panicked");
            }
        }
    }
}
