//! Coverage engine
//!
//!  Owns every long-lived component and sequences them: observations go into
//!  the write-behind cache, the flush timer drains the cache into the stores,
//!  and each bucket boundary triggers a rollover that rolls stale current
//!  buckets into their day, month and year targets and applies retention.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::json;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cache::{FlushStats, WriteBehindCache};
use crate::clock::{AccumulatorClock, Buckets, retention_cutoffs};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::key::{AccumulatorKind, CellId, CellKey, GLOBAL_STATION, StationId};
use crate::record::{CellRow, Observation};
use crate::rollup::{RollupJob, RollupPool, RollupStats};
use crate::stations::{StationInfo, StationRegistry};
use crate::store::{BucketLocks, StorePool};

#[derive(Default)]
struct JobOutcome {
    stats: RollupStats,
    /// Stations with at least one job that did not complete
    failed: HashSet<StationId>,
    cancelled: bool,
}

impl JobOutcome {
    fn into_stats(self) -> Result<RollupStats> {
        if self.cancelled {
            return Err(Error::Cancelled);
        }
        Ok(self.stats)
    }
}

struct StaleRollup {
    stations: Vec<StationId>,
    /// Stations whose stale current buckets are gone from their store
    rolled: HashSet<StationId>,
    outcome: JobOutcome,
}

#[derive(Default)]
struct EngineState {
    last_flush: Option<FlushStats>,
    last_rollover: Option<Buckets>,
    last_rollup: Option<RollupStats>,
    accepted: u64,
    rejected: u64,
}

pub struct Engine {
    config: Config,
    clock: AccumulatorClock,
    stores: Arc<StorePool>,
    locks: Arc<BucketLocks>,
    cache: WriteBehindCache,
    registry: StationRegistry,
    rollups: Arc<RollupPool>,
    state: Mutex<EngineState>,
}

impl Engine {
    pub fn open(config: &Config, cancel: CancellationToken) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let clock = AccumulatorClock::new(config.rollup_period());
        let stores = Arc::new(StorePool::new(
            &config.data_dir,
            config.max_open_stores,
            config.store_expiry(),
        ));
        let locks = Arc::new(BucketLocks::new());
        let cache = WriteBehindCache::new(
            Arc::clone(&stores),
            Arc::clone(&locks),
            config.cache_expiry(),
            config.max_dirty(),
        );
        let registry = StationRegistry::open(&config.data_dir.join("registry"))?;
        let rollups = Arc::new(RollupPool::new(
            config.max_rollups,
            Arc::clone(&stores),
            Arc::clone(&locks),
            clock,
            cancel,
        )?);

        info!("Opened data directory {}", config.data_dir.display());
        Ok(Self {
            config: config.clone(),
            clock,
            stores,
            locks,
            cache,
            registry,
            rollups,
            state: Mutex::new(EngineState::default()),
        })
    }

    /// Merge an observation into `owner`'s active current bucket
    pub async fn record(&self, owner: StationId, cell: CellId, obs: &Observation) -> Result<()> {
        let bucket = self.clock.current().current;
        self.record_in(CellKey::new(owner, AccumulatorKind::Current, bucket, cell), obs)
            .await
    }

    async fn record_in(&self, key: CellKey, obs: &Observation) -> Result<()> {
        let result = self.cache.update(key, obs).await;
        let mut state = self.state.lock();
        match &result {
            Ok(()) => state.accepted += 1,
            Err(_) => state.rejected += 1,
        }
        result
    }

    /// Record an observation heard by the named station into both the
    /// station's own store and the global store.
    pub async fn ingest(
        &self,
        name: &str,
        cell: CellId,
        mut obs: Observation,
    ) -> Result<StationId> {
        let station = self
            .registry
            .lookup_or_assign(name, Utc::now().timestamp());
        obs.station = station;

        let own = self.record(station, cell, &obs).await;
        let global = self.record(GLOBAL_STATION, cell, &obs).await;
        own.and(global)?;
        Ok(station)
    }

    pub fn mark_invalid(&self, name: &str) -> Option<StationId> {
        let id = self.registry.mark_invalid(name);
        if let Some(id) = id {
            info!("Station {} ({}) marked invalid", name, id);
        }
        id
    }

    pub fn mark_valid(&self, name: &str) -> Option<StationId> {
        self.registry.mark_valid(name)
    }

    /// Flush the cache, close idle store handles and persist the registry
    pub async fn flush(&self, force_all: bool) -> FlushStats {
        let stats = self.cache.flush(force_all).await;
        let closed = self.stores.expire();
        if closed > 0 {
            debug!("Closed {} idle stores", closed);
        }
        if let Err(e) = self.registry.persist() {
            error!("Failed to persist station registry: {}", e);
        }
        if stats.written > 0 || stats.expired > 0 {
            info!(
                "Flushed {} of {} cached cells to {} stores, {} expired",
                stats.written, stats.total, stats.stores_touched, stats.expired
            );
        }
        self.state.lock().last_flush = Some(stats);
        stats
    }

    /// Roll every stale current bucket up, and apply retention when the day
    /// changed since the previous rollover. Safe to call at any time; the
    /// first call after a restart recovers buckets left by a crash.
    pub async fn rollover(&self) -> Result<RollupStats> {
        self.rollover_at(Utc::now()).await
    }

    async fn rollover_at(&self, now: DateTime<Utc>) -> Result<RollupStats> {
        let buckets = self.clock.buckets_at(now);
        let valid = Arc::new(
            self.registry
                .valid_ids(now.timestamp(), self.config.station_expiry_secs()),
        );

        self.cache.begin_retire(buckets.current);
        let stale = self.roll_stale(buckets.current, &valid).await;
        let released = match &stale {
            Ok(stale) => self.cache.finish_retire(&stale.rolled),
            Err(_) => self.cache.finish_retire(&HashSet::new()),
        };
        if released > 0 {
            debug!("Released {} late records into fresh current buckets", released);
        }
        let stale = stale?;
        let mut total = stale.outcome.into_stats()?;

        let previous = self.state.lock().last_rollover;
        if previous.is_some_and(|prev| !self.clock.has_rolled_over(&prev, &buckets)) {
            debug!("Rollover repeated within bucket {}", buckets.current);
        }
        if previous.is_none_or(|prev| prev.day != buckets.day) {
            total.absorb(&self.apply_retention(now, &stale.stations, &valid).await?);
        }

        let mut state = self.state.lock();
        state.last_rollover = Some(buckets);
        state.last_rollup = Some(total);
        drop(state);

        info!(
            "Rollover at bucket {}: {} source cells, {} updated, {} new, {} stations removed, {} emptied",
            buckets.current,
            total.source,
            total.updated,
            total.missing,
            total.stations_removed,
            total.emptied
        );
        Ok(total)
    }

    // Flushes the cache and rolls up every current bucket below `active`.
    // Stations whose stale records could not be written are left for the
    // next rollover.
    async fn roll_stale(
        &self,
        active: u32,
        valid: &Arc<HashSet<StationId>>,
    ) -> Result<StaleRollup> {
        self.flush(true).await;
        let held = self.cache.stale_dirty_stations(active);

        let stores = Arc::clone(&self.stores);
        let stations = tokio::task::spawn_blocking(move || stores.known_stations()).await??;

        let mut jobs = Vec::new();
        for &station in &stations {
            if held.contains(&station) {
                warn!("Station {} has unwritten stale records, rollup postponed", station);
                continue;
            }
            jobs.push(RollupJob::Stale {
                station,
                active,
                valid: Arc::clone(valid),
            });
        }
        let outcome = self.run_jobs(jobs).await?;

        let rolled = stations
            .iter()
            .copied()
            .filter(|station| !held.contains(station) && !outcome.failed.contains(station))
            .collect();
        Ok(StaleRollup {
            stations,
            rolled,
            outcome,
        })
    }

    async fn apply_retention(
        &self,
        now: DateTime<Utc>,
        stations: &[StationId],
        valid: &Arc<HashSet<StationId>>,
    ) -> Result<RollupStats> {
        let (day_cutoff, month_cutoff) =
            retention_cutoffs(now, self.config.retain_days, self.config.retain_months);
        let mut jobs = Vec::new();
        for &station in stations {
            jobs.push(RollupJob::Retire {
                station,
                kind: AccumulatorKind::Day,
                before: day_cutoff,
            });
            jobs.push(RollupJob::Retire {
                station,
                kind: AccumulatorKind::Month,
                before: month_cutoff,
            });
        }
        self.run_jobs(jobs).await?.into_stats()?;

        // retained global buckets forget stations that became invalid
        let stores = Arc::clone(&self.stores);
        let retained = tokio::task::spawn_blocking(move || -> Result<Vec<(AccumulatorKind, u32)>> {
            let global = stores.get(GLOBAL_STATION)?;
            let mut retained = Vec::new();
            for kind in [AccumulatorKind::Day, AccumulatorKind::Month, AccumulatorKind::Year] {
                retained.extend(global.buckets(kind)?.into_iter().map(|bucket| (kind, bucket)));
            }
            Ok(retained)
        })
        .await??;

        let purges = retained
            .into_iter()
            .map(|(kind, bucket)| RollupJob::Purge {
                station: GLOBAL_STATION,
                kind,
                bucket,
                valid: Arc::clone(valid),
            })
            .collect();
        self.run_jobs(purges).await?.into_stats()
    }

    // Runs jobs on the rollup pool; per-store failures are logged and skipped
    async fn run_jobs(&self, jobs: Vec<RollupJob>) -> Result<JobOutcome> {
        let mut set = JoinSet::new();
        for job in jobs {
            let rollups = Arc::clone(&self.rollups);
            set.spawn(async move {
                let station = job.station();
                (station, rollups.submit(job).await)
            });
        }

        let mut outcome = JobOutcome::default();
        while let Some(joined) = set.join_next().await {
            let (station, result) = joined?;
            match result {
                Ok(stats) => outcome.stats.absorb(&stats),
                Err(Error::Cancelled | Error::WorkerGone) => {
                    outcome.cancelled = true;
                    outcome.failed.insert(station);
                }
                Err(e) => {
                    warn!("Rollup for station {} skipped this cycle: {}", station, e);
                    outcome.failed.insert(station);
                }
            }
        }
        Ok(outcome)
    }

    /// Decoded rows of one bucket in `owner`'s store
    pub async fn rows(
        &self,
        owner: StationId,
        kind: AccumulatorKind,
        bucket: u32,
    ) -> Result<Vec<CellRow>> {
        let stores = Arc::clone(&self.stores);
        tokio::task::spawn_blocking(move || stores.get(owner)?.rows(kind, bucket)).await?
    }

    /// Overwrite cells of one bucket from exported rows
    pub async fn rebuild(
        &self,
        owner: StationId,
        kind: AccumulatorKind,
        bucket: u32,
        rows: Vec<CellRow>,
    ) -> Result<usize> {
        let lock_key = CellKey::meta(owner, kind, bucket).lock_key();
        let _guard = self.locks.lock(&lock_key).await;
        let stores = Arc::clone(&self.stores);
        tokio::task::spawn_blocking(move || {
            stores.get(owner)?.rebuild_from_rows(kind, bucket, &rows)
        })
        .await?
    }

    pub fn stations(&self) -> Vec<StationInfo> {
        self.registry.all()
    }

    pub fn status(&self) -> serde_json::Value {
        let state = self.state.lock();
        json!({
            "buckets": self.clock.current(),
            "cache": {
                "entries": self.cache.len(),
                "dirty": self.cache.dirty_count(),
                "held_back": self.cache.held_back(),
            },
            "open_stores": self.stores.open_count(),
            "bucket_locks": self.locks.len(),
            "observations": {
                "accepted": state.accepted,
                "rejected": state.rejected,
            },
            "last_flush": state.last_flush,
            "last_rollover": state.last_rollover,
            "last_rollup": state.last_rollup,
            "rollups": {
                "active": self.rollups.phases(),
                "last": self.rollups.last_stats(),
            },
        })
    }

    /// Write everything out and close the stores. The cancellation token
    /// handed to [`Engine::open`] must already be cancelled.
    pub async fn shutdown(&self) {
        let settled = self.cache.settle_late().await;
        if settled > 0 {
            info!("Merged {} held back records before the final flush", settled);
        }
        let stats = self.cache.flush(true).await;
        info!("Final flush wrote {} cells", stats.written);

        let rollups = Arc::clone(&self.rollups);
        if let Err(e) = tokio::task::spawn_blocking(move || rollups.shutdown()).await {
            error!("Failed to stop rollup workers: {}", e);
        }

        self.stores.close_all();
        if let Err(e) = self.registry.persist() {
            error!("Failed to persist station registry: {}", e);
        }
        info!("Engine stopped");
    }
}
