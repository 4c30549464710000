//! Station registry
//!
//!  Maps station names to small numeric ids. Ids start at 1 and are never
//!  reused, so ids already written into global records keep their meaning.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use fjall::{Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::key::StationId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationInfo {
    pub id: StationId,
    pub name: String,
    /// Unix seconds
    pub first_seen: i64,
    pub last_seen: i64,
    /// Set when the station moved or was retired by an operator
    #[serde(default)]
    pub invalid: bool,
}

struct Registry {
    by_name: HashMap<String, StationInfo>,
    next_id: StationId,
    dirty: HashSet<String>,
}

pub struct StationRegistry {
    keyspace: Keyspace,
    stations: PartitionHandle,
    state: Mutex<Registry>,
}

impl StationRegistry {
    pub fn open(path: &Path) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let keyspace = fjall::Config::new(path).open()?;
        let stations = keyspace.open_partition("stations", PartitionCreateOptions::default())?;

        let mut by_name = HashMap::new();
        let mut next_id = 1;
        for item in stations.iter() {
            let (_, value) = item?;
            let info: StationInfo = serde_json::from_slice(&value)?;
            next_id = next_id.max(info.id + 1);
            by_name.insert(info.name.clone(), info);
        }
        info!("Loaded {} stations from registry", by_name.len());

        Ok(Self {
            keyspace,
            stations,
            state: Mutex::new(Registry {
                by_name,
                next_id,
                dirty: HashSet::new(),
            }),
        })
    }

    /// Id for `name`, assigning a new one on first sight. Refreshes `last_seen`.
    pub fn lookup_or_assign(&self, name: &str, now: i64) -> StationId {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if let Some(info) = state.by_name.get_mut(name) {
            info.last_seen = info.last_seen.max(now);
            let id = info.id;
            state.dirty.insert(name.to_string());
            return id;
        }

        let id = state.next_id;
        state.next_id += 1;
        state.by_name.insert(
            name.to_string(),
            StationInfo {
                id,
                name: name.to_string(),
                first_seen: now,
                last_seen: now,
                invalid: false,
            },
        );
        state.dirty.insert(name.to_string());
        debug!("Assigned id {} to station {}", id, name);
        id
    }

    fn set_invalid(&self, name: &str, invalid: bool) -> Option<StationId> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let info = state.by_name.get_mut(name)?;
        info.invalid = invalid;
        let id = info.id;
        state.dirty.insert(name.to_string());
        Some(id)
    }

    /// Flag a station so the next rollup or purge drops its contributions
    pub fn mark_invalid(&self, name: &str) -> Option<StationId> {
        self.set_invalid(name, true)
    }

    pub fn mark_valid(&self, name: &str) -> Option<StationId> {
        self.set_invalid(name, false)
    }

    /// Ids seen within `expiry_secs` of `now` and not flagged invalid
    pub fn valid_ids(&self, now: i64, expiry_secs: i64) -> HashSet<StationId> {
        self.state
            .lock()
            .by_name
            .values()
            .filter(|info| !info.invalid && now - info.last_seen <= expiry_secs)
            .map(|info| info.id)
            .collect()
    }

    /// All stations ordered by id
    pub fn all(&self) -> Vec<StationInfo> {
        let mut all: Vec<StationInfo> = self.state.lock().by_name.values().cloned().collect();
        all.sort_by_key(|info| info.id);
        all
    }

    /// Write changed entries and sync them to disk. Entries stay dirty
    /// until the write succeeds.
    pub fn persist(&self) -> Result<()> {
        let changed = self.dirty_entries();
        if changed.is_empty() {
            return Ok(());
        }

        let mut batch = self.keyspace.batch();
        for info in &changed {
            batch.insert(&self.stations, info.name.as_bytes(), serde_json::to_vec(info)?);
        }
        batch.commit()?;
        self.keyspace.persist(PersistMode::SyncAll)?;

        self.mark_persisted(&changed);
        debug!("Persisted {} registry entries", changed.len());
        Ok(())
    }

    fn dirty_entries(&self) -> Vec<StationInfo> {
        let state = self.state.lock();
        state
            .dirty
            .iter()
            .filter_map(|name| state.by_name.get(name).cloned())
            .collect()
    }

    // entries changed again since the snapshot stay dirty
    fn mark_persisted(&self, written: &[StationInfo]) {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        for info in written {
            if state.by_name.get(&info.name) == Some(info) {
                state.dirty.remove(&info.name);
            }
        }
    }
}
