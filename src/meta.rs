//! Accumulator metadata rows
//!
//!  The first key of every (kind, bucket, station) group holds a small JSON
//!  document describing the group: when it was first and last written, how
//!  often it was flushed, and rollup bookkeeping.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::key::{AccumulatorKind, CellId};
use crate::rollup::RollupStats;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccumulatorMeta {
    pub kind: AccumulatorKind,
    pub bucket: u32,
    /// Unix seconds of the first write into the group
    pub start: i64,
    /// Unix seconds of the most recent write
    pub end: i64,
    #[serde(default)]
    pub flushes: u64,
    #[serde(default)]
    pub cells_written: u64,
    /// Progress of rolling this group up into its targets
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rollups: Vec<RollupProgress>,
    /// Counters of the last rollup that wrote into this group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_rollup: Option<RollupStats>,
}

/// How far a source group has been merged into one target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollupProgress {
    pub target: AccumulatorKind,
    pub bucket: u32,
    /// Last cell committed to the target
    pub cursor: Option<CellId>,
    pub complete: bool,
}

impl AccumulatorMeta {
    pub fn new(kind: AccumulatorKind, bucket: u32, now: i64) -> Self {
        Self {
            kind,
            bucket,
            start: now,
            end: now,
            flushes: 0,
            cells_written: 0,
            rollups: Vec::new(),
            last_rollup: None,
        }
    }

    /// Record a write of `cells` cells at `now`
    pub fn touch(&mut self, now: i64, cells: usize) {
        self.start = self.start.min(now);
        self.end = self.end.max(now);
        self.flushes += 1;
        self.cells_written += cells as u64;
    }

    pub fn progress(&self, target: AccumulatorKind, bucket: u32) -> Option<&RollupProgress> {
        self.rollups
            .iter()
            .find(|p| p.target == target && p.bucket == bucket)
    }

    pub fn set_progress(
        &mut self,
        target: AccumulatorKind,
        bucket: u32,
        cursor: Option<CellId>,
        complete: bool,
    ) {
        match self
            .rollups
            .iter_mut()
            .find(|p| p.target == target && p.bucket == bucket)
        {
            Some(progress) => {
                progress.cursor = cursor;
                progress.complete = complete;
            }
            None => self.rollups.push(RollupProgress {
                target,
                bucket,
                cursor,
                complete,
            }),
        }
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_json(raw: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(raw)?)
    }
}
