//! Accumulator bucket arithmetic
//!
//!  Bucket identity is a pure function of wall-clock time so that data written
//!  before a restart lands in the same buckets as data written after it.

use std::time::Duration;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::Serialize;

use crate::key::AccumulatorKind;

const SECS_PER_DAY: u32 = 24 * 60 * 60;

/// Active bucket of every accumulator kind at one instant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Buckets {
    pub current: u32,
    pub day: u32,
    pub month: u32,
    pub year: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct AccumulatorClock {
    period_secs: u32,
}

impl AccumulatorClock {
    /// `period` is the length of a current bucket. It is clamped to at least a
    /// second; callers validate that it divides a day.
    pub fn new(period: Duration) -> Self {
        Self {
            period_secs: (period.as_secs() as u32).clamp(1, SECS_PER_DAY),
        }
    }

    pub fn current(&self) -> Buckets {
        self.buckets_at(Utc::now())
    }

    pub fn buckets_at(&self, t: DateTime<Utc>) -> Buckets {
        let date = t.date_naive();
        Buckets {
            current: self.current_bucket_at(t),
            day: day_bucket(date),
            month: month_bucket(date),
            year: date.year().max(0) as u32,
        }
    }

    pub fn current_bucket_at(&self, t: DateTime<Utc>) -> u32 {
        (t.timestamp().max(0) as u64 / self.period_secs as u64) as u32
    }

    /// First instant covered by a current bucket
    pub fn bucket_start(&self, current: u32) -> DateTime<Utc> {
        let secs = current as i64 * self.period_secs as i64;
        DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Day, month and year buckets a current bucket rolls up into
    pub fn targets_for(&self, current: u32) -> [(AccumulatorKind, u32); 3] {
        let b = self.buckets_at(self.bucket_start(current));
        [
            (AccumulatorKind::Day, b.day),
            (AccumulatorKind::Month, b.month),
            (AccumulatorKind::Year, b.year),
        ]
    }

    pub fn has_rolled_over(&self, previous: &Buckets, now: &Buckets) -> bool {
        previous.current != now.current
    }

    /// Time until the next current-bucket boundary. Midnight UTC is always
    /// such a boundary because the period divides the day.
    pub fn until_next_boundary(&self, t: DateTime<Utc>) -> Duration {
        let period_ms = self.period_secs as i64 * 1000;
        let now_ms = t.timestamp_millis();
        let next = (now_ms.div_euclid(period_ms) + 1) * period_ms;
        Duration::from_millis((next - now_ms) as u64)
    }
}

/// `year * 1000 + ordinal day`, e.g. 2026290 for 17 October 2026
pub fn day_bucket(date: NaiveDate) -> u32 {
    date.year().max(0) as u32 * 1000 + date.ordinal()
}

pub fn month_bucket(date: NaiveDate) -> u32 {
    date.year().max(0) as u32 * 100 + date.month()
}

/// Oldest day and month buckets to keep when retaining `days` days and
/// `months` months back from `now`, both counting the current one.
pub fn retention_cutoffs(now: DateTime<Utc>, days: u32, months: u32) -> (u32, u32) {
    let today = now.date_naive();
    let first_day = today
        .checked_sub_days(chrono::Days::new(days.saturating_sub(1) as u64))
        .unwrap_or(NaiveDate::MIN);

    let month_index = today.year() as i64 * 12 + today.month0() as i64;
    let first_month = (month_index - months.saturating_sub(1) as i64).max(0);
    let month_cutoff = (first_month / 12) as u32 * 100 + (first_month % 12) as u32 + 1;

    (day_bucket(first_day), month_cutoff)
}
