//! Retention policy for the change log
//!
//! Retention is measured in *activity time*, not calendar time. Walking the
//! log from the newest record back, the gap to the previous (newer) record is
//! counted in full when it is shorter than the activity interval and as a
//! single unit otherwise, so a weekend away from the project costs one unit
//! instead of two days. Once the accumulated time reaches the retention
//! period, the record where that happened and everything older is obsolete.

use crate::error::Result;
use crate::log_storage::RecordId;
use std::time::Duration;
use tracing::trace;

/// Whole milliseconds, saturating at `u64::MAX`
fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// How much history to keep
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PurgePolicy {
    period: u64,
    interval: u64,
}

impl PurgePolicy {
    /// Keep `period` of activity time; gaps of at least `interval` count as
    /// one millisecond
    pub fn new(period: Duration, interval: Duration) -> Self {
        Self::from_millis(millis(period), millis(interval))
    }

    /// Same as [`new`](Self::new) with millisecond arguments
    pub fn from_millis(period: u64, interval: u64) -> Self {
        Self { period, interval }
    }

    /// Retention period in milliseconds of activity time
    pub fn period(&self) -> u64 {
        self.period
    }

    /// Gap length from which a gap counts as idle
    pub fn interval(&self) -> u64 {
        self.interval
    }

    /// Find the newest obsolete record
    ///
    /// `records` yields `(id, timestamp)` pairs newest first. Returns `None`
    /// when everything is still within the retention period.
    pub fn find_boundary<I>(&self, records: I) -> Result<Option<RecordId>>
    where
        I: IntoIterator<Item = Result<(RecordId, u64)>>,
    {
        let mut elapsed = 0u64;
        let mut newer: Option<u64> = None;

        for record in records {
            let (id, timestamp) = record?;
            let delta = newer.map_or(0, |n| n.saturating_sub(timestamp));
            elapsed += if delta < self.interval { delta } else { 1 };
            newer = Some(timestamp);
            trace!("Record {} at {}: {}ms of activity", id, timestamp, elapsed);

            if elapsed >= self.period {
                return Ok(Some(id));
            }
        }
        Ok(None)
    }
}
