//! Conflict-resolving merge of a decoded poll into a [`UpsertSink`].
//!
//! The stop-update and vehicle mergers are independent: both read the same
//! snapshot and neither looks at the other's output. Within a merger, events
//! are applied strictly in feed order so duplicate keys resolve to the last
//! occurrence.
//!
//! [`UpsertSink`]: crate::sink::UpsertSink

mod stop_updates;
mod vehicles;

pub use stop_updates::merge_stop_updates;
pub use vehicles::merge_vehicle_positions;

use serde::Serialize;

use crate::sink::UpsertOutcome;

/// Per-merger counters for one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeResult {
    pub inserted: usize,
    pub updated: usize,
    /// Events missing a key field.
    pub rejected: usize,
    /// Trip updates without a trip_id. Always zero for vehicles.
    pub skipped_trips: usize,
    /// Vehicle upserts refused by a monotonic freshness check.
    pub stale: usize,
    /// Upserts the sink refused for that record alone.
    pub sink_failed: usize,
}

impl MergeResult {
    pub fn applied(&self) -> usize {
        self.inserted + self.updated
    }

    fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Stale => self.stale += 1,
        }
    }
}
