use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::merge::MergeResult;
use crate::snapshot::FeedSnapshot;

/// Flat per-poll report, one CSV row per poll.
#[derive(Debug, Default, Clone, PartialEq, Serialize)]
pub struct PollSummary {
    pub timestamp: DateTime<Utc>,
    pub source: Option<String>,
    pub feed_timestamp: Option<DateTime<Utc>>,
    pub total_entities: usize,

    // entity types
    pub trip_updates: usize,
    pub vehicle_positions: usize,
    pub other_entities: usize,

    // stop updates
    pub stop_events_inserted: usize,
    pub stop_events_updated: usize,
    pub stop_events_rejected: usize,
    pub stop_events_failed: usize,
    pub trips_skipped: usize,

    // vehicles
    pub vehicles_inserted: usize,
    pub vehicles_updated: usize,
    pub vehicles_rejected: usize,
    pub vehicles_failed: usize,
    pub vehicles_stale: usize,
}

impl PollSummary {
    pub fn new(
        ingested_at: DateTime<Utc>,
        snapshot: &FeedSnapshot,
        stops: &MergeResult,
        vehicles: &MergeResult,
    ) -> Self {
        let mut s = Self::from_snapshot(snapshot);
        s.timestamp = ingested_at;

        s.stop_events_inserted = stops.inserted;
        s.stop_events_updated = stops.updated;
        s.stop_events_rejected = stops.rejected;
        s.stop_events_failed = stops.sink_failed;
        s.trips_skipped = stops.skipped_trips;

        s.vehicles_inserted = vehicles.inserted;
        s.vehicles_updated = vehicles.updated;
        s.vehicles_rejected = vehicles.rejected;
        s.vehicles_failed = vehicles.sink_failed;
        s.vehicles_stale = vehicles.stale;

        s
    }

    /// Entity counts only, for polls that are decoded but not merged.
    pub fn from_snapshot(snapshot: &FeedSnapshot) -> Self {
        PollSummary {
            timestamp: Utc::now(),
            feed_timestamp: snapshot.feed_timestamp,
            total_entities: snapshot.feed_entities,
            trip_updates: snapshot.trip_updates().count(),
            vehicle_positions: snapshot.vehicle_positions().count(),
            other_entities: snapshot.other_count(),
            ..Default::default()
        }
    }

    /// Set where the payload came from (URL or file path)
    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }

    /// Events dropped for a missing key field.
    pub fn rejected(&self) -> usize {
        self.stop_events_rejected + self.vehicles_rejected
    }

    /// Events with valid keys that the sink refused.
    pub fn failed(&self) -> usize {
        self.stop_events_failed + self.vehicles_failed
    }
}
