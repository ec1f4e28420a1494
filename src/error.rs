//! Error taxonomy for feed ingestion.
//!
//! Only [`MalformedFeedError`] and [`IngestError`] ever leave a poll. The
//! per-event errors are logged and counted by the mergers, then dropped.

use thiserror::Error;

/// The payload could not be decoded as a GTFS-RT `FeedMessage`.
#[derive(Debug, Error)]
#[error("malformed feed: {0}")]
pub struct MalformedFeedError(#[from] pub prost::DecodeError);

/// A single stop-time event or vehicle entity lacks the field its merge key needs.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidEventError {
    #[error("stop time event #{index} of trip {trip_id} has no stop_id")]
    MissingStopId { trip_id: String, index: usize },

    #[error("stop time event for trip {trip_id} at stop {stop_id} has no arrival time")]
    MissingArrival { trip_id: String, stop_id: String },

    #[error("vehicle position entity {entity_id} has no vehicle id")]
    MissingVehicleId { entity_id: String },
}

/// A trip update had no trip_id, so none of its stop-time events could be keyed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("trip update entity {entity_id} has no trip_id; skipped {event_count} stop time events")]
pub struct SkippedTripError {
    pub entity_id: String,
    pub event_count: usize,
}

/// Failure reported by a storage sink.
///
/// A sink retries transient failures itself before returning one of these.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The storage backend could not be reached (pool exhausted, connection lost).
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the write.
    #[error("storage rejected upsert: {0}")]
    Rejected(String),
}

impl SinkError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Unavailable(_))
    }
}

/// Poll-level failure.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error(transparent)]
    MalformedFeed(#[from] MalformedFeedError),

    #[error("sink unavailable while merging {stream}: {source}")]
    SinkUnavailable {
        stream: &'static str,
        #[source]
        source: SinkError,
    },
}
