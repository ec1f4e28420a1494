//! One poll, end to end: decode, then merge both streams concurrently.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::IngestConfig;
use crate::error::IngestError;
use crate::merge::{merge_stop_updates, merge_vehicle_positions};
use crate::parser::decode;
use crate::sink::UpsertSink;
use crate::snapshot::FeedSnapshot;
use crate::stats::PollSummary;

/// Decodes `bytes` and merges the result into `sink`.
///
/// # Errors
///
/// [`IngestError::MalformedFeed`] if the payload does not decode (nothing is
/// written), or [`IngestError::SinkUnavailable`] if the sink goes away. Rows
/// the sink refuses one by one are counted in the summary instead.
pub async fn ingest_bytes<S: UpsertSink + ?Sized>(
    bytes: &[u8],
    sink: &S,
    config: &IngestConfig,
) -> Result<PollSummary, IngestError> {
    let snapshot = decode(bytes)?;
    ingest_snapshot(&snapshot, sink, config, Utc::now()).await
}

/// Merges an already decoded snapshot, stamping every write with `ingested_at`.
///
/// Both mergers always run to completion; if either fails its error is
/// returned, and whatever the other merger wrote stays written and is logged.
#[tracing::instrument(skip_all, fields(entities = snapshot.entities.len(), %ingested_at))]
pub async fn ingest_snapshot<S: UpsertSink + ?Sized>(
    snapshot: &FeedSnapshot,
    sink: &S,
    config: &IngestConfig,
    ingested_at: DateTime<Utc>,
) -> Result<PollSummary, IngestError> {
    let (stops, vehicles) = tokio::join!(
        merge_stop_updates(snapshot, sink, config, ingested_at),
        merge_vehicle_positions(snapshot, sink, config, ingested_at),
    );
    let (stops, vehicles) = match (stops, vehicles) {
        (Ok(stops), Ok(vehicles)) => (stops, vehicles),
        (Err(err), Ok(vehicles)) => {
            warn!(
                vehicle_applied = vehicles.applied(),
                vehicle_sink_failed = vehicles.sink_failed,
                "Vehicle positions merged before the poll failed"
            );
            return Err(err);
        }
        (Ok(stops), Err(err)) => {
            warn!(
                stop_applied = stops.applied(),
                stop_sink_failed = stops.sink_failed,
                "Stop updates merged before the poll failed"
            );
            return Err(err);
        }
        (Err(err), Err(other)) => {
            warn!(error = %other, "Both streams failed");
            return Err(err);
        }
    };

    let summary = PollSummary::new(ingested_at, snapshot, &stops, &vehicles);
    info!(
        stop_inserted = stops.inserted,
        stop_updated = stops.updated,
        stop_rejected = stops.rejected,
        trips_skipped = stops.skipped_trips,
        stop_sink_failed = stops.sink_failed,
        vehicle_inserted = vehicles.inserted,
        vehicle_updated = vehicles.updated,
        vehicle_rejected = vehicles.rejected,
        vehicle_stale = vehicles.stale,
        vehicle_sink_failed = vehicles.sink_failed,
        "Poll merged"
    );

    Ok(summary)
}
