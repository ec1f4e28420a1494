use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::MergeResult;
use crate::config::IngestConfig;
use crate::error::{IngestError, InvalidEventError};
use crate::sink::{UpsertSink, VehicleFields};
use crate::snapshot::FeedSnapshot;

/// Upserts every vehicle position keyed on vehicle_id, replacing all fields.
///
/// A vehicle without a report instant is stamped with `ingested_at`. A row
/// the sink refuses is counted in `sink_failed` and the merge moves on.
#[tracing::instrument(skip_all, fields(entities = snapshot.entities.len()))]
pub async fn merge_vehicle_positions<S: UpsertSink + ?Sized>(
    snapshot: &FeedSnapshot,
    sink: &S,
    config: &IngestConfig,
    ingested_at: DateTime<Utc>,
) -> Result<MergeResult, IngestError> {
    let mut result = MergeResult::default();

    for vehicle in snapshot.vehicle_positions() {
        let Some(vehicle_id) = vehicle.vehicle_id.as_deref() else {
            let err = InvalidEventError::MissingVehicleId {
                entity_id: vehicle.entity_id.clone(),
            };
            warn!(error = %err, "Rejecting vehicle position");
            result.rejected += 1;
            continue;
        };

        let fields = VehicleFields {
            trip_id: vehicle.trip_id.clone(),
            stop_id: vehicle.stop_id.clone(),
            position: vehicle.position,
            timestamp: vehicle.reported_at.unwrap_or(ingested_at),
        };

        let outcome = match sink
            .upsert_vehicle(vehicle_id, &fields, config.vehicle_freshness)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) if err.is_transient() => {
                return Err(IngestError::SinkUnavailable {
                    stream: "vehicle positions",
                    source: err,
                });
            }
            Err(err) => {
                warn!(vehicle_id, error = %err, "Sink refused vehicle position");
                result.sink_failed += 1;
                continue;
            }
        };

        debug!(vehicle_id, ?outcome, "Vehicle position merged");
        result.record(outcome);
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VehicleFreshness;
    use crate::merge::test_support::{RejectingSink, UnavailableSink};
    use crate::sink::MemorySink;
    use crate::snapshot::{Coordinates, Entity, VehiclePosition};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn position(
        vehicle_id: Option<&str>,
        trip_id: &str,
        reported_at: Option<i64>,
    ) -> VehiclePosition {
        VehiclePosition {
            entity_id: format!("e-{trip_id}"),
            vehicle_id: vehicle_id.map(str::to_string),
            trip_id: Some(trip_id.to_string()),
            stop_id: Some("S1".to_string()),
            position: Some(Coordinates {
                latitude: 40.75,
                longitude: -73.5,
            }),
            reported_at: reported_at.map(at),
        }
    }

    fn snapshot(vehicles: Vec<VehiclePosition>) -> FeedSnapshot {
        FeedSnapshot {
            feed_timestamp: None,
            feed_entities: vehicles.len(),
            entities: vehicles.into_iter().map(Entity::VehiclePosition).collect(),
        }
    }

    #[tokio::test]
    async fn test_second_merge_fully_replaces() {
        let sink = MemorySink::new();
        let config = IngestConfig::default();

        let first = snapshot(vec![position(Some("V1"), "T1", Some(100))]);
        merge_vehicle_positions(&first, &sink, &config, at(1))
            .await
            .unwrap();

        let mut second = position(Some("V1"), "T2", Some(200));
        second.stop_id = None;
        second.position = None;
        let result = merge_vehicle_positions(&snapshot(vec![second]), &sink, &config, at(2))
            .await
            .unwrap();

        assert_eq!(result.updated, 1);
        let vehicles = sink.vehicles();
        assert_eq!(vehicles.len(), 1);
        assert_eq!(vehicles[0].trip_id.as_deref(), Some("T2"));
        assert_eq!(vehicles[0].stop_id, None);
        assert_eq!(vehicles[0].latitude, None);
        assert_eq!(vehicles[0].longitude, None);
        assert_eq!(vehicles[0].timestamp, at(200));
    }

    #[tokio::test]
    async fn test_missing_report_instant_uses_ingestion_time() {
        let sink = MemorySink::new();

        merge_vehicle_positions(
            &snapshot(vec![position(Some("V1"), "T1", None)]),
            &sink,
            &IngestConfig::default(),
            at(42),
        )
        .await
        .unwrap();

        assert_eq!(sink.vehicle("V1").unwrap().timestamp, at(42));
    }

    #[tokio::test]
    async fn test_missing_vehicle_id_is_rejected() {
        let sink = MemorySink::new();
        let snap = snapshot(vec![
            position(None, "T1", Some(100)),
            position(Some("V2"), "T2", Some(100)),
        ]);

        let result = merge_vehicle_positions(&snap, &sink, &IngestConfig::default(), at(1))
            .await
            .unwrap();

        assert_eq!(result.rejected, 1);
        assert_eq!(result.inserted, 1);
        assert_eq!(sink.vehicles().len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_order_poll_overwrites_by_default() {
        let sink = MemorySink::new();
        let config = IngestConfig::default();

        let newer = snapshot(vec![position(Some("V1"), "T1", Some(200))]);
        let older = snapshot(vec![position(Some("V1"), "T0", Some(100))]);
        merge_vehicle_positions(&newer, &sink, &config, at(1))
            .await
            .unwrap();
        merge_vehicle_positions(&older, &sink, &config, at(2))
            .await
            .unwrap();

        assert_eq!(sink.vehicle("V1").unwrap().trip_id.as_deref(), Some("T0"));
    }

    #[tokio::test]
    async fn test_monotonic_freshness_counts_stale() {
        let sink = MemorySink::new();
        let config = IngestConfig::default().with_vehicle_freshness(VehicleFreshness::Monotonic);

        let newer = snapshot(vec![position(Some("V1"), "T1", Some(200))]);
        let older = snapshot(vec![position(Some("V1"), "T0", Some(100))]);
        merge_vehicle_positions(&newer, &sink, &config, at(1))
            .await
            .unwrap();
        let result = merge_vehicle_positions(&older, &sink, &config, at(2))
            .await
            .unwrap();

        assert_eq!(result.stale, 1);
        assert_eq!(result.applied(), 0);
        assert_eq!(sink.vehicle("V1").unwrap().trip_id.as_deref(), Some("T1"));
    }

    #[tokio::test]
    async fn test_refused_vehicle_does_not_stop_the_merge() {
        let sink = RejectingSink::default();
        let snap = snapshot(vec![
            position(Some("BAD"), "T1", Some(100)),
            position(Some("V2"), "T2", Some(100)),
        ]);

        let result = merge_vehicle_positions(&snap, &sink, &IngestConfig::default(), at(1))
            .await
            .unwrap();

        assert_eq!(result.sink_failed, 1);
        assert_eq!(result.inserted, 1);
        assert!(sink.inner.vehicle("V2").is_some());
    }

    #[tokio::test]
    async fn test_sink_failure_aborts_merge() {
        let err = merge_vehicle_positions(
            &snapshot(vec![position(Some("V1"), "T1", Some(100))]),
            &UnavailableSink,
            &IngestConfig::default(),
            at(1),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            IngestError::SinkUnavailable {
                stream: "vehicle positions",
                ..
            }
        ));
    }
}
