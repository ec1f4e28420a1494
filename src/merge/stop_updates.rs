use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::MergeResult;
use crate::config::{IngestConfig, NullArrivalPolicy};
use crate::error::{IngestError, InvalidEventError, SkippedTripError};
use crate::sink::{StopUpdateFields, StopUpdateKey, UpsertSink};
use crate::snapshot::{FeedSnapshot, StopTimeEvent};

/// Upserts every stop-time event of every trip update, keyed on
/// `(trip_id, stop_id, arrival_time)`.
///
/// Departure, stop sequence and ingestion instant are overwritten on every
/// hit. Events without a stop_id, trips without a trip_id and rows the sink
/// refuses are counted and skipped; only an unavailable sink ends the merge
/// early.
#[tracing::instrument(skip_all, fields(entities = snapshot.entities.len()))]
pub async fn merge_stop_updates<S: UpsertSink + ?Sized>(
    snapshot: &FeedSnapshot,
    sink: &S,
    config: &IngestConfig,
    ingested_at: DateTime<Utc>,
) -> Result<MergeResult, IngestError> {
    let mut result = MergeResult::default();

    for trip_update in snapshot.trip_updates() {
        let Some(trip_id) = trip_update.trip_id.as_deref() else {
            let err = SkippedTripError {
                entity_id: trip_update.entity_id.clone(),
                event_count: trip_update.stop_time_events.len(),
            };
            warn!(error = %err, "Skipping trip update");
            result.skipped_trips += 1;
            continue;
        };

        for (index, event) in trip_update.stop_time_events.iter().enumerate() {
            let key = match stop_update_key(trip_id, index, event, config.null_arrival) {
                Ok(key) => key,
                Err(err) => {
                    warn!(error = %err, "Rejecting stop time event");
                    result.rejected += 1;
                    continue;
                }
            };

            let fields = StopUpdateFields {
                departure_time: event.departure,
                stop_sequence: event.stop_sequence,
                ingested_at,
            };

            let outcome = match sink.upsert_stop_update(&key, &fields).await {
                Ok(outcome) => outcome,
                Err(err) if err.is_transient() => {
                    return Err(IngestError::SinkUnavailable {
                        stream: "stop updates",
                        source: err,
                    });
                }
                Err(err) => {
                    warn!(
                        trip_id,
                        stop_id = %key.stop_id,
                        error = %err,
                        "Sink refused stop time event"
                    );
                    result.sink_failed += 1;
                    continue;
                }
            };

            debug!(trip_id, stop_id = %key.stop_id, ?outcome, "Stop time event merged");
            result.record(outcome);
        }
    }

    Ok(result)
}

fn stop_update_key(
    trip_id: &str,
    index: usize,
    event: &StopTimeEvent,
    null_arrival: NullArrivalPolicy,
) -> Result<StopUpdateKey, InvalidEventError> {
    let Some(stop_id) = event.stop_id.as_deref() else {
        return Err(InvalidEventError::MissingStopId {
            trip_id: trip_id.to_string(),
            index,
        });
    };

    if event.arrival.is_none() && null_arrival == NullArrivalPolicy::Reject {
        return Err(InvalidEventError::MissingArrival {
            trip_id: trip_id.to_string(),
            stop_id: stop_id.to_string(),
        });
    }

    Ok(StopUpdateKey {
        trip_id: trip_id.to_string(),
        stop_id: stop_id.to_string(),
        arrival_time: event.arrival,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::test_support::{RejectingSink, UnavailableSink};
    use crate::sink::MemorySink;
    use crate::snapshot::{Entity, TripUpdate};

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    fn event(
        stop_id: Option<&str>,
        arrival: Option<i64>,
        departure: Option<i64>,
    ) -> StopTimeEvent {
        StopTimeEvent {
            stop_id: stop_id.map(str::to_string),
            arrival: arrival.map(at),
            departure: departure.map(at),
            stop_sequence: None,
        }
    }

    fn snapshot(trips: Vec<(Option<&str>, Vec<StopTimeEvent>)>) -> FeedSnapshot {
        FeedSnapshot {
            feed_timestamp: None,
            feed_entities: trips.len(),
            entities: trips
                .into_iter()
                .enumerate()
                .map(|(i, (trip_id, events))| {
                    Entity::TripUpdate(TripUpdate {
                        entity_id: i.to_string(),
                        trip_id: trip_id.map(str::to_string),
                        stop_time_events: events,
                    })
                })
                .collect(),
        }
    }

    fn key(trip_id: &str, stop_id: &str, arrival: Option<i64>) -> StopUpdateKey {
        StopUpdateKey {
            trip_id: trip_id.into(),
            stop_id: stop_id.into(),
            arrival_time: arrival.map(at),
        }
    }

    #[tokio::test]
    async fn test_single_event_inserts_one_record() {
        let sink = MemorySink::new();
        let snap = snapshot(vec![(
            Some("T1"),
            vec![event(Some("S1"), Some(100), Some(110))],
        )]);

        let result = merge_stop_updates(&snap, &sink, &IngestConfig::default(), at(1))
            .await
            .unwrap();

        assert_eq!(result.inserted, 1);
        let record = sink.stop_update(&key("T1", "S1", Some(100))).unwrap();
        assert_eq!(record.departure_time, Some(at(110)));
        assert_eq!(record.stop_sequence, None);
        assert_eq!(record.ingested_at, at(1));
    }

    #[tokio::test]
    async fn test_merging_twice_is_idempotent() {
        let sink = MemorySink::new();
        let snap = snapshot(vec![(
            Some("T1"),
            vec![event(Some("S1"), Some(100), Some(110))],
        )]);
        let config = IngestConfig::default();

        merge_stop_updates(&snap, &sink, &config, at(1)).await.unwrap();
        let second = merge_stop_updates(&snap, &sink, &config, at(2)).await.unwrap();

        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 1);
        assert_eq!(sink.stop_updates().len(), 1);
        assert_eq!(sink.stop_updates()[0].ingested_at, at(2));
    }

    #[tokio::test]
    async fn test_null_arrival_is_distinct_key() {
        let sink = MemorySink::new();
        let snap = snapshot(vec![(
            Some("T1"),
            vec![
                event(Some("S1"), None, Some(110)),
                event(Some("S1"), Some(100), Some(110)),
            ],
        )]);

        let result = merge_stop_updates(&snap, &sink, &IngestConfig::default(), at(1))
            .await
            .unwrap();

        assert_eq!(result.inserted, 2);
        assert!(sink.stop_update(&key("T1", "S1", None)).is_some());
        assert!(sink.stop_update(&key("T1", "S1", Some(100))).is_some());
    }

    #[tokio::test]
    async fn test_reject_policy_drops_null_arrivals() {
        let sink = MemorySink::new();
        let snap = snapshot(vec![(
            Some("T1"),
            vec![
                event(Some("S1"), None, Some(110)),
                event(Some("S1"), Some(100), Some(110)),
            ],
        )]);
        let config = IngestConfig::default().with_null_arrival(NullArrivalPolicy::Reject);

        let result = merge_stop_updates(&snap, &sink, &config, at(1)).await.unwrap();

        assert_eq!(result.inserted, 1);
        assert_eq!(result.rejected, 1);
        assert!(sink.stop_update(&key("T1", "S1", None)).is_none());
    }

    #[tokio::test]
    async fn test_missing_trip_id_skips_whole_trip() {
        let sink = MemorySink::new();
        let snap = snapshot(vec![(
            None,
            vec![
                event(Some("S1"), Some(100), None),
                event(Some("S2"), Some(200), None),
            ],
        )]);

        let result = merge_stop_updates(&snap, &sink, &IngestConfig::default(), at(1))
            .await
            .unwrap();

        assert_eq!(result.skipped_trips, 1);
        assert_eq!(result.rejected, 0);
        assert_eq!(result.applied(), 0);
        assert!(sink.stop_updates().is_empty());
    }

    #[tokio::test]
    async fn test_missing_stop_id_rejects_only_that_event() {
        let sink = MemorySink::new();
        let snap = snapshot(vec![(
            Some("T1"),
            vec![
                event(None, Some(90), None),
                event(Some("S1"), Some(100), Some(110)),
            ],
        )]);

        let result = merge_stop_updates(&snap, &sink, &IngestConfig::default(), at(1))
            .await
            .unwrap();

        assert_eq!(result.inserted, 1);
        assert_eq!(result.rejected, 1);
        assert_eq!(sink.stop_updates().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_key_last_in_feed_order_wins() {
        let sink = MemorySink::new();
        let mut first = event(Some("S1"), Some(100), Some(110));
        first.stop_sequence = Some(1);
        let mut second = event(Some("S1"), Some(100), Some(150));
        second.stop_sequence = Some(2);
        let snap = snapshot(vec![(Some("T1"), vec![first]), (Some("T1"), vec![second])]);

        let result = merge_stop_updates(&snap, &sink, &IngestConfig::default(), at(1))
            .await
            .unwrap();

        assert_eq!((result.inserted, result.updated), (1, 1));
        let record = sink.stop_update(&key("T1", "S1", Some(100))).unwrap();
        assert_eq!(record.departure_time, Some(at(150)));
        assert_eq!(record.stop_sequence, Some(2));
    }

    #[tokio::test]
    async fn test_update_clears_fields_absent_in_new_poll() {
        let sink = MemorySink::new();
        let config = IngestConfig::default();

        let mut with_sequence = event(Some("S1"), Some(100), Some(110));
        with_sequence.stop_sequence = Some(7);
        merge_stop_updates(
            &snapshot(vec![(Some("T1"), vec![with_sequence])]),
            &sink,
            &config,
            at(1),
        )
        .await
        .unwrap();
        merge_stop_updates(
            &snapshot(vec![(Some("T1"), vec![event(Some("S1"), Some(100), None)])]),
            &sink,
            &config,
            at(2),
        )
        .await
        .unwrap();

        let record = sink.stop_update(&key("T1", "S1", Some(100))).unwrap();
        assert_eq!(record.departure_time, None);
        assert_eq!(record.stop_sequence, None);
    }

    #[tokio::test]
    async fn test_empty_snapshot_reports_zero() {
        let sink = MemorySink::new();

        let result = merge_stop_updates(
            &FeedSnapshot::default(),
            &sink,
            &IngestConfig::default(),
            at(1),
        )
        .await
        .unwrap();

        assert_eq!(result, MergeResult::default());
    }

    #[tokio::test]
    async fn test_refused_event_does_not_stop_the_trip() {
        let sink = RejectingSink::default();
        let snap = snapshot(vec![(
            Some("T1"),
            vec![
                event(Some("S1"), Some(100), None),
                event(Some("BAD"), Some(200), None),
                event(Some("S3"), Some(300), None),
            ],
        )]);

        let result = merge_stop_updates(&snap, &sink, &IngestConfig::default(), at(1))
            .await
            .unwrap();

        assert_eq!(result.inserted, 2);
        assert_eq!(result.sink_failed, 1);
        assert_eq!(result.rejected, 0);
        assert!(sink.inner.stop_update(&key("T1", "S3", Some(300))).is_some());
        assert!(sink.inner.stop_update(&key("T1", "BAD", Some(200))).is_none());
    }

    #[tokio::test]
    async fn test_sink_failure_aborts_merge() {
        let snap = snapshot(vec![(
            Some("T1"),
            vec![event(Some("S1"), Some(100), Some(110))],
        )]);

        let err = merge_stop_updates(&snap, &UnavailableSink, &IngestConfig::default(), at(1))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            IngestError::SinkUnavailable {
                stream: "stop updates",
                ..
            }
        ));
    }
}
