//! Protobuf decoding for GTFS Realtime feeds.
//!
//! [`parse_feed`] yields the raw wire message; [`decode`] lowers it into the
//! presence-aware [`FeedSnapshot`] the mergers consume.

use chrono::{DateTime, Utc};
use prost::Message;
use tracing::{debug, warn};

use crate::error::MalformedFeedError;
use crate::gtfs_rt::{self, FeedMessage};
use crate::snapshot::{
    Coordinates, Entity, FeedSnapshot, StopTimeEvent, TripUpdate, VehiclePosition,
};

/// Decodes a protobuf-encoded GTFS-RT [`FeedMessage`] from raw bytes.
///
/// # Errors
///
/// Returns an error if the bytes are not valid protobuf for a `FeedMessage`.
pub fn parse_feed(bytes: &[u8]) -> Result<FeedMessage, MalformedFeedError> {
    Ok(FeedMessage::decode(bytes)?)
}

/// Decodes one poll's payload into a [`FeedSnapshot`].
///
/// A well-formed feed with no trip updates or vehicles is not an error; it
/// produces a snapshot whose entities are all [`Entity::Other`], or none.
#[tracing::instrument(skip(bytes), fields(bytes = bytes.len()))]
pub fn decode(bytes: &[u8]) -> Result<FeedSnapshot, MalformedFeedError> {
    let feed = parse_feed(bytes)?;
    let snapshot = lower_feed(feed);
    debug!(entities = snapshot.entities.len(), "Feed decoded");
    Ok(snapshot)
}

fn lower_feed(feed: FeedMessage) -> FeedSnapshot {
    let feed_timestamp = feed
        .header
        .timestamp
        .and_then(|t| instant_from_unsigned(t, "header.timestamp"));

    let feed_entities = feed.entity.len();
    let mut entities = Vec::with_capacity(feed_entities);
    for entity in feed.entity {
        let mut merged = false;

        // An entity may carry both payloads; keep both, trip update first.
        if let Some(tu) = entity.trip_update {
            entities.push(Entity::TripUpdate(lower_trip_update(&entity.id, tu)));
            merged = true;
        }
        if let Some(vp) = entity.vehicle {
            entities.push(Entity::VehiclePosition(lower_vehicle(&entity.id, vp)));
            merged = true;
        }
        if !merged {
            entities.push(Entity::Other {
                entity_id: entity.id,
            });
        }
    }

    FeedSnapshot {
        feed_timestamp,
        feed_entities,
        entities,
    }
}

fn lower_trip_update(entity_id: &str, tu: gtfs_rt::TripUpdate) -> TripUpdate {
    let stop_time_events = tu
        .stop_time_update
        .into_iter()
        .map(|stu| StopTimeEvent {
            stop_id: non_empty(stu.stop_id),
            arrival: stu
                .arrival
                .and_then(|e| e.time)
                .and_then(|t| instant_from_signed(t, "arrival.time")),
            departure: stu
                .departure
                .and_then(|e| e.time)
                .and_then(|t| instant_from_signed(t, "departure.time")),
            stop_sequence: stu.stop_sequence,
        })
        .collect();

    TripUpdate {
        entity_id: entity_id.to_string(),
        trip_id: non_empty(tu.trip.trip_id),
        stop_time_events,
    }
}

fn lower_vehicle(entity_id: &str, vp: gtfs_rt::VehiclePosition) -> VehiclePosition {
    VehiclePosition {
        entity_id: entity_id.to_string(),
        vehicle_id: non_empty(vp.vehicle.and_then(|v| v.id)),
        trip_id: non_empty(vp.trip.and_then(|t| t.trip_id)),
        stop_id: non_empty(vp.stop_id),
        position: vp.position.map(|p| Coordinates {
            latitude: f64::from(p.latitude),
            longitude: f64::from(p.longitude),
        }),
        reported_at: vp
            .timestamp
            .and_then(|t| instant_from_unsigned(t, "vehicle.timestamp")),
    }
}

/// Identifiers are keys; an empty one identifies nothing.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn instant_from_signed(secs: i64, field: &'static str) -> Option<DateTime<Utc>> {
    let instant = DateTime::from_timestamp(secs, 0);
    if instant.is_none() {
        warn!(field, secs, "Timestamp out of range, treating as absent");
    }
    instant
}

fn instant_from_unsigned(secs: u64, field: &'static str) -> Option<DateTime<Utc>> {
    match i64::try_from(secs) {
        Ok(secs) => instant_from_signed(secs, field),
        Err(_) => {
            warn!(field, secs, "Timestamp out of range, treating as absent");
            None
        }
    }
}
