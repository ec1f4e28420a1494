//! Typed view of one decoded feed poll.
//!
//! Every optional field is an [`Option`], so "absent" is never confused with
//! a zero or an empty string. The mergers branch on presence only.

use chrono::{DateTime, Utc};

/// Immutable result of decoding one poll.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedSnapshot {
    /// Header timestamp declared by the feed producer, if any.
    pub feed_timestamp: Option<DateTime<Utc>>,
    /// Number of `FeedEntity` messages on the wire. Can be lower than
    /// `entities.len()`, since an entity carrying both a trip update and a
    /// vehicle is split in two.
    pub feed_entities: usize,
    /// Entities in feed order.
    pub entities: Vec<Entity>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    TripUpdate(TripUpdate),
    VehiclePosition(VehiclePosition),
    /// Alerts and any entity kind this crate does not merge.
    Other { entity_id: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct TripUpdate {
    pub entity_id: String,
    pub trip_id: Option<String>,
    pub stop_time_events: Vec<StopTimeEvent>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StopTimeEvent {
    pub stop_id: Option<String>,
    pub arrival: Option<DateTime<Utc>>,
    pub departure: Option<DateTime<Utc>>,
    pub stop_sequence: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Coordinates {
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VehiclePosition {
    pub entity_id: String,
    pub vehicle_id: Option<String>,
    pub trip_id: Option<String>,
    pub stop_id: Option<String>,
    pub position: Option<Coordinates>,
    pub reported_at: Option<DateTime<Utc>>,
}

impl FeedSnapshot {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn trip_updates(&self) -> impl Iterator<Item = &TripUpdate> {
        self.entities.iter().filter_map(|e| match e {
            Entity::TripUpdate(tu) => Some(tu),
            _ => None,
        })
    }

    pub fn vehicle_positions(&self) -> impl Iterator<Item = &VehiclePosition> {
        self.entities.iter().filter_map(|e| match e {
            Entity::VehiclePosition(vp) => Some(vp),
            _ => None,
        })
    }

    pub fn other_count(&self) -> usize {
        self.entities
            .iter()
            .filter(|e| matches!(e, Entity::Other { .. }))
            .count()
    }
}
