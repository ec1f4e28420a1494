//! Storage boundary for merged realtime state.
//!
//! [`UpsertSink`] is the only thing the mergers know about storage. Each call
//! must be atomic per key: two callers racing on the same key leave one of
//! their full field sets behind, never a mix of both.

mod memory;
mod postgres;

pub use memory::MemorySink;
pub use postgres::PostgresSink;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::VehicleFreshness;
use crate::error::SinkError;
use crate::snapshot::Coordinates;

/// Identity of a stop-time prediction. `arrival_time: None` is a key value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StopUpdateKey {
    pub trip_id: String,
    pub stop_id: String,
    pub arrival_time: Option<DateTime<Utc>>,
}

/// Mutable columns of a stop-time prediction, overwritten on every upsert.
#[derive(Debug, Clone, PartialEq)]
pub struct StopUpdateFields {
    pub departure_time: Option<DateTime<Utc>>,
    pub stop_sequence: Option<u32>,
    pub ingested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopUpdateRecord {
    pub trip_id: String,
    pub stop_id: String,
    pub arrival_time: Option<DateTime<Utc>>,
    pub departure_time: Option<DateTime<Utc>>,
    pub stop_sequence: Option<u32>,
    pub ingested_at: DateTime<Utc>,
}

impl StopUpdateRecord {
    pub fn new(key: &StopUpdateKey, fields: &StopUpdateFields) -> Self {
        Self {
            trip_id: key.trip_id.clone(),
            stop_id: key.stop_id.clone(),
            arrival_time: key.arrival_time,
            departure_time: fields.departure_time,
            stop_sequence: fields.stop_sequence,
            ingested_at: fields.ingested_at,
        }
    }
}

/// Full replacement state for one vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct VehicleFields {
    pub trip_id: Option<String>,
    pub stop_id: Option<String>,
    pub position: Option<Coordinates>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VehicleRecord {
    pub vehicle_id: String,
    pub trip_id: Option<String>,
    pub stop_id: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl VehicleRecord {
    pub fn new(vehicle_id: &str, fields: &VehicleFields) -> Self {
        Self {
            vehicle_id: vehicle_id.to_string(),
            trip_id: fields.trip_id.clone(),
            stop_id: fields.stop_id.clone(),
            latitude: fields.position.map(|p| p.latitude),
            longitude: fields.position.map(|p| p.longitude),
            timestamp: fields.timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The stored record was newer and was left untouched.
    Stale,
}

#[async_trait]
pub trait UpsertSink: Send + Sync {
    async fn upsert_stop_update(
        &self,
        key: &StopUpdateKey,
        fields: &StopUpdateFields,
    ) -> Result<UpsertOutcome, SinkError>;

    async fn upsert_vehicle(
        &self,
        vehicle_id: &str,
        fields: &VehicleFields,
        freshness: VehicleFreshness,
    ) -> Result<UpsertOutcome, SinkError>;
}
