//! Merge policies.
//!
//! Both policies default to the behaviour of the original loader. The
//! alternatives exist so the quirks can be corrected without changing the
//! sink contract.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// How a stop-time event without an arrival instant is keyed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum NullArrivalPolicy {
    /// A missing arrival is its own key value: it matches other missing
    /// arrivals for the same trip and stop, and no concrete arrival.
    #[default]
    Distinct,
    /// Events without an arrival are rejected as invalid.
    Reject,
}

/// Whether a vehicle upsert may move a record's timestamp backwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum VehicleFreshness {
    /// Every upsert fully replaces the stored vehicle.
    #[default]
    LastWriteWins,
    /// Replace only when the incoming report instant is not older than the stored one.
    Monotonic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestConfig {
    pub null_arrival: NullArrivalPolicy,
    pub vehicle_freshness: VehicleFreshness,
}

impl IngestConfig {
    pub fn with_null_arrival(mut self, policy: NullArrivalPolicy) -> Self {
        self.null_arrival = policy;
        self
    }

    pub fn with_vehicle_freshness(mut self, freshness: VehicleFreshness) -> Self {
        self.vehicle_freshness = freshness;
        self
    }
}
