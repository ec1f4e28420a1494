use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::{
    StopUpdateFields, StopUpdateKey, StopUpdateRecord, UpsertOutcome, UpsertSink, VehicleFields,
    VehicleRecord,
};
use crate::config::VehicleFreshness;
use crate::error::SinkError;

/// Process-local sink used for dry runs and tests.
///
/// Each upsert runs entirely under the table's lock, which gives the same
/// per-key atomicity as a single `INSERT ... ON CONFLICT` statement.
#[derive(Debug, Default)]
pub struct MemorySink {
    stop_updates: Mutex<HashMap<StopUpdateKey, StopUpdateRecord>>,
    vehicles: Mutex<HashMap<String, VehicleRecord>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stop updates, ordered by key.
    pub fn stop_updates(&self) -> Vec<StopUpdateRecord> {
        let table = lock(&self.stop_updates);
        let mut keys: Vec<_> = table.keys().collect();
        keys.sort();
        keys.into_iter().map(|k| table[k].clone()).collect()
    }

    pub fn stop_update(&self, key: &StopUpdateKey) -> Option<StopUpdateRecord> {
        lock(&self.stop_updates).get(key).cloned()
    }

    /// All vehicles, ordered by vehicle id.
    pub fn vehicles(&self) -> Vec<VehicleRecord> {
        let mut vehicles: Vec<_> = lock(&self.vehicles).values().cloned().collect();
        vehicles.sort_by(|a, b| a.vehicle_id.cmp(&b.vehicle_id));
        vehicles
    }

    pub fn vehicle(&self, vehicle_id: &str) -> Option<VehicleRecord> {
        lock(&self.vehicles).get(vehicle_id).cloned()
    }
}

// A panic mid-upsert cannot leave a half-written record, so a poisoned lock is still usable.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl UpsertSink for MemorySink {
    async fn upsert_stop_update(
        &self,
        key: &StopUpdateKey,
        fields: &StopUpdateFields,
    ) -> Result<UpsertOutcome, SinkError> {
        let record = StopUpdateRecord::new(key, fields);
        let previous = lock(&self.stop_updates).insert(key.clone(), record);

        Ok(match previous {
            Some(_) => UpsertOutcome::Updated,
            None => UpsertOutcome::Inserted,
        })
    }

    async fn upsert_vehicle(
        &self,
        vehicle_id: &str,
        fields: &VehicleFields,
        freshness: VehicleFreshness,
    ) -> Result<UpsertOutcome, SinkError> {
        let mut table = lock(&self.vehicles);

        let outcome = match table.get(vehicle_id) {
            None => UpsertOutcome::Inserted,
            Some(stored)
                if freshness == VehicleFreshness::Monotonic
                    && fields.timestamp < stored.timestamp =>
            {
                return Ok(UpsertOutcome::Stale);
            }
            Some(_) => UpsertOutcome::Updated,
        };

        table.insert(vehicle_id.to_string(), VehicleRecord::new(vehicle_id, fields));
        Ok(outcome)
    }
}
