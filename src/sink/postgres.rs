use std::time::Duration;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use tracing::{debug, warn};

use super::{StopUpdateFields, StopUpdateKey, UpsertOutcome, UpsertSink, VehicleFields};
use crate::config::VehicleFreshness;
use crate::error::SinkError;

const RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Sink backed by the `realtime_stop_updates` and `vehicles` tables.
///
/// Every upsert is one `INSERT ... ON CONFLICT DO UPDATE` statement on a
/// connection borrowed from the pool for the duration of that statement.
#[derive(Debug, Clone)]
pub struct PostgresSink {
    pool: PgPool,
    max_retries: u32,
}

impl PostgresSink {
    pub fn new(pool: PgPool, max_retries: u32) -> Self {
        Self { pool, max_retries }
    }

    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        max_retries: u32,
    ) -> Result<Self, SinkError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(classify)?;

        Ok(Self::new(pool, max_retries))
    }

    /// Applies the schema in `migrations/`.
    pub async fn migrate(&self) -> Result<(), SinkError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SinkError::Rejected(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs `op`, retrying transient failures with a linear backoff.
    async fn with_retry<T, F, Fut>(&self, what: &'static str, op: F) -> Result<T, SinkError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, sqlx::Error>>,
    {
        let mut attempt = 0;
        loop {
            match op().await.map_err(classify) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(what, attempt, error = %e, "Transient sink failure, retrying");
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn classify(e: sqlx::Error) -> SinkError {
    match e {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            SinkError::Unavailable(e.to_string())
        }
        other => SinkError::Rejected(other.to_string()),
    }
}

fn outcome(row: Option<PgRow>) -> Result<UpsertOutcome, sqlx::Error> {
    match row {
        None => Ok(UpsertOutcome::Stale),
        Some(row) if row.try_get::<bool, _>("inserted")? => Ok(UpsertOutcome::Inserted),
        Some(_) => Ok(UpsertOutcome::Updated),
    }
}

// `xmax = 0` only holds for a freshly inserted tuple.
const UPSERT_STOP_UPDATE: &str = r#"
    INSERT INTO realtime_stop_updates
        (trip_id, stop_id, arrival_time, departure_time, stop_sequence, timestamp)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (trip_id, stop_id, arrival_time) DO UPDATE
    SET departure_time = EXCLUDED.departure_time,
        stop_sequence = EXCLUDED.stop_sequence,
        timestamp = EXCLUDED.timestamp
    RETURNING (xmax = 0) AS inserted
"#;

const UPSERT_VEHICLE: &str = r#"
    INSERT INTO vehicles
        (vehicle_id, trip_id, current_stop_id, latitude, longitude, timestamp)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (vehicle_id) DO UPDATE
    SET trip_id = EXCLUDED.trip_id,
        current_stop_id = EXCLUDED.current_stop_id,
        latitude = EXCLUDED.latitude,
        longitude = EXCLUDED.longitude,
        timestamp = EXCLUDED.timestamp
    RETURNING (xmax = 0) AS inserted
"#;

const UPSERT_VEHICLE_MONOTONIC: &str = r#"
    INSERT INTO vehicles
        (vehicle_id, trip_id, current_stop_id, latitude, longitude, timestamp)
    VALUES ($1, $2, $3, $4, $5, $6)
    ON CONFLICT (vehicle_id) DO UPDATE
    SET trip_id = EXCLUDED.trip_id,
        current_stop_id = EXCLUDED.current_stop_id,
        latitude = EXCLUDED.latitude,
        longitude = EXCLUDED.longitude,
        timestamp = EXCLUDED.timestamp
    WHERE vehicles.timestamp <= EXCLUDED.timestamp
    RETURNING (xmax = 0) AS inserted
"#;

#[async_trait]
impl UpsertSink for PostgresSink {
    #[tracing::instrument(
        skip(self, key, fields),
        fields(trip_id = %key.trip_id, stop_id = %key.stop_id)
    )]
    async fn upsert_stop_update(
        &self,
        key: &StopUpdateKey,
        fields: &StopUpdateFields,
    ) -> Result<UpsertOutcome, SinkError> {
        let stop_sequence = fields.stop_sequence.map(i64::from);

        let result = self
            .with_retry("stop_update", move || async move {
                let row = sqlx::query(UPSERT_STOP_UPDATE)
                    .bind(&key.trip_id)
                    .bind(&key.stop_id)
                    .bind(key.arrival_time)
                    .bind(fields.departure_time)
                    .bind(stop_sequence)
                    .bind(fields.ingested_at)
                    .fetch_optional(&self.pool)
                    .await?;
                outcome(row)
            })
            .await?;

        debug!(?result, "Stop update upserted");
        Ok(result)
    }

    #[tracing::instrument(skip(self, fields))]
    async fn upsert_vehicle(
        &self,
        vehicle_id: &str,
        fields: &VehicleFields,
        freshness: VehicleFreshness,
    ) -> Result<UpsertOutcome, SinkError> {
        let sql = match freshness {
            VehicleFreshness::LastWriteWins => UPSERT_VEHICLE,
            VehicleFreshness::Monotonic => UPSERT_VEHICLE_MONOTONIC,
        };

        let result = self
            .with_retry("vehicle", move || async move {
                let row = sqlx::query(sql)
                    .bind(vehicle_id)
                    .bind(fields.trip_id.as_deref())
                    .bind(fields.stop_id.as_deref())
                    .bind(fields.position.map(|p| p.latitude))
                    .bind(fields.position.map(|p| p.longitude))
                    .bind(fields.timestamp)
                    .fetch_optional(&self.pool)
                    .await?;
                outcome(row)
            })
            .await?;

        debug!(?result, "Vehicle upserted");
        Ok(result)
    }
}
