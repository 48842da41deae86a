//! Storage layer -- store contracts, SQLite pool, schema.

pub mod schema;
pub mod sqlite;

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::detect::{Emission, NewAlert};
use crate::sensors::{Reading, Sensor};

pub use self::sqlite::{AlertFilter, SqliteStore};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Time-series of sensor readings.
#[async_trait::async_trait]
pub trait ReadingStore: Send + Sync {
    /// Readings for `sensor_id` with `read_at >= since`, newest first.
    async fn readings_since(&self, sensor_id: &str, since: DateTime<Utc>) -> Result<Vec<Reading>>;

    /// The single newest reading for `sensor_id`, if any.
    async fn latest_reading(&self, sensor_id: &str) -> Result<Option<Reading>>;
}

/// Building and sensor metadata.
#[async_trait::async_trait]
pub trait SensorRegistry: Send + Sync {
    async fn building_exists(&self, building_id: &str) -> Result<bool>;

    async fn sensors_for_building(&self, building_id: &str) -> Result<Vec<Sensor>>;
}

/// Deduplicated alert writes.
#[async_trait::async_trait]
pub trait AlertStore: Send + Sync {
    /// Insert unless a `NEW` alert for the same sensor was triggered at or
    /// after `since`. The check and the insert must be atomic with respect
    /// to other callers.
    async fn insert_unless_recent(&self, alert: &NewAlert, since: DateTime<Utc>) -> Result<Emission>;
}

/// Everything the detection engine needs from a backend.
pub trait Store: ReadingStore + SensorRegistry + AlertStore {}

impl<T: ReadingStore + SensorRegistry + AlertStore> Store for T {}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &Path) -> Result<Pool> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Fixed-width UTC text so that lexical order in SQL equals time order.
pub fn encode_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn decode_ts(text: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(text)
        .with_context(|| format!("bad timestamp '{}'", text))?
        .with_timezone(&Utc))
}
