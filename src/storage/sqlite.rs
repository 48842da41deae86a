//! SQLite implementation of the store contracts.
//!
//! All queries run on the blocking pool via `spawn_blocking`; each call takes
//! one pooled connection for its duration.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use tracing::debug;
use uuid::Uuid;

use super::{decode_ts, encode_ts, open_pool, AlertStore, Pool, ReadingStore, SensorRegistry};
use crate::detect::{Alert, AlertStatus, DetectError, Emission, NewAlert};
use crate::sensors::{Building, Reading, Sensor};

const ALERT_COLUMNS: &str = "id, sensor_id, alert_type, severity, title, description, status, \
                             triggered_at, acknowledged_at, resolved_at";

/// Query options for [`SqliteStore::list_alerts`].
#[derive(Debug, Clone)]
pub struct AlertFilter {
    pub sensor_id: Option<String>,
    pub status: Option<AlertStatus>,
    pub limit: usize,
}

impl Default for AlertFilter {
    fn default() -> Self {
        Self {
            sensor_id: None,
            status: None,
            limit: 50,
        }
    }
}

enum Transition {
    Updated(Alert),
    Missing,
    Rejected(AlertStatus),
}

#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    /// Open (or create) the database file and migrate it.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool.get().context("failed to get DB connection")?;
            f(&mut conn)
        })
        .await
        .context("storage task did not complete")?
    }

    // -- ingestion -----------------------------------------------------------

    pub async fn insert_building(&self, building: &Building) -> Result<()> {
        let b = building.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO buildings (id, name, address) VALUES (?1, ?2, ?3)",
                params![b.id, b.name, b.address],
            )
            .context("failed to insert building")?;
            Ok(())
        })
        .await
    }

    pub async fn insert_sensor(&self, sensor: &Sensor) -> Result<()> {
        let s = sensor.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sensors (id, building_id, type, name, unit, location_detail)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![s.id, s.building_id, s.kind.as_str(), s.name, s.unit, s.location_detail],
            )
            .context("failed to insert sensor")?;
            Ok(())
        })
        .await
    }

    pub async fn insert_reading(&self, reading: &Reading) -> Result<()> {
        let r = reading.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO sensor_readings (sensor_id, value, read_at) VALUES (?1, ?2, ?3)",
                params![r.sensor_id, r.value, encode_ts(&r.read_at)],
            )
            .context("failed to insert reading")?;
            Ok(())
        })
        .await
    }

    // -- alert lifecycle -----------------------------------------------------

    /// Newest-first alert listing.
    pub async fn list_alerts(&self, filter: AlertFilter) -> Result<Vec<Alert>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM alerts
                 WHERE (?1 IS NULL OR sensor_id = ?1)
                 AND (?2 IS NULL OR status = ?2)
                 ORDER BY triggered_at DESC
                 LIMIT ?3",
                ALERT_COLUMNS
            ))?;
            let alerts = stmt
                .query_map(
                    params![
                        filter.sensor_id,
                        filter.status.map(|s| s.as_str()),
                        filter.limit as i64
                    ],
                    alert_from_row,
                )?
                .collect::<Result<_, _>>()?;
            Ok(alerts)
        })
        .await
    }

    pub async fn get_alert(&self, id: Uuid) -> Result<Option<Alert>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    &format!("SELECT {} FROM alerts WHERE id = ?1", ALERT_COLUMNS),
                    params![id.to_string()],
                    alert_from_row,
                )
                .optional()?)
        })
        .await
    }

    /// `NEW -> ACKNOWLEDGED`, stamping `acknowledged_at`.
    pub async fn acknowledge(&self, id: Uuid, at: DateTime<Utc>) -> Result<Alert, DetectError> {
        self.transition(id, AlertStatus::Acknowledged, "acknowledged_at", at)
            .await
    }

    /// `ACKNOWLEDGED -> RESOLVED`, stamping `resolved_at`.
    pub async fn resolve(&self, id: Uuid, at: DateTime<Utc>) -> Result<Alert, DetectError> {
        self.transition(id, AlertStatus::Resolved, "resolved_at", at).await
    }

    async fn transition(
        &self,
        id: Uuid,
        to: AlertStatus,
        stamp_column: &'static str,
        at: DateTime<Utc>,
    ) -> Result<Alert, DetectError> {
        let outcome = self
            .with_conn(move |conn| {
                let id_str = id.to_string();
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let current: Option<String> = tx
                    .query_row(
                        "SELECT status FROM alerts WHERE id = ?1",
                        params![id_str],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(current) = current else {
                    return Ok(Transition::Missing);
                };
                let current: AlertStatus = current.parse()?;
                if !current.can_transition_to(to) {
                    return Ok(Transition::Rejected(current));
                }

                tx.execute(
                    &format!(
                        "UPDATE alerts SET status = ?1, {} = ?2 WHERE id = ?3",
                        stamp_column
                    ),
                    params![to.as_str(), encode_ts(&at), id_str],
                )?;
                let alert = tx.query_row(
                    &format!("SELECT {} FROM alerts WHERE id = ?1", ALERT_COLUMNS),
                    params![id_str],
                    alert_from_row,
                )?;
                tx.commit()?;
                Ok(Transition::Updated(alert))
            })
            .await?;

        match outcome {
            Transition::Updated(alert) => Ok(alert),
            Transition::Missing => Err(DetectError::AlertNotFound(id)),
            Transition::Rejected(from) => Err(DetectError::InvalidAlertTransition { id, from, to }),
        }
    }
}

#[async_trait::async_trait]
impl ReadingStore for SqliteStore {
    async fn readings_since(&self, sensor_id: &str, since: DateTime<Utc>) -> Result<Vec<Reading>> {
        let sensor_id = sensor_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT sensor_id, value, read_at FROM sensor_readings
                 WHERE sensor_id = ?1 AND read_at >= ?2
                 ORDER BY read_at DESC, id DESC",
            )?;
            let readings = stmt
                .query_map(params![sensor_id, encode_ts(&since)], reading_from_row)?
                .collect::<Result<_, _>>()?;
            Ok(readings)
        })
        .await
    }

    async fn latest_reading(&self, sensor_id: &str) -> Result<Option<Reading>> {
        let sensor_id = sensor_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT sensor_id, value, read_at FROM sensor_readings
                     WHERE sensor_id = ?1
                     ORDER BY read_at DESC, id DESC
                     LIMIT 1",
                    params![sensor_id],
                    reading_from_row,
                )
                .optional()?)
        })
        .await
    }
}

#[async_trait::async_trait]
impl SensorRegistry for SqliteStore {
    async fn building_exists(&self, building_id: &str) -> Result<bool> {
        let building_id = building_id.to_string();
        self.with_conn(move |conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM buildings WHERE id = ?1)",
                params![building_id],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn sensors_for_building(&self, building_id: &str) -> Result<Vec<Sensor>> {
        let building_id = building_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, building_id, type, name, unit, location_detail FROM sensors
                 WHERE building_id = ?1
                 ORDER BY name, id",
            )?;
            let sensors = stmt
                .query_map(params![building_id], |row| {
                    Ok(Sensor {
                        id: row.get(0)?,
                        building_id: row.get(1)?,
                        kind: convert(2, &row.get::<_, String>(2)?, |s| s.parse())?,
                        name: row.get(3)?,
                        unit: row.get(4)?,
                        location_detail: row.get(5)?,
                    })
                })?
                .collect::<Result<_, _>>()?;
            Ok(sensors)
        })
        .await
    }
}

impl SqliteStore {
    /// Alerts for a sensor in `status` triggered at or after `since`.
    pub async fn recent_alerts(
        &self,
        sensor_id: &str,
        status: AlertStatus,
        since: DateTime<Utc>,
    ) -> Result<Vec<Alert>> {
        let sensor_id = sensor_id.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM alerts
                 WHERE sensor_id = ?1 AND status = ?2 AND triggered_at >= ?3
                 ORDER BY triggered_at DESC",
                ALERT_COLUMNS
            ))?;
            let alerts = stmt
                .query_map(
                    params![sensor_id, status.as_str(), encode_ts(&since)],
                    alert_from_row,
                )?
                .collect::<Result<_, _>>()?;
            Ok(alerts)
        })
        .await
    }

    /// Unconditional insert with status `NEW`.
    pub async fn insert_alert(&self, alert: &NewAlert) -> Result<Uuid> {
        let alert = alert.clone();
        self.with_conn(move |conn| insert_alert_row(conn, &alert)).await
    }
}

#[async_trait::async_trait]
impl AlertStore for SqliteStore {
    async fn insert_unless_recent(&self, alert: &NewAlert, since: DateTime<Utc>) -> Result<Emission> {
        let alert = alert.clone();
        self.with_conn(move |conn| {
            // IMMEDIATE takes the write lock up front, so a second writer
            // waits here instead of racing the check below.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM alerts
                     WHERE sensor_id = ?1 AND status = ?2 AND triggered_at >= ?3
                     ORDER BY triggered_at DESC
                     LIMIT 1",
                    params![alert.sensor_id, AlertStatus::New.as_str(), encode_ts(&since)],
                    |row| row.get(0),
                )
                .optional()?;

            if let Some(existing) = existing {
                debug!(sensor_id = %alert.sensor_id, %existing, "recent NEW alert found");
                return Ok(Emission::Suppressed {
                    existing: Uuid::parse_str(&existing)?,
                });
            }

            let id = insert_alert_row(&tx, &alert)?;
            tx.commit()?;
            Ok(Emission::Created(id))
        })
        .await
    }
}

fn insert_alert_row(conn: &Connection, alert: &NewAlert) -> Result<Uuid> {
    let id = Uuid::new_v4();
    conn.execute(
        "INSERT INTO alerts (id, sensor_id, alert_type, severity, title, description, status, triggered_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            id.to_string(),
            alert.sensor_id,
            alert.category.as_str(),
            alert.severity.as_str(),
            alert.title,
            alert.description,
            AlertStatus::New.as_str(),
            encode_ts(&alert.triggered_at)
        ],
    )
    .context("failed to insert alert")?;
    Ok(id)
}

/// Parse a text column, reporting failures as a column conversion error.
fn convert<T>(idx: usize, text: &str, parse: impl FnOnce(&str) -> Result<T>) -> rusqlite::Result<T> {
    parse(text).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn reading_from_row(row: &Row<'_>) -> rusqlite::Result<Reading> {
    Ok(Reading {
        sensor_id: row.get(0)?,
        value: row.get(1)?,
        read_at: convert(2, &row.get::<_, String>(2)?, decode_ts)?,
    })
}

fn alert_from_row(row: &Row<'_>) -> rusqlite::Result<Alert> {
    let optional_ts = |idx: usize| -> rusqlite::Result<Option<DateTime<Utc>>> {
        row.get::<_, Option<String>>(idx)?
            .map(|text| convert(idx, &text, decode_ts))
            .transpose()
    };

    Ok(Alert {
        id: convert(0, &row.get::<_, String>(0)?, |s| Ok(Uuid::parse_str(s)?))?,
        sensor_id: row.get(1)?,
        category: convert(2, &row.get::<_, String>(2)?, |s| s.parse())?,
        severity: convert(3, &row.get::<_, String>(3)?, |s| s.parse())?,
        title: row.get(4)?,
        description: row.get(5)?,
        status: convert(6, &row.get::<_, String>(6)?, |s| s.parse())?,
        triggered_at: convert(7, &row.get::<_, String>(7)?, decode_ts)?,
        acknowledged_at: optional_ts(8)?,
        resolved_at: optional_ts(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{AlertCategory, Severity};
    use crate::sensors::SensorKind;
    use chrono::Duration;

    async fn seeded() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("test.db")).unwrap();
        store
            .insert_building(&Building {
                id: "b-1".into(),
                name: "Tower A".into(),
                address: "1 Main St".into(),
            })
            .await
            .unwrap();
        for (id, kind) in [("s-energy", SensorKind::Energy), ("s-door", SensorKind::DoorStatus)] {
            store
                .insert_sensor(&Sensor {
                    id: id.into(),
                    building_id: "b-1".into(),
                    kind,
                    name: id.into(),
                    unit: None,
                    location_detail: Some("B1".into()),
                })
                .await
                .unwrap();
        }
        (dir, store)
    }

    fn new_alert(sensor_id: &str, at: DateTime<Utc>) -> NewAlert {
        NewAlert {
            sensor_id: sensor_id.into(),
            category: AlertCategory::Anomaly,
            severity: Severity::Warning,
            title: "t".into(),
            description: "d".into(),
            triggered_at: at,
        }
    }

    #[tokio::test]
    async fn test_registry_queries() {
        let (_dir, store) = seeded().await;
        assert!(store.building_exists("b-1").await.unwrap());
        assert!(!store.building_exists("b-2").await.unwrap());

        let sensors = store.sensors_for_building("b-1").await.unwrap();
        assert_eq!(sensors.len(), 2);
        assert!(sensors.iter().any(|s| s.kind == SensorKind::DoorStatus));
        assert!(store.sensors_for_building("b-2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_readings_window_newest_first() {
        let (_dir, store) = seeded().await;
        let now = Utc::now();
        for (hours_ago, value) in [(50, 1.0), (30, 2.0), (1, 3.0)] {
            store
                .insert_reading(&Reading {
                    sensor_id: "s-energy".into(),
                    value,
                    read_at: now - Duration::hours(hours_ago),
                })
                .await
                .unwrap();
        }

        let window = store
            .readings_since("s-energy", now - Duration::hours(48))
            .await
            .unwrap();
        let values: Vec<f64> = window.iter().map(|r| r.value).collect();
        assert_eq!(values, vec![3.0, 2.0]);

        let latest = store.latest_reading("s-energy").await.unwrap().unwrap();
        assert_eq!(latest.value, 3.0);
        assert!(store.latest_reading("s-door").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_insert_unless_recent_suppresses_second() {
        let (_dir, store) = seeded().await;
        let now = Utc::now();
        let since = now - Duration::minutes(60);

        let first = store
            .insert_unless_recent(&new_alert("s-energy", now), since)
            .await
            .unwrap();
        let Emission::Created(id) = first else {
            panic!("first insert should create, got {:?}", first);
        };
        let second = store
            .insert_unless_recent(&new_alert("s-energy", now), since)
            .await
            .unwrap();
        assert_eq!(second, Emission::Suppressed { existing: id });

        // Other sensors are unaffected.
        let other = store
            .insert_unless_recent(&new_alert("s-door", now), since)
            .await
            .unwrap();
        assert!(matches!(other, Emission::Created(_)));
    }

    #[tokio::test]
    async fn test_old_or_acknowledged_alerts_do_not_suppress() {
        let (_dir, store) = seeded().await;
        let now = Utc::now();
        let since = now - Duration::minutes(60);

        store
            .insert_alert(&new_alert("s-energy", now - Duration::minutes(61)))
            .await
            .unwrap();
        let fresh = store
            .insert_unless_recent(&new_alert("s-energy", now), since)
            .await
            .unwrap();
        let Emission::Created(fresh_id) = fresh else {
            panic!("stale alert should not suppress");
        };

        store.acknowledge(fresh_id, now).await.unwrap();
        let again = store
            .insert_unless_recent(&new_alert("s-energy", now), since)
            .await
            .unwrap();
        assert!(matches!(again, Emission::Created(_)));

        let new_alerts = store
            .recent_alerts("s-energy", AlertStatus::New, since)
            .await
            .unwrap();
        assert_eq!(new_alerts.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_inserts_create_one_alert() {
        let (_dir, store) = seeded().await;
        let now = Utc::now();
        let since = now - Duration::minutes(60);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .insert_unless_recent(&new_alert("s-energy", now), since)
                    .await
                    .unwrap()
            }));
        }

        let mut created = 0;
        for h in handles {
            if matches!(h.await.unwrap(), Emission::Created(_)) {
                created += 1;
            }
        }
        assert_eq!(created, 1);

        let rows = store
            .list_alerts(AlertFilter {
                sensor_id: Some("s-energy".into()),
                ..AlertFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_round() {
        let (_dir, store) = seeded().await;
        let now = Utc::now();
        let id = store.insert_alert(&new_alert("s-door", now)).await.unwrap();

        // Resolve before acknowledge is rejected.
        let err = store.resolve(id, now).await.unwrap_err();
        assert!(matches!(
            err,
            DetectError::InvalidAlertTransition {
                from: AlertStatus::New,
                to: AlertStatus::Resolved,
                ..
            }
        ));

        let acked = store.acknowledge(id, now + Duration::minutes(1)).await.unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);
        assert!(acked.acknowledged_at.is_some());
        assert!(acked.resolved_at.is_none());

        let resolved = store.resolve(id, now + Duration::minutes(2)).await.unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(resolved.resolved_at.unwrap() > resolved.acknowledged_at.unwrap());

        let missing = store.acknowledge(Uuid::new_v4(), now).await.unwrap_err();
        assert!(matches!(missing, DetectError::AlertNotFound(_)));
    }

    #[tokio::test]
    async fn test_list_alerts_filters() {
        let (_dir, store) = seeded().await;
        let now = Utc::now();
        let a = store.insert_alert(&new_alert("s-door", now)).await.unwrap();
        store
            .insert_alert(&new_alert("s-energy", now + Duration::seconds(1)))
            .await
            .unwrap();
        store.acknowledge(a, now).await.unwrap();

        let all = store.list_alerts(AlertFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].sensor_id.as_deref(), Some("s-energy"));

        let acked = store
            .list_alerts(AlertFilter {
                status: Some(AlertStatus::Acknowledged),
                ..AlertFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].id, a);

        let limited = store
            .list_alerts(AlertFilter {
                limit: 1,
                ..AlertFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(store.get_alert(a).await.unwrap().unwrap().id, a);
    }
}
