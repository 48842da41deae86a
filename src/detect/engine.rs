use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::DetectorConfig;
use crate::detect::alert::AlertEmitter;
use crate::detect::anomaly::AnomalyDetector;
use crate::detect::{AnomalyFinding, DetectError, Emission};
use crate::sensors::Sensor;
use crate::storage::Store;

/// Outcome of one detection run over a building.
#[derive(Debug, Clone, Serialize)]
pub struct DetectionReport {
    pub building_id: String,
    pub anomalies_detected: usize,
    /// Alerts actually written; suppressed and failed emissions excluded.
    pub alerts_created: usize,
    /// Every finding, whether or not an alert was written for it.
    pub findings: Vec<AnomalyFinding>,
}

pub struct DetectionEngine<S> {
    store: Arc<S>,
    detector: AnomalyDetector,
    emitter: AlertEmitter<S>,
}

impl<S: Store> DetectionEngine<S> {
    pub fn new(store: Arc<S>, config: DetectorConfig) -> Self {
        let emitter = AlertEmitter::new(store.clone(), config.cooldown());
        Self {
            store,
            detector: AnomalyDetector::new(config),
            emitter,
        }
    }

    pub async fn run_detection(&self, building_id: &str) -> Result<DetectionReport, DetectError> {
        self.run_detection_at(building_id, Utc::now()).await
    }

    /// Scan every sensor of a building as of `now`, emitting alerts sensor
    /// by sensor. Only a missing or unknown building aborts the run.
    pub async fn run_detection_at(
        &self,
        building_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DetectionReport, DetectError> {
        let building_id = building_id.trim();
        if building_id.is_empty() {
            return Err(DetectError::MissingBuildingId);
        }
        if !self.store.building_exists(building_id).await? {
            return Err(DetectError::BuildingNotFound(building_id.to_string()));
        }

        let sensors = self.store.sensors_for_building(building_id).await?;
        info!(%building_id, sensors = sensors.len(), "Running anomaly detection");

        let mut findings = Vec::new();
        let mut alerts_created = 0;

        for sensor in &sensors {
            let finding = match self.detect_sensor(sensor, now).await {
                Ok(Some(f)) => f,
                Ok(None) => continue,
                Err(e) => {
                    warn!(sensor_id = %sensor.id, error = %e, "Failed to read sensor history, skipping");
                    continue;
                }
            };

            warn!(
                sensor_id = %sensor.id,
                sensor = %sensor.name,
                current = finding.current_value,
                mean = finding.mean,
                z_score = finding.z_score,
                severity = %finding.severity,
                "Anomaly detected"
            );

            match self.emitter.emit(&finding, now).await {
                Ok(Emission::Created(alert_id)) => {
                    alerts_created += 1;
                    info!(sensor_id = %sensor.id, %alert_id, "Created alert");
                }
                Ok(Emission::Suppressed { existing }) => {
                    info!(sensor_id = %sensor.id, %existing, "Skipping duplicate alert");
                }
                Err(e) => {
                    error!(sensor_id = %sensor.id, error = %e, "Failed to create alert");
                }
            }

            findings.push(finding);
        }

        info!(%building_id, anomalies = findings.len(), alerts_created, "Detection finished");

        Ok(DetectionReport {
            building_id: building_id.to_string(),
            anomalies_detected: findings.len(),
            alerts_created,
            findings,
        })
    }

    async fn detect_sensor(
        &self,
        sensor: &Sensor,
        now: DateTime<Utc>,
    ) -> Result<Option<AnomalyFinding>, DetectError> {
        if sensor.kind.is_status() {
            let latest = self.store.latest_reading(&sensor.id).await?;
            return Ok(self.detector.evaluate_status(sensor, latest.as_ref()));
        }

        let since = now
            .checked_sub_signed(self.detector.config().window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let window = self.store.readings_since(&sensor.id, since).await?;
        Ok(self.detector.evaluate_window(sensor, &window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{NewAlert, Severity};
    use crate::sensors::{Reading, SensorKind};
    use crate::storage::{AlertStore, ReadingStore, SensorRegistry};
    use anyhow::anyhow;
    use chrono::Duration;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use uuid::Uuid;

    /// In-memory store with switchable failures.
    #[derive(Default)]
    struct FakeStore {
        sensors: Vec<Sensor>,
        readings: HashMap<String, Vec<Reading>>,
        fail_reads_for: Option<String>,
        fail_inserts_for: Option<String>,
        inserted: Mutex<Vec<NewAlert>>,
    }

    #[async_trait::async_trait]
    impl ReadingStore for FakeStore {
        async fn readings_since(&self, sensor_id: &str, since: DateTime<Utc>) -> Result<Vec<Reading>> {
            if self.fail_reads_for.as_deref() == Some(sensor_id) {
                return Err(anyhow!("connection reset"));
            }
            let mut rows: Vec<Reading> = self
                .readings
                .get(sensor_id)
                .map(|r| r.iter().filter(|r| r.read_at >= since).cloned().collect())
                .unwrap_or_default();
            rows.sort_by(|a, b| b.read_at.cmp(&a.read_at));
            Ok(rows)
        }

        async fn latest_reading(&self, sensor_id: &str) -> Result<Option<Reading>> {
            Ok(self
                .readings
                .get(sensor_id)
                .and_then(|r| r.iter().max_by_key(|r| r.read_at).cloned()))
        }
    }

    #[async_trait::async_trait]
    impl SensorRegistry for FakeStore {
        async fn building_exists(&self, building_id: &str) -> Result<bool> {
            Ok(building_id == "b-1")
        }

        async fn sensors_for_building(&self, building_id: &str) -> Result<Vec<Sensor>> {
            Ok(self
                .sensors
                .iter()
                .filter(|s| s.building_id == building_id)
                .cloned()
                .collect())
        }
    }

    #[async_trait::async_trait]
    impl AlertStore for FakeStore {
        async fn insert_unless_recent(&self, alert: &NewAlert, since: DateTime<Utc>) -> Result<Emission> {
            if self.fail_inserts_for.as_deref() == Some(alert.sensor_id.as_str()) {
                return Err(anyhow!("disk full"));
            }
            let mut inserted = self.inserted.lock().unwrap();
            if inserted
                .iter()
                .any(|a| a.sensor_id == alert.sensor_id && a.triggered_at >= since)
            {
                return Ok(Emission::Suppressed { existing: Uuid::nil() });
            }
            inserted.push(alert.clone());
            Ok(Emission::Created(Uuid::new_v4()))
        }
    }

    fn sensor(id: &str, kind: SensorKind) -> Sensor {
        Sensor {
            id: id.into(),
            building_id: "b-1".into(),
            kind,
            name: id.into(),
            unit: None,
            location_detail: None,
        }
    }

    /// Oldest-first values, spaced ten minutes apart, ending at `now`.
    fn history(sensor_id: &str, values: &[f64], now: DateTime<Utc>) -> Vec<Reading> {
        let n = values.len() as i64;
        values
            .iter()
            .enumerate()
            .map(|(i, &value)| Reading {
                sensor_id: sensor_id.into(),
                value,
                read_at: now - Duration::minutes((n - 1 - i as i64) * 10),
            })
            .collect()
    }

    fn spike() -> Vec<f64> {
        let mut v = vec![10.0; 19];
        v.push(60.0);
        v
    }

    fn fake(now: DateTime<Utc>) -> FakeStore {
        let mut store = FakeStore {
            sensors: vec![
                sensor("energy", SensorKind::Energy),
                sensor("temp", SensorKind::Temp),
                sensor("door", SensorKind::DoorStatus),
                sensor("co2", SensorKind::Co2),
            ],
            ..FakeStore::default()
        };
        store.readings.insert("energy".into(), history("energy", &spike(), now));
        store.readings.insert("temp".into(), history("temp", &spike(), now));
        store.readings.insert("door".into(), history("door", &[1.0, 1.0, 0.0], now));
        store.readings.insert("co2".into(), history("co2", &[400.0; 5], now));
        store
    }

    #[tokio::test]
    async fn test_missing_and_unknown_building() {
        let engine = DetectionEngine::new(Arc::new(FakeStore::default()), DetectorConfig::default());
        assert!(matches!(
            engine.run_detection("  ").await,
            Err(DetectError::MissingBuildingId)
        ));
        assert!(matches!(
            engine.run_detection("b-404").await,
            Err(DetectError::BuildingNotFound(id)) if id == "b-404"
        ));
    }

    #[tokio::test]
    async fn test_run_reports_every_finding() {
        let now = Utc::now();
        let store = Arc::new(fake(now));
        let engine = DetectionEngine::new(store.clone(), DetectorConfig::default());

        let report = engine.run_detection_at("b-1", now).await.unwrap();
        // co2 has too little history.
        assert_eq!(report.anomalies_detected, 3);
        assert_eq!(report.alerts_created, 3);
        assert!(report.findings.iter().all(|f| f.sensor_id != "co2"));
        let door = report.findings.iter().find(|f| f.sensor_id == "door").unwrap();
        assert_eq!(door.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_read_failure_skips_only_that_sensor() {
        let now = Utc::now();
        let mut store = fake(now);
        store.fail_reads_for = Some("energy".into());
        let engine = DetectionEngine::new(Arc::new(store), DetectorConfig::default());

        let report = engine.run_detection_at("b-1", now).await.unwrap();
        assert_eq!(report.anomalies_detected, 2);
        assert!(report.findings.iter().all(|f| f.sensor_id != "energy"));
    }

    #[tokio::test]
    async fn test_insert_failure_does_not_stop_run() {
        let now = Utc::now();
        let mut store = fake(now);
        store.fail_inserts_for = Some("door".into());
        let store = Arc::new(store);
        let engine = DetectionEngine::new(store.clone(), DetectorConfig::default());

        let report = engine.run_detection_at("b-1", now).await.unwrap();
        assert_eq!(report.anomalies_detected, 3);
        assert_eq!(report.alerts_created, 2);
        let written: Vec<String> = store
            .inserted
            .lock()
            .unwrap()
            .iter()
            .map(|a| a.sensor_id.clone())
            .collect();
        assert!(!written.contains(&"door".to_string()));
        assert_eq!(written.len(), 2);
    }

    #[tokio::test]
    async fn test_unbounded_durations_do_not_panic() {
        let now = Utc::now();
        let config = DetectorConfig {
            window_hours: 2_000_000_000_000,
            cooldown_minutes: i64::MAX,
            ..DetectorConfig::default()
        };
        let engine = DetectionEngine::new(Arc::new(fake(now)), config);

        let report = engine.run_detection_at("b-1", now).await.unwrap();
        assert_eq!(report.anomalies_detected, 3);
        assert_eq!(report.alerts_created, 3);
    }

    #[tokio::test]
    async fn test_old_readings_fall_out_of_window() {
        let now = Utc::now();
        let mut store = FakeStore {
            sensors: vec![sensor("energy", SensorKind::Energy)],
            ..FakeStore::default()
        };
        let mut readings = history("energy", &spike(), now - Duration::hours(49));
        readings.push(Reading {
            sensor_id: "energy".into(),
            value: 60.0,
            read_at: now,
        });
        store.readings.insert("energy".into(), readings);
        let engine = DetectionEngine::new(Arc::new(store), DetectorConfig::default());

        let report = engine.run_detection_at("b-1", now).await.unwrap();
        assert_eq!(report.anomalies_detected, 0);
    }
}
