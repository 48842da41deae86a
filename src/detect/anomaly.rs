use crate::config::DetectorConfig;
use crate::detect::{AnomalyFinding, DetectError, FindingSource, Severity};
use crate::sensors::{Reading, Sensor};
use tracing::debug;

/// Deviation score carried by status-error findings so that consumers of the
/// JSON payload can tell them apart from statistical findings.
pub const STATUS_ERROR_SCORE: f64 = -999.0;

/// A simple time series for statistical analysis.
pub struct TimeSeries {
    values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// True when every sample is the same value.
    pub fn is_constant(&self) -> bool {
        match self.values.first() {
            Some(first) => self.values.iter().all(|v| v == first),
            None => true,
        }
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<f64>() / self.values.len() as f64
    }

    /// Population variance.
    pub fn variance(&self) -> f64 {
        if self.is_constant() {
            return 0.0;
        }
        let mean = self.mean();
        let sum_sq_diff: f64 = self
            .values
            .iter()
            .map(|&x| (x - mean).powi(2))
            .sum();
        sum_sq_diff / self.values.len() as f64
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Z = (value - mean) / std_dev, or 0 when the series has no spread.
    ///
    /// `value` is not removed from the series: callers that pass the newest
    /// sample get a baseline that already contains it.
    pub fn z_score(&self, value: f64, min_samples: usize) -> Result<f64, DetectError> {
        if self.values.len() < min_samples {
            return Err(DetectError::InsufficientBaseline {
                needed: min_samples,
                have: self.values.len(),
            });
        }
        let std = self.std_dev();
        if std == 0.0 {
            return Ok(0.0);
        }
        Ok((value - self.mean()) / std)
    }
}

/// Map a deviation score to a severity tier. Both bounds are strict.
pub fn classify(z_score: f64, warning_z: f64, critical_z: f64) -> Option<Severity> {
    let magnitude = z_score.abs();
    if magnitude > critical_z {
        Some(Severity::Critical)
    } else if magnitude > warning_z {
        Some(Severity::Warning)
    } else {
        None
    }
}

/// Pure detector: no I/O, same input always gives the same output.
#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    config: DetectorConfig,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DetectorConfig {
        &self.config
    }

    /// Evaluate a continuous sensor. `window` must be ordered newest first;
    /// its first element is the current reading. A window shorter than
    /// `min_samples` yields no finding.
    pub fn evaluate_window(&self, sensor: &Sensor, window: &[Reading]) -> Option<AnomalyFinding> {
        let current = window.first()?;

        let ts = TimeSeries::new(window.iter().map(|r| r.value).collect());
        let z = match ts.z_score(current.value, self.config.min_samples) {
            Ok(z) => z,
            Err(e) => {
                debug!(sensor_id = %sensor.id, error = %e, "Skipping sensor");
                return None;
            }
        };

        let severity = classify(z, self.config.warning_z, self.config.critical_z)?;
        Some(AnomalyFinding {
            sensor_id: sensor.id.clone(),
            sensor_name: sensor.name.clone(),
            current_value: current.value,
            mean: ts.mean(),
            std_dev: ts.std_dev(),
            z_score: z,
            is_anomaly: true,
            severity,
            source: FindingSource::Statistical,
        })
    }

    /// Evaluate a binary-status sensor from its newest reading only.
    pub fn evaluate_status(&self, sensor: &Sensor, latest: Option<&Reading>) -> Option<AnomalyFinding> {
        let reading = latest?;
        if reading.value != self.config.status_error_value {
            return None;
        }
        Some(AnomalyFinding {
            sensor_id: sensor.id.clone(),
            sensor_name: sensor.name.clone(),
            current_value: reading.value,
            mean: 1.0,
            std_dev: 0.0,
            z_score: STATUS_ERROR_SCORE,
            is_anomaly: true,
            severity: Severity::Critical,
            source: FindingSource::StatusError,
        })
    }
}
