//! Anomaly detection, alert emission, and the per-building orchestrator.

pub mod alert;
pub mod anomaly;
pub mod engine;

use std::fmt;
use std::str::FromStr;

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("insufficient baseline data: need {needed} samples, have {have}")]
    InsufficientBaseline { needed: usize, have: usize },

    #[error("building_id is required")]
    MissingBuildingId,

    #[error("building not found: {0}")]
    BuildingNotFound(String),

    #[error("alert not found: {0}")]
    AlertNotFound(Uuid),

    #[error("alert {id} is {from} and cannot move to {to}")]
    InvalidAlertTransition {
        id: Uuid,
        from: AlertStatus,
        to: AlertStatus,
    },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Severity levels for findings and alerts. Detection only produces
/// `Warning` and `Critical`; `Info` exists for rule-based alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// Where an alert came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertCategory {
    /// Rule-based threshold alerts; written by tooling outside the detector.
    Threshold,
    Anomaly,
    FacilityError,
}

/// Operator-facing lifecycle of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertStatus {
    New,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    /// `NEW -> ACKNOWLEDGED -> RESOLVED`, nothing else.
    pub fn can_transition_to(self, next: AlertStatus) -> bool {
        matches!(
            (self, next),
            (AlertStatus::New, AlertStatus::Acknowledged)
                | (AlertStatus::Acknowledged, AlertStatus::Resolved)
        )
    }
}

macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($ty::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.pad(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($ty::$variant),)+
                    other => Err(anyhow::anyhow!(
                        concat!("unknown ", stringify!($ty), " '{}'"),
                        other
                    )),
                }
            }
        }
    };
}

text_enum!(Severity {
    Info => "INFO",
    Warning => "WARNING",
    Critical => "CRITICAL",
});

text_enum!(AlertCategory {
    Threshold => "THRESHOLD",
    Anomaly => "ANOMALY",
    FacilityError => "FACILITY_ERROR",
});

text_enum!(AlertStatus {
    New => "NEW",
    Acknowledged => "ACKNOWLEDGED",
    Resolved => "RESOLVED",
});

/// Which rule produced a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FindingSource {
    /// Z-score over the trailing window of a continuous sensor.
    Statistical,
    /// A status sensor reporting its error state.
    StatusError,
}

/// Result of one detection pass over one sensor. Never persisted.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AnomalyFinding {
    pub sensor_id: String,
    pub sensor_name: String,
    pub current_value: f64,
    pub mean: f64,
    pub std_dev: f64,
    /// For status errors this holds [`anomaly::STATUS_ERROR_SCORE`].
    pub z_score: f64,
    pub is_anomaly: bool,
    pub severity: Severity,
    pub source: FindingSource,
}

/// A persisted alert row.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub sensor_id: Option<String>,
    #[serde(rename = "alert_type")]
    pub category: AlertCategory,
    pub severity: Severity,
    pub title: String,
    pub description: Option<String>,
    pub status: AlertStatus,
    pub triggered_at: chrono::DateTime<chrono::Utc>,
    pub acknowledged_at: Option<chrono::DateTime<chrono::Utc>>,
    pub resolved_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// An alert about to be written. Status is always `NEW` on insert.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAlert {
    pub sensor_id: String,
    pub category: AlertCategory,
    pub severity: Severity,
    pub title: String,
    pub description: String,
    pub triggered_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome of a dedup-guarded insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    Created(Uuid),
    /// A `NEW` alert for the sensor already exists inside the cooldown window.
    Suppressed { existing: Uuid },
}
