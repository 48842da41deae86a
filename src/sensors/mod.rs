//! Sensor metadata and readings as seen by the detector.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sensor classification. Continuous kinds report a measurement; status
/// kinds report operational (non-zero) or error (zero) state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SensorKind {
    Energy,
    Temp,
    Humidity,
    Co2,
    DoorStatus,
    ElevatorStatus,
    ChargerStatus,
}

impl SensorKind {
    /// True for binary-status channels (door, elevator, charger).
    pub fn is_status(self) -> bool {
        matches!(
            self,
            SensorKind::DoorStatus | SensorKind::ElevatorStatus | SensorKind::ChargerStatus
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SensorKind::Energy => "ENERGY",
            SensorKind::Temp => "TEMP",
            SensorKind::Humidity => "HUMIDITY",
            SensorKind::Co2 => "CO2",
            SensorKind::DoorStatus => "DOOR_STATUS",
            SensorKind::ElevatorStatus => "ELEVATOR_STATUS",
            SensorKind::ChargerStatus => "CHARGER_STATUS",
        }
    }
}

impl fmt::Display for SensorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for SensorKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ENERGY" => Ok(SensorKind::Energy),
            "TEMP" => Ok(SensorKind::Temp),
            "HUMIDITY" => Ok(SensorKind::Humidity),
            "CO2" => Ok(SensorKind::Co2),
            "DOOR_STATUS" => Ok(SensorKind::DoorStatus),
            "ELEVATOR_STATUS" => Ok(SensorKind::ElevatorStatus),
            "CHARGER_STATUS" => Ok(SensorKind::ChargerStatus),
            other => Err(anyhow::anyhow!("unknown sensor type '{}'", other)),
        }
    }
}

/// A monitored building.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Building {
    pub id: String,
    pub name: String,
    pub address: String,
}

/// Registry entry for one sensor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sensor {
    pub id: String,
    pub building_id: String,
    pub kind: SensorKind,
    pub name: String,
    pub unit: Option<String>,
    pub location_detail: Option<String>,
}

/// One sample from the reading store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub sensor_id: String,
    pub value: f64,
    pub read_at: DateTime<Utc>,
}
