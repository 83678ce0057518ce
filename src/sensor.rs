//! Sensor readings and the sensor capability.
//!
//! A sensor is anything that implements [`SensorSource`]: one async `read`
//! producing a [`Reading`]. The threshold and calibration logic every sensor
//! kind shares lives in free functions so that metrics can reuse it.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::SensorConfig;

/// Health of a single reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Normal,
    Warning,
    Critical,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Normal => "normal",
            Status::Warning => "warning",
            Status::Critical => "critical",
            Status::Error => "error",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional alarm bounds for a value. A missing bound never triggers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_low: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning_high: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_low: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical_high: Option<f64>,
}

impl Thresholds {
    pub fn is_empty(&self) -> bool {
        self.warning_low.is_none()
            && self.warning_high.is_none()
            && self.critical_low.is_none()
            && self.critical_high.is_none()
    }
}

/// Derive a status from `value` and its thresholds.
///
/// Bounds are checked in a fixed order and the first match wins:
/// `critical_high`, `warning_high`, `warning_low`, `critical_low`. The order is
/// part of the wire contract and must not be rearranged, even though it lets a
/// value below `critical_low` but also below `warning_low` report `warning`.
pub fn status_from_thresholds(value: f64, thresholds: &Thresholds) -> Status {
    let above = |limit: Option<f64>| limit.is_some_and(|limit| value > limit);
    let below = |limit: Option<f64>| limit.is_some_and(|limit| value < limit);

    if above(thresholds.critical_high) {
        Status::Critical
    } else if above(thresholds.warning_high) {
        Status::Warning
    } else if below(thresholds.warning_low) {
        Status::Warning
    } else if below(thresholds.critical_low) {
        Status::Critical
    } else {
        Status::Normal
    }
}

/// Apply a calibration offset to a raw value.
pub fn calibrate(value: f64, offset: f64) -> f64 {
    value + offset
}

/// One sensor's value for one sampling round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub value: f64,

    pub unit: String,

    pub accuracy: f64,

    pub status: Status,

    /// Bounds the status was derived from; kept off the wire
    #[serde(skip)]
    pub thresholds: Option<Thresholds>,
}

impl Reading {
    /// Create a reading whose status is derived from `thresholds`.
    pub fn new(value: f64, unit: impl Into<String>, accuracy: f64, thresholds: Thresholds) -> Self {
        Self {
            value,
            unit: unit.into(),
            accuracy,
            status: status_from_thresholds(value, &thresholds),
            thresholds: Some(thresholds),
        }
    }

    /// Create a reading without thresholds; its status is `normal`.
    pub fn plain(value: f64, unit: impl Into<String>) -> Self {
        Self {
            value,
            unit: unit.into(),
            accuracy: 0.0,
            status: Status::Normal,
            thresholds: None,
        }
    }

    /// Placeholder recorded for a sensor whose read failed.
    pub fn error() -> Self {
        Self {
            value: 0.0,
            unit: String::new(),
            accuracy: 0.0,
            status: Status::Error,
            thresholds: None,
        }
    }
}

/// Errors that can occur while reading a sensor.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    #[error("sensor read failed: {0}")]
    ReadFailed(String),

    #[error("sensor returned a non-finite value")]
    InvalidValue,

    #[error("sensor read timed out after {0:?}")]
    Timeout(Duration),
}

/// Capability implemented by every data source the collector samples.
#[async_trait]
pub trait SensorSource: Send + Sync {
    /// Read the current value. Implementations must return in bounded time.
    async fn read(&self) -> Result<Reading, SensorError>;
}

/// Built-in sensor kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Temperature,
    Humidity,
    Pressure,
    Generic,
}

impl SensorKind {
    /// Map a configured `type` onto a kind; unknown types are generic.
    pub fn from_type(sensor_type: &str) -> Self {
        match sensor_type.to_ascii_lowercase().as_str() {
            "temperature" => SensorKind::Temperature,
            "humidity" => SensorKind::Humidity,
            "pressure" => SensorKind::Pressure,
            _ => SensorKind::Generic,
        }
    }

    /// Get the kind name as a string.
    pub fn name(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Pressure => "pressure",
            SensorKind::Generic => "generic",
        }
    }

    /// Get the unit for this sensor kind.
    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "°C",
            SensorKind::Humidity => "%",
            SensorKind::Pressure => "hPa",
            SensorKind::Generic => "",
        }
    }

    pub fn accuracy(&self) -> f64 {
        match self {
            SensorKind::Temperature => 0.1,
            SensorKind::Humidity => 0.5,
            SensorKind::Pressure => 1.0,
            SensorKind::Generic => 0.0,
        }
    }

    // Temperature 20-30C, humidity 40-60%, pressure 1013 +/- 10 hPa
    fn simulate(&self, rng: &mut impl Rng) -> f64 {
        match self {
            SensorKind::Temperature => rng.gen_range(20.0..30.0),
            SensorKind::Humidity => rng.gen_range(40.0..60.0),
            SensorKind::Pressure => rng.gen_range(1003.0..1023.0),
            SensorKind::Generic => 0.0,
        }
    }
}

/// Sensor producing simulated values for boards without a bus driver.
#[derive(Debug, Clone)]
pub struct SimulatedSensor {
    kind: SensorKind,
    calibration: f64,
    thresholds: Thresholds,
}

impl SimulatedSensor {
    pub fn new(kind: SensorKind, calibration: f64, thresholds: Thresholds) -> Self {
        Self {
            kind,
            calibration,
            thresholds,
        }
    }

    pub fn from_config(config: &SensorConfig) -> Self {
        Self::new(
            SensorKind::from_type(&config.sensor_type),
            config.calibration,
            config.thresholds,
        )
    }

    pub fn kind(&self) -> SensorKind {
        self.kind
    }
}

#[async_trait]
impl SensorSource for SimulatedSensor {
    async fn read(&self) -> Result<Reading, SensorError> {
        let raw = self.kind.simulate(&mut rand::thread_rng());
        let value = calibrate(raw, self.calibration);
        if !value.is_finite() {
            return Err(SensorError::InvalidValue);
        }

        Ok(Reading::new(
            value,
            self.kind.unit(),
            self.kind.accuracy(),
            self.thresholds,
        ))
    }
}

/// Instantiate every enabled sensor, keyed by its configured name.
pub fn build_sensors(
    configs: &BTreeMap<String, SensorConfig>,
) -> BTreeMap<String, Box<dyn SensorSource>> {
    configs
        .iter()
        .filter(|(_, config)| config.enabled)
        .map(|(name, config)| {
            let sensor: Box<dyn SensorSource> = Box::new(SimulatedSensor::from_config(config));
            (name.clone(), sensor)
        })
        .collect()
}
