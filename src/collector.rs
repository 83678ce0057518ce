//! Collector module: one sampling round across every configured sensor.
//!
//! A failing sensor never aborts the round. Its slot is filled with an
//! error reading and the remaining sensors are still read. Readings in
//! `warning` or `critical` state raise one alarm each.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::Config;
use crate::host::{Environment, HostProbe, Location, NetworkInfo, SystemHost};
use crate::sensor::{build_sensors, Reading, SensorError, SensorSource, Status};

/// Upper bound on a single sensor read.
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// Alarm severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl Severity {
    /// Severity raised by a reading status, if any.
    pub fn from_status(status: Status) -> Option<Self> {
        match status {
            Status::Warning => Some(Severity::Warning),
            Status::Critical => Some(Severity::Critical),
            Status::Normal | Status::Error => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alarm raised by a sensor that crossed one of its thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    /// `<SENSOR>_<SEVERITY>`, upper-cased
    pub id: String,

    pub severity: Severity,

    pub message: String,

    /// Unix seconds at detection
    pub timestamp: i64,
}

impl Alarm {
    pub fn for_sensor(sensor_name: &str, severity: Severity, timestamp: i64) -> Self {
        Self {
            id: format!(
                "{}_{}",
                sensor_name.to_uppercase(),
                severity.as_str().to_uppercase()
            ),
            severity,
            message: format!("{} is in {} state", sensor_name, severity),
            timestamp,
        }
    }
}

/// Everything gathered during one tick, before formatting.
#[derive(Debug, Clone, Default)]
pub struct SamplingRound {
    pub sensors: BTreeMap<String, Reading>,
    pub metrics: BTreeMap<String, Reading>,
    pub alarms: Vec<Alarm>,
    pub location: Location,
    pub environment: Environment,
    pub network: NetworkInfo,
    /// Moment the sensor reads completed
    pub captured_at: DateTime<Utc>,
}

/// One alarm per sensor whose reading is `warning` or `critical`.
pub fn derive_alarms(sensors: &BTreeMap<String, Reading>, timestamp: i64) -> Vec<Alarm> {
    sensors
        .iter()
        .filter_map(|(name, reading)| {
            Severity::from_status(reading.status)
                .map(|severity| Alarm::for_sensor(name, severity, timestamp))
        })
        .collect()
}

/// Samples every configured sensor and the host once per tick.
pub struct Collector {
    sensors: BTreeMap<String, Box<dyn SensorSource>>,
    host: Box<dyn HostProbe>,
    read_timeout: Duration,
}

impl Collector {
    pub fn new(sensors: BTreeMap<String, Box<dyn SensorSource>>, host: Box<dyn HostProbe>) -> Self {
        Self {
            sensors,
            host,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }

    /// Build the enabled sensors and a system host probe from configuration.
    pub fn from_config(config: &Config) -> Self {
        let location = config.location.clone().unwrap_or_default();
        Self::new(
            build_sensors(&config.sensors),
            Box::new(SystemHost::new(location)),
        )
    }

    pub fn with_read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    /// Run one sampling round.
    ///
    /// Sensors are read one after another; a read that fails or exceeds the
    /// read timeout is recorded as [`Reading::error`] and is not retried.
    pub async fn collect_all(&mut self) -> SamplingRound {
        let mut sensors = BTreeMap::new();

        for (name, sensor) in &self.sensors {
            let reading = match tokio::time::timeout(self.read_timeout, sensor.read()).await {
                Ok(Ok(reading)) => reading,
                Ok(Err(e)) => {
                    warn!(sensor = %name, error = %e, "Sensor read failed");
                    Reading::error()
                }
                Err(_) => {
                    let e = SensorError::Timeout(self.read_timeout);
                    warn!(sensor = %name, error = %e, "Sensor read failed");
                    Reading::error()
                }
            };
            sensors.insert(name.clone(), reading);
        }

        let captured_at = Utc::now();
        let alarms = derive_alarms(&sensors, captured_at.timestamp());

        debug!(
            sensors = sensors.len(),
            alarms = alarms.len(),
            "Sampling round collected"
        );

        SamplingRound {
            sensors,
            metrics: self.host.metrics(),
            alarms,
            location: self.host.location(),
            environment: self.host.environment(),
            network: self.host.network(),
            captured_at,
        }
    }
}
