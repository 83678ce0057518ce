//! LXP protocol: turns a sampling round into a versioned envelope.
//!
//! Envelopes are stamped with the wall-clock time at formatting, not with the
//! capture time of the round. Alarms keep their detection timestamps. Every
//! envelope is validated before it is handed out; an envelope that fails
//! validation is reported as a [`FormatError`] and never reaches the buffer.

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::collector::{Alarm, SamplingRound};
use crate::config::DeviceConfig;
use crate::host::{Environment, Location, NetworkInfo};
use crate::sensor::{status_from_thresholds, Reading, Status};

/// Protocol version written into every envelope.
pub const LXP_VERSION: &str = "1.0";

const DEFAULT_FIRMWARE_VERSION: &str = "1.0.0";
const DEFAULT_HARDWARE_VERSION: &str = "1.0.0";

/// Fields every envelope must carry at the top level.
const REQUIRED_FIELDS: [&str; 4] = ["lxp_version", "device_info", "timestamp", "data"];

/// Errors raised while formatting or validating an envelope.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum FormatError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Device ID is required")]
    MissingDeviceId,

    #[error("Invalid timestamp format")]
    InvalidTimestamp,

    #[error("Envelope could not be encoded: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub device_id: String,
    pub device_type: String,
    pub firmware_version: String,
    pub hardware_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeTimestamp {
    pub unix: i64,
    pub iso: String,
    pub timezone: String,
}

impl EnvelopeTimestamp {
    pub fn from_datetime(at: DateTime<Utc>) -> Self {
        Self {
            unix: at.timestamp(),
            iso: at.to_rfc3339_opts(SecondsFormat::Micros, true),
            timezone: "UTC".to_string(),
        }
    }
}

/// Metric entry on the wire: no accuracy, status always present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEntry {
    pub value: f64,
    pub unit: String,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub operational: bool,
    pub maintenance_required: bool,
    pub last_maintenance: Option<String>,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            operational: true,
            maintenance_required: false,
            last_maintenance: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeData {
    pub sensors: BTreeMap<String, Reading>,
    pub metrics: BTreeMap<String, MetricEntry>,
    pub alarms: Vec<Alarm>,
    pub status: DeviceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    pub location: Location,
    pub environment: Environment,
    pub network: NetworkInfo,
}

/// The unit of buffering and transmission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub lxp_version: String,
    pub device_info: DeviceInfo,
    pub timestamp: EnvelopeTimestamp,
    pub data: EnvelopeData,
    pub metadata: EnvelopeMetadata,
}

/// Formatter for the LXP envelope format.
#[derive(Debug, Clone)]
pub struct LxpFormatter {
    version: String,
}

impl Default for LxpFormatter {
    fn default() -> Self {
        Self::new(LXP_VERSION)
    }
}

impl LxpFormatter {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Format a round, stamped with the current time.
    ///
    /// # Errors
    ///
    /// Returns `FormatError` when the built envelope fails [`LxpFormatter::validate`].
    pub fn format(&self, round: SamplingRound, device: &DeviceConfig) -> Result<Envelope, FormatError> {
        self.format_at(round, device, Utc::now())
    }

    /// Format a round as if it were formatted at `now`.
    pub fn format_at(
        &self,
        round: SamplingRound,
        device: &DeviceConfig,
        now: DateTime<Utc>,
    ) -> Result<Envelope, FormatError> {
        let metrics = round
            .metrics
            .into_iter()
            .map(|(name, reading)| {
                let status = reading
                    .thresholds
                    .as_ref()
                    .map_or(Status::Normal, |t| status_from_thresholds(reading.value, t));
                let entry = MetricEntry {
                    value: reading.value,
                    unit: reading.unit,
                    status,
                };
                (name, entry)
            })
            .collect();

        let envelope = Envelope {
            lxp_version: self.version.clone(),
            device_info: device_info(device),
            timestamp: EnvelopeTimestamp::from_datetime(now),
            data: EnvelopeData {
                sensors: round.sensors,
                metrics,
                alarms: round.alarms,
                status: DeviceStatus::default(),
            },
            metadata: EnvelopeMetadata {
                location: round.location,
                environment: round.environment,
                network: round.network,
            },
        };

        self.validate(&envelope)?;
        Ok(envelope)
    }

    /// Validate an envelope against its wire representation.
    pub fn validate(&self, envelope: &Envelope) -> Result<(), FormatError> {
        let value = serde_json::to_value(envelope).map_err(|e| FormatError::Encode(e.to_string()))?;
        validate_value(&value)
    }
}

/// Validate a JSON document as an LXP envelope.
///
/// Checks that the required top-level fields exist, that `device_info.device_id`
/// is non-empty, and that `timestamp.unix` and `timestamp.iso` are set.
pub fn validate_value(value: &Value) -> Result<(), FormatError> {
    for field in REQUIRED_FIELDS {
        if value.get(field).map_or(true, Value::is_null) {
            return Err(FormatError::MissingField(field));
        }
    }

    let device_id = value["device_info"]["device_id"].as_str().unwrap_or_default();
    if device_id.is_empty() {
        return Err(FormatError::MissingDeviceId);
    }

    let unix = value["timestamp"]["unix"].as_i64().unwrap_or_default();
    let iso = value["timestamp"]["iso"].as_str().unwrap_or_default();
    if unix == 0 || iso.is_empty() {
        return Err(FormatError::InvalidTimestamp);
    }

    Ok(())
}

fn device_info(device: &DeviceConfig) -> DeviceInfo {
    // Without a configured id every envelope gets a fresh one.
    let device_id = device
        .stable_device_id()
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    DeviceInfo {
        device_id,
        device_type: device.device_type.clone(),
        firmware_version: device
            .firmware_version
            .clone()
            .unwrap_or_else(|| DEFAULT_FIRMWARE_VERSION.to_string()),
        hardware_version: device
            .hardware_version
            .clone()
            .unwrap_or_else(|| DEFAULT_HARDWARE_VERSION.to_string()),
    }
}
