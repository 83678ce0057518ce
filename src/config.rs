//! Configuration module for the device agent.
//!
//! The agent consumes the JSON device configuration written by the setup tool
//! (`/etc/lxpcloud-agent/device_config.json` by default) and applies a small set
//! of environment overrides on top of it.

use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::host::Location;
use crate::sensor::Thresholds;

/// Default location of the device configuration document
const DEFAULT_CONFIG_PATH: &str = "/etc/lxpcloud-agent/device_config.json";

/// Default HTTP request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Default number of send attempts per envelope
const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default sampling interval in seconds
const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Default number of envelopes buffered before a flush
const DEFAULT_BATCH_SIZE: usize = 10;

/// Maximum allowed batch size to prevent memory issues
const MAX_BATCH_SIZE: usize = 10_000;

/// Minimum sampling interval to avoid hammering the sensors and the API
const MIN_INTERVAL_SECS: u64 = 1;

/// Maximum sampling interval (one day)
const MAX_INTERVAL_SECS: u64 = 86_400;

const MIN_API_KEY_LEN: usize = 10;
const MAX_DEVICE_NAME_LEN: usize = 100;

/// Placeholder the setup tool writes when no device id was chosen.
const AUTO_DEVICE_ID: &str = "auto-generated";

/// Error type for configuration loading and validation failures
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read
    #[error("Failed to read configuration file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The configuration document is not valid JSON for the expected schema
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A field holds a value outside of its allowed range
    #[error("Configuration error for {field}: {message}")]
    Invalid { field: &'static str, message: String },

    /// An environment override could not be parsed
    #[error("Configuration error for {var}: {message}")]
    Env { var: String, message: String },
}

impl ConfigError {
    fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}

/// Remote endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the LXPCloud API
    pub base_url: String,

    /// Path appended to `base_url` for both sends and the connectivity probe
    #[serde(default)]
    pub endpoint: String,

    /// API key sent with every request
    pub api_key: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Send attempts per envelope
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
}

impl ApiConfig {
    /// Full URL of the ingestion endpoint.
    pub fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.endpoint)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Static description of the device, copied into every envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub name: String,

    #[serde(rename = "type", default = "default_device_type")]
    pub device_type: String,

    #[serde(default)]
    pub location: String,

    #[serde(default = "default_timezone")]
    pub timezone: String,

    #[serde(default)]
    pub device_id: Option<String>,

    #[serde(default)]
    pub firmware_version: Option<String>,

    #[serde(default)]
    pub hardware_version: Option<String>,
}

impl DeviceConfig {
    /// Configured device id, ignoring blanks and the setup tool's placeholder.
    pub fn stable_device_id(&self) -> Option<&str> {
        self.device_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty() && *id != AUTO_DEVICE_ID)
    }
}

/// Sampling and batching settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataCollectionConfig {
    /// Seconds between two sampling ticks
    #[serde(default = "default_interval")]
    pub interval: u64,

    /// Number of envelopes buffered before a flush is triggered
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Accepted for compatibility; payloads are never compressed
    #[serde(default)]
    pub compression: bool,

    /// Accepted for compatibility; payloads are never encrypted
    #[serde(default)]
    pub encryption: bool,

    /// Overrides `api.retry_attempts` when present
    #[serde(default)]
    pub max_retries: Option<u32>,
}

impl DataCollectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

impl Default for DataCollectionConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            compression: false,
            encryption: false,
            max_retries: None,
        }
    }
}

/// Per-sensor settings, keyed by sensor name in [`Config::sensors`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(rename = "type", default = "default_sensor_type")]
    pub sensor_type: String,

    #[serde(default)]
    pub pin: Option<u32>,

    /// Offset added to every raw reading
    #[serde(default)]
    pub calibration: f64,

    #[serde(default)]
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default tracing filter when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Complete agent configuration.
///
/// The document is produced by the setup tool; unknown sections (network,
/// log rotation, ...) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,

    pub device: DeviceConfig,

    #[serde(default)]
    pub data_collection: DataCollectionConfig,

    #[serde(default)]
    pub sensors: BTreeMap<String, SensorConfig>,

    #[serde(default)]
    pub logging: LoggingConfig,

    /// Static coordinates reported in every envelope
    #[serde(default)]
    pub location: Option<Location>,
}

impl Config {
    /// Parse a configuration document from a JSON string.
    ///
    /// The result is not validated; call [`Config::validate`] before use.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse the configuration document at `path`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Load configuration using environment variables.
    ///
    /// - `LXP_AGENT_CONFIG`: path of the configuration document
    ///   (default: `/etc/lxpcloud-agent/device_config.json`)
    /// - `LXP_AGENT_API_KEY`: overrides `api.api_key`
    /// - `LXP_AGENT_BASE_URL`: overrides `api.base_url`
    /// - `LXP_AGENT_INTERVAL_SECS`: overrides `data_collection.interval`
    /// - `LXP_AGENT_BATCH_SIZE`: overrides `data_collection.batch_size`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file cannot be read or parsed, if an
    /// override is not a valid number, or if the resulting configuration
    /// fails [`Config::validate`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = env::var("LXP_AGENT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::from_file(&path)?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(api_key) = env::var("LXP_AGENT_API_KEY") {
            self.api.api_key = api_key;
        }
        if let Ok(base_url) = env::var("LXP_AGENT_BASE_URL") {
            self.api.base_url = base_url;
        }
        if let Some(interval) = parse_env("LXP_AGENT_INTERVAL_SECS")? {
            self.data_collection.interval = interval;
        }
        if let Some(batch_size) = parse_env("LXP_AGENT_BATCH_SIZE")? {
            self.data_collection.batch_size = batch_size;
        }
        Ok(())
    }

    /// Check ranges and formats the rest of the agent relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api.base_url.trim().is_empty() {
            return Err(ConfigError::invalid("api.base_url", "must not be empty"));
        }
        validate_api_key(&self.api.api_key)?;

        if self.api.timeout == 0 {
            return Err(ConfigError::invalid("api.timeout", "must be greater than 0"));
        }
        if self.retry_attempts() == 0 {
            return Err(ConfigError::invalid(
                "api.retry_attempts",
                "must be greater than 0",
            ));
        }

        let name_len = self.device.name.chars().count();
        if name_len == 0 || name_len > MAX_DEVICE_NAME_LEN {
            return Err(ConfigError::invalid(
                "device.name",
                format!("length must be between 1 and {} characters", MAX_DEVICE_NAME_LEN),
            ));
        }

        let batch_size = self.data_collection.batch_size;
        if batch_size == 0 {
            return Err(ConfigError::invalid(
                "data_collection.batch_size",
                "batch size must be greater than 0",
            ));
        }
        if batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::invalid(
                "data_collection.batch_size",
                format!(
                    "batch size {} exceeds maximum allowed ({})",
                    batch_size, MAX_BATCH_SIZE
                ),
            ));
        }

        let interval = self.data_collection.interval;
        if interval < MIN_INTERVAL_SECS {
            return Err(ConfigError::invalid(
                "data_collection.interval",
                format!("interval {} is below minimum ({}s)", interval, MIN_INTERVAL_SECS),
            ));
        }
        if interval > MAX_INTERVAL_SECS {
            return Err(ConfigError::invalid(
                "data_collection.interval",
                format!("interval {} exceeds maximum ({}s)", interval, MAX_INTERVAL_SECS),
            ));
        }

        Ok(())
    }

    /// Effective number of send attempts per envelope.
    pub fn retry_attempts(&self) -> u32 {
        self.data_collection
            .max_retries
            .unwrap_or(self.api.retry_attempts)
    }
}

fn validate_api_key(api_key: &str) -> Result<(), ConfigError> {
    if api_key.len() < MIN_API_KEY_LEN {
        return Err(ConfigError::invalid(
            "api.api_key",
            format!("must be at least {} characters", MIN_API_KEY_LEN),
        ));
    }
    if !api_key
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ConfigError::invalid(
            "api.api_key",
            "may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(())
}

/// Parse an optional numeric environment variable.
fn parse_env<T: FromStr>(var: &str) -> Result<Option<T>, ConfigError> {
    match env::var(var) {
        Ok(value) => value.trim().parse().map(Some).map_err(|_| ConfigError::Env {
            var: var.to_string(),
            message: format!("'{}' is not a valid number", value),
        }),
        Err(_) => Ok(None),
    }
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_retry_attempts() -> u32 {
    DEFAULT_RETRY_ATTEMPTS
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_device_type() -> String {
    "unknown".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_sensor_type() -> String {
    "generic".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Serializes tests that touch process-wide environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) const SAMPLE_CONFIG: &str = r#"{
        "api": {
            "base_url": "https://app.lexpai.com/api/",
            "endpoint": "/machine.php",
            "api_key": "test_api_key_123",
            "timeout": 15,
            "retry_attempts": 3
        },
        "device": {
            "name": "Press Line 4",
            "type": "raspberry_pi",
            "location": "Hall B",
            "timezone": "Europe/Istanbul",
            "device_id": "auto-generated",
            "firmware_version": "1.2.0"
        },
        "data_collection": {
            "interval": 30,
            "batch_size": 5,
            "compression": true,
            "encryption": false
        },
        "sensors": {
            "temperature": {
                "enabled": true,
                "type": "temperature",
                "pin": 18,
                "calibration": 0.5,
                "thresholds": {"warning_high": 30, "critical_high": 40}
            },
            "humidity": {
                "enabled": false,
                "type": "humidity",
                "pin": 19
            }
        },
        "logging": {"level": "DEBUG", "file": "/var/log/lxpcloud-agent.log"},
        "network": {"wifi_ssid": "", "ethernet_priority": true}
    }"#;

    // Helper to temporarily set environment variables for testing
    struct EnvGuard {
        key: String,
        original: Option<String>,
    }

    impl EnvGuard {
        fn set(key: &str, value: &str) -> Self {
            let original = env::var(key).ok();
            env::set_var(key, value);
            Self {
                key: key.to_string(),
                original,
            }
        }

        fn remove(key: &str) -> Self {
            let original = env::var(key).ok();
            env::remove_var(key);
            Self {
                key: key.to_string(),
                original,
            }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            match &self.original {
                Some(val) => env::set_var(&self.key, val),
                None => env::remove_var(&self.key),
            }
        }
    }

    fn write_fixture(contents: &str) -> PathBuf {
        let path = env::temp_dir().join(format!("lxp-agent-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, contents).expect("fixture should be writable");
        path
    }

    pub(crate) fn sample_config() -> Config {
        Config::from_json(SAMPLE_CONFIG).expect("sample config should parse")
    }

    #[test]
    fn test_parse_sample_config() {
        let config = sample_config();

        assert_eq!(config.api.url(), "https://app.lexpai.com/api/machine.php");
        assert_eq!(config.api.timeout(), Duration::from_secs(15));
        assert_eq!(config.device.device_type, "raspberry_pi");
        assert_eq!(config.data_collection.interval(), Duration::from_secs(30));
        assert_eq!(config.data_collection.batch_size, 5);
        assert!(config.data_collection.compression);
        assert_eq!(config.logging.level, "DEBUG");
        assert!(config.location.is_none());

        let temperature = &config.sensors["temperature"];
        assert!(temperature.enabled);
        assert_eq!(temperature.pin, Some(18));
        assert_eq!(temperature.thresholds.warning_high, Some(30.0));
        assert_eq!(temperature.thresholds.warning_low, None);

        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_defaults_for_missing_sections() {
        let json = r#"{
            "api": {"base_url": "http://localhost:8000", "api_key": "abcdefghij"},
            "device": {"name": "bench"}
        }"#;
        let config = Config::from_json(json).unwrap();

        assert_eq!(config.api.endpoint, "");
        assert_eq!(config.api.timeout, 30);
        assert_eq!(config.retry_attempts(), 3);
        assert_eq!(config.device.device_type, "unknown");
        assert_eq!(config.device.timezone, "UTC");
        assert_eq!(config.data_collection.interval, 60);
        assert_eq!(config.data_collection.batch_size, 10);
        assert!(config.sensors.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_stable_device_id_ignores_placeholder() {
        let mut device = sample_config().device;
        assert_eq!(device.stable_device_id(), None);

        device.device_id = Some("   ".to_string());
        assert_eq!(device.stable_device_id(), None);

        device.device_id = Some("press-04".to_string());
        assert_eq!(device.stable_device_id(), Some("press-04"));
    }

    #[test]
    fn test_max_retries_overrides_retry_attempts() {
        let mut config = sample_config();
        assert_eq!(config.retry_attempts(), 3);

        config.data_collection.max_retries = Some(5);
        assert_eq!(config.retry_attempts(), 5);
    }

    #[test]
    fn test_zero_batch_size() {
        let mut config = sample_config();
        config.data_collection.batch_size = 0;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("greater than 0"));
    }

    #[test]
    fn test_batch_size_exceeds_max() {
        let mut config = sample_config();
        config.data_collection.batch_size = 99_999;

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_interval_bounds() {
        let mut config = sample_config();
        config.data_collection.interval = 0;
        assert!(config.validate().unwrap_err().to_string().contains("below minimum"));

        config.data_collection.interval = 100_000;
        assert!(config.validate().unwrap_err().to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_invalid_api_key() {
        let mut config = sample_config();
        config.api.api_key = "short".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "api.api_key", .. })
        ));

        config.api.api_key = "has spaces in it".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "api.api_key", .. })
        ));
    }

    #[test]
    fn test_invalid_device_name() {
        let mut config = sample_config();
        config.device.name = String::new();
        assert!(config.validate().is_err());

        config.device.name = "x".repeat(101);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_retries_rejected() {
        let mut config = sample_config();
        config.data_collection.max_retries = Some(0);

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("api.retry_attempts"));
    }

    #[test]
    fn test_parse_error() {
        let result = Config::from_json("{ not json");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_missing_file() {
        let result = Config::from_file("/definitely/not/here.json");
        let err = result.unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/definitely/not/here.json"));
    }

    #[test]
    fn test_config_from_env_with_overrides() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let path = write_fixture(SAMPLE_CONFIG);

        let _guard1 = EnvGuard::set("LXP_AGENT_CONFIG", path.to_str().unwrap());
        let _guard2 = EnvGuard::set("LXP_AGENT_BASE_URL", "http://custom:9000/");
        let _guard3 = EnvGuard::set("LXP_AGENT_BATCH_SIZE", "2");
        let _guard4 = EnvGuard::set("LXP_AGENT_INTERVAL_SECS", "5");
        let _guard5 = EnvGuard::remove("LXP_AGENT_API_KEY");

        let config = Config::from_env().expect("Should load with overrides");
        assert_eq!(config.api.url(), "http://custom:9000/machine.php");
        assert_eq!(config.data_collection.batch_size, 2);
        assert_eq!(config.data_collection.interval, 5);
        assert_eq!(config.api.api_key, "test_api_key_123");

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_invalid_env_override() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let path = write_fixture(SAMPLE_CONFIG);

        let _guard1 = EnvGuard::set("LXP_AGENT_CONFIG", path.to_str().unwrap());
        let _guard2 = EnvGuard::set("LXP_AGENT_BATCH_SIZE", "not_a_number");
        let _guard3 = EnvGuard::remove("LXP_AGENT_INTERVAL_SECS");

        let err = Config::from_env().unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error for LXP_AGENT_BATCH_SIZE: 'not_a_number' is not a valid number"
        );

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_env_override_is_validated() {
        let _lock = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let path = write_fixture(SAMPLE_CONFIG);

        let _guard1 = EnvGuard::set("LXP_AGENT_CONFIG", path.to_str().unwrap());
        let _guard2 = EnvGuard::set("LXP_AGENT_BATCH_SIZE", "0");
        let _guard3 = EnvGuard::remove("LXP_AGENT_INTERVAL_SECS");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::Invalid { field: "data_collection.batch_size", .. })
        ));

        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::Invalid {
            field: "api.timeout",
            message: "must be greater than 0".to_string(),
        };
        assert_eq!(
            format!("{}", error),
            "Configuration error for api.timeout: must be greater than 0"
        );
    }
}
