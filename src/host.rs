//! Host metadata attached to every sampling round.
//!
//! System metrics come from `sysinfo`; network identity is resolved once when
//! the probe is created; location and ambient environment are static.

use std::collections::BTreeMap;
use std::net::{IpAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tracing::debug;

use crate::sensor::Reading;

const FALLBACK_LATITUDE: f64 = 41.0082;
const FALLBACK_LONGITUDE: f64 = 28.9784;
const FALLBACK_ALTITUDE: f64 = 100.0;

/// Geographic position of the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub altitude: f64,
}

impl Default for Location {
    fn default() -> Self {
        Self {
            latitude: FALLBACK_LATITUDE,
            longitude: FALLBACK_LONGITUDE,
            altitude: FALLBACK_ALTITUDE,
        }
    }
}

/// Ambient conditions around the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    pub ambient_temperature: f64,
    pub ambient_humidity: f64,
}

impl Default for Environment {
    fn default() -> Self {
        Self {
            ambient_temperature: 22.0,
            ambient_humidity: 45.0,
        }
    }
}

/// Network identity of the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub hostname: String,
    pub ip_address: String,
    pub connection_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal_strength: Option<i32>,
}

impl Default for NetworkInfo {
    fn default() -> Self {
        Self {
            hostname: "unknown".to_string(),
            ip_address: "0.0.0.0".to_string(),
            connection_type: "ethernet".to_string(),
            signal_strength: None,
        }
    }
}

impl NetworkInfo {
    /// Resolve the local hostname and its first address.
    ///
    /// Falls back to `unknown` / `0.0.0.0` when either lookup fails.
    pub fn resolve() -> Self {
        let hostname = match hostname::get() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                debug!(error = %e, "Failed to read hostname");
                return Self::default();
            }
        };

        let ip_address = (hostname.as_str(), 0)
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.find(|addr| matches!(addr.ip(), IpAddr::V4(_))))
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "0.0.0.0".to_string());

        Self {
            hostname,
            ip_address,
            ..Self::default()
        }
    }
}

/// Source of host-level metadata for a sampling round.
///
/// Every call is a cheap local lookup; none of them may block on the network.
pub trait HostProbe: Send {
    /// System metrics keyed by metric name.
    fn metrics(&mut self) -> BTreeMap<String, Reading>;

    fn location(&self) -> Location;

    fn environment(&self) -> Environment;

    fn network(&self) -> NetworkInfo;
}

/// [`HostProbe`] backed by the running operating system.
pub struct SystemHost {
    system: System,
    location: Location,
    network: NetworkInfo,
}

impl SystemHost {
    pub fn new(location: Location) -> Self {
        let mut system = System::new();
        system.refresh_cpu_all();
        Self {
            system,
            location,
            network: NetworkInfo::resolve(),
        }
    }

    fn disk_usage() -> f64 {
        let disks = Disks::new_with_refreshed_list();
        let (total, available) = disks
            .iter()
            .filter(|disk| disk.mount_point() == std::path::Path::new("/"))
            .fold((0u64, 0u64), |(total, available), disk| {
                (total + disk.total_space(), available + disk.available_space())
            });
        percent(total.saturating_sub(available), total)
    }
}

impl HostProbe for SystemHost {
    fn metrics(&mut self) -> BTreeMap<String, Reading> {
        self.system.refresh_cpu_all();
        self.system.refresh_memory();

        let mut metrics = BTreeMap::new();
        metrics.insert(
            "cpu_usage".to_string(),
            Reading::plain(f64::from(self.system.global_cpu_usage()), "%"),
        );
        metrics.insert(
            "memory_usage".to_string(),
            Reading::plain(
                percent(self.system.used_memory(), self.system.total_memory()),
                "%",
            ),
        );
        metrics.insert(
            "disk_usage".to_string(),
            Reading::plain(Self::disk_usage(), "%"),
        );
        metrics
    }

    fn location(&self) -> Location {
        self.location.clone()
    }

    fn environment(&self) -> Environment {
        Environment::default()
    }

    fn network(&self) -> NetworkInfo {
        self.network.clone()
    }
}

fn percent(used: u64, total: u64) -> f64 {
    if total > 0 {
        (used as f64 / total as f64) * 100.0
    } else {
        0.0
    }
}
