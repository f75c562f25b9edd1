use std::collections::HashSet;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use serde::Serialize;
use serde_derive::Deserialize;

use crate::error::ConfigError;
use crate::ports::{DEFAULT_AUTO_PORTS, PortSetting};
use crate::presence::Timing;

/// Schema version written by configurations that already respect the interval floors.
pub const CONFIG_SCHEMA_VERSION: u32 = 1;
pub const MIN_NORMAL_INTERVAL_MS: u64 = 3000;
pub const MIN_STRESS_INTERVAL_MS: u64 = 1500;
/// Upper bound for every per-device timing.
pub const MAX_TIMING_MS: u64 = 24 * 60 * 60 * 1000;

const DEFAULT_NORMAL_INTERVAL_MS: u64 = 5000;
const DEFAULT_NORMAL_TIMEOUT_MS: u64 = 2000;
const DEFAULT_STRESS_INTERVAL_MS: u64 = 1500;
const DEFAULT_STRESS_TIMEOUT_MS: u64 = 1000;
const DEFAULT_STRESS_THRESHOLD_MS: u64 = 60_000;
const DEFAULT_AWAY_DELAY_MS: u64 = 300_000;

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: Option<MqttConfig>,
    pub state: Option<StateConfig>,
    pub scan: Option<ScanConfig>,
    #[serde(default)]
    pub devices: Vec<DeviceEntry>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct StateConfig {
    pub path: Option<PathBuf>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub auto_ports: Option<[u16; 2]>,
    pub delivery_timeout_ms: Option<u64>,
    pub consumer_queue: Option<usize>,
}

impl ScanConfig {
    pub fn auto_ports(&self) -> [u16; 2] {
        self.auto_ports.unwrap_or(DEFAULT_AUTO_PORTS)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms.unwrap_or(5000))
    }

    pub fn consumer_queue(&self) -> usize {
        self.consumer_queue.unwrap_or(64).max(1)
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Ok(toml::de::from_str(contents)?)
    }

    /// Migrates and validates every configured device, rejecting duplicates.
    pub fn device_configs(&self) -> Result<Vec<DeviceConfig>, ConfigError> {
        let mut seen = HashSet::new();
        let mut devices = Vec::with_capacity(self.devices.len());
        for entry in &self.devices {
            let device = entry.clone().into_config()?;
            if !seen.insert(device.id.clone()) {
                return Err(ConfigError::DuplicateDevice(device.id));
            }
            devices.push(device);
        }
        Ok(devices)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Port as written in the configuration file: a number or the string `"auto"`.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum RawPort {
    Number(i64),
    Text(String),
}

/// A device as it appears in the configuration file, before migration and validation.
#[derive(Deserialize, Debug, Clone, Default)]
pub struct DeviceEntry {
    pub id: String,
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<RawPort>,
    pub normal_interval_ms: Option<u64>,
    pub normal_timeout_ms: Option<u64>,
    pub stress_interval_ms: Option<u64>,
    pub stress_timeout_ms: Option<u64>,
    pub stress_threshold_ms: Option<u64>,
    pub away_delay_ms: Option<u64>,
    pub is_guest: Option<bool>,
    pub is_kid: Option<bool>,
    pub schema_version: Option<u32>,
}

impl DeviceEntry {
    pub fn new(id: &str, name: &str, host: &str) -> Self {
        Self {
            id: id.to_string(),
            name: Some(name.to_string()),
            host: Some(host.to_string()),
            schema_version: Some(CONFIG_SCHEMA_VERSION),
            ..Self::default()
        }
    }

    /// Upgrades a legacy entry to the current schema. Returns whether anything changed.
    ///
    /// Entries written before interval floors were enforced get their intervals
    /// raised to the floors. Running it on a current entry is a no-op.
    ///
    /// The configuration file is never rewritten, so an unversioned entry is
    /// migrated again on every load and each clamp is logged as a warning.
    pub fn migrate(&mut self) -> bool {
        let version = self.schema_version.unwrap_or(0);
        if version >= CONFIG_SCHEMA_VERSION {
            return false;
        }
        clamp_legacy(
            &self.id,
            "normal_interval_ms",
            &mut self.normal_interval_ms,
            MIN_NORMAL_INTERVAL_MS,
        );
        clamp_legacy(
            &self.id,
            "stress_interval_ms",
            &mut self.stress_interval_ms,
            MIN_STRESS_INTERVAL_MS,
        );
        self.schema_version = Some(CONFIG_SCHEMA_VERSION);
        true
    }

    pub fn into_config(mut self) -> Result<DeviceConfig, ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::MissingId);
        }
        let id = DeviceId::new(self.id.trim());
        if self.migrate() {
            info!("Migrated device {id} to configuration schema v{CONFIG_SCHEMA_VERSION}");
        }

        let name = match self.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => return Err(ConfigError::MissingName { id }),
        };
        let host = match self.host.as_deref().map(str::trim) {
            None | Some("") => return Err(ConfigError::MissingHost { id }),
            Some(host) => host
                .parse::<IpAddr>()
                .map_err(|_| ConfigError::InvalidHost {
                    id: id.clone(),
                    host: host.to_string(),
                })?,
        };
        let port = parse_port(&id, self.port.as_ref())?;

        let normal_interval = self
            .normal_interval_ms
            .unwrap_or(DEFAULT_NORMAL_INTERVAL_MS);
        let stress_interval = self
            .stress_interval_ms
            .unwrap_or(DEFAULT_STRESS_INTERVAL_MS);
        check_floor(&id, "normal_interval_ms", normal_interval, MIN_NORMAL_INTERVAL_MS)?;
        check_floor(&id, "stress_interval_ms", stress_interval, MIN_STRESS_INTERVAL_MS)?;

        let normal_timeout = non_zero(
            &id,
            "normal_timeout_ms",
            self.normal_timeout_ms.unwrap_or(DEFAULT_NORMAL_TIMEOUT_MS),
        )?;
        let stress_timeout = non_zero(
            &id,
            "stress_timeout_ms",
            self.stress_timeout_ms.unwrap_or(DEFAULT_STRESS_TIMEOUT_MS),
        )?;
        let away_delay = non_zero(
            &id,
            "away_delay_ms",
            self.away_delay_ms.unwrap_or(DEFAULT_AWAY_DELAY_MS),
        )?;
        let stress_threshold = self
            .stress_threshold_ms
            .unwrap_or(DEFAULT_STRESS_THRESHOLD_MS);
        for (field, value) in [
            ("normal_interval_ms", normal_interval),
            ("normal_timeout_ms", normal_timeout),
            ("stress_interval_ms", stress_interval),
            ("stress_timeout_ms", stress_timeout),
            ("stress_threshold_ms", stress_threshold),
            ("away_delay_ms", away_delay),
        ] {
            if value > MAX_TIMING_MS {
                return Err(ConfigError::TimingTooLarge {
                    id,
                    field,
                    value,
                    max: MAX_TIMING_MS,
                });
            }
        }

        Ok(DeviceConfig {
            id,
            name,
            host,
            port,
            timing: Timing {
                normal_interval: Duration::from_millis(normal_interval),
                normal_timeout: Duration::from_millis(normal_timeout),
                stress_interval: Duration::from_millis(stress_interval),
                stress_timeout: Duration::from_millis(stress_timeout),
                stress_threshold: Duration::from_millis(stress_threshold),
                away_delay: Duration::from_millis(away_delay),
            },
            is_guest: self.is_guest.unwrap_or(false),
            is_kid: self.is_kid.unwrap_or(false),
        })
    }
}

fn parse_port(id: &DeviceId, port: Option<&RawPort>) -> Result<PortSetting, ConfigError> {
    let invalid = |value: String| ConfigError::InvalidPort {
        id: id.clone(),
        value,
    };
    match port {
        None => Ok(PortSetting::Auto),
        Some(RawPort::Text(text)) if text.eq_ignore_ascii_case("auto") => Ok(PortSetting::Auto),
        Some(RawPort::Text(text)) => match text.trim().parse::<u16>() {
            Ok(port) if port > 0 => Ok(PortSetting::Fixed(port)),
            _ => Err(invalid(text.clone())),
        },
        Some(RawPort::Number(number)) => match u16::try_from(*number) {
            Ok(port) if port > 0 => Ok(PortSetting::Fixed(port)),
            _ => Err(invalid(number.to_string())),
        },
    }
}

fn clamp_legacy(id: &str, field: &str, value: &mut Option<u64>, floor: u64) {
    if let Some(interval) = value.as_mut().filter(|interval| **interval < floor) {
        warn!(
            "Device {id}: raising legacy {field} from {interval}ms to {floor}ms; \
             set schema_version = {CONFIG_SCHEMA_VERSION} once the file is updated"
        );
        *interval = floor;
    }
}

fn check_floor(
    id: &DeviceId,
    field: &'static str,
    value: u64,
    floor: u64,
) -> Result<(), ConfigError> {
    if value < floor {
        return Err(ConfigError::IntervalBelowFloor {
            id: id.clone(),
            field,
            value,
            floor,
        });
    }
    Ok(())
}

fn non_zero(id: &DeviceId, field: &'static str, value: u64) -> Result<u64, ConfigError> {
    if value == 0 {
        return Err(ConfigError::ZeroTiming {
            id: id.clone(),
            field,
        });
    }
    Ok(value)
}

/// Validated configuration of one tracked device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub id: DeviceId,
    pub name: String,
    pub host: IpAddr,
    pub port: PortSetting,
    pub timing: Timing,
    pub is_guest: bool,
    pub is_kid: bool,
}

impl DeviceConfig {
    pub fn is_household_member(&self) -> bool {
        !self.is_guest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config() {
        let config_str = r#"
            [mqtt]
            host = "localhost"
            port = 1883
            username = "user"
            password = "pass"

            [state]
            path = "/var/lib/presence/state.json"

            [scan]
            auto_ports = [32000, 62078]

            [[devices]]
            id = "alice-phone"
            name = "Alice"
            host = "192.168.1.20"
            port = "auto"
            away_delay_ms = 600000
            schema_version = 1

            [[devices]]
            id = "bob-phone"
            name = "Bob"
            host = "192.168.1.21"
            port = 62078
            is_guest = true
        "#;
        let config = AppConfig::parse(config_str).unwrap();
        assert!(config.mqtt.as_ref().unwrap().host == "localhost");
        assert_eq!(config.scan.as_ref().unwrap().auto_ports(), [32000, 62078]);

        let devices = config.device_configs().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].port, PortSetting::Auto);
        assert_eq!(devices[0].timing.away_delay, Duration::from_secs(600));
        assert!(devices[0].is_household_member());
        assert_eq!(devices[1].port, PortSetting::Fixed(62078));
        assert!(devices[1].is_guest);
        assert!(!devices[1].is_household_member());
    }

    #[test]
    fn test_legacy_intervals_are_raised_to_floors() {
        let mut entry = DeviceEntry {
            id: "legacy".to_string(),
            name: Some("Legacy".to_string()),
            host: Some("10.0.0.2".to_string()),
            normal_interval_ms: Some(1000),
            stress_interval_ms: Some(500),
            ..DeviceEntry::default()
        };
        assert!(entry.migrate());
        assert_eq!(entry.normal_interval_ms, Some(MIN_NORMAL_INTERVAL_MS));
        assert_eq!(entry.stress_interval_ms, Some(MIN_STRESS_INTERVAL_MS));
        assert_eq!(entry.schema_version, Some(CONFIG_SCHEMA_VERSION));

        // a second load must not migrate again
        assert!(!entry.migrate());

        let config = entry.into_config().unwrap();
        assert_eq!(config.timing.normal_interval, Duration::from_millis(3000));
    }

    #[test]
    fn test_unversioned_entry_is_clamped_on_every_load() {
        let legacy = DeviceEntry {
            id: "legacy".to_string(),
            name: Some("Legacy".to_string()),
            host: Some("10.0.0.2".to_string()),
            stress_interval_ms: Some(200),
            ..DeviceEntry::default()
        };
        for _ in 0..2 {
            let config = legacy.clone().into_config().unwrap();
            assert_eq!(config.timing.stress_interval, Duration::from_millis(1500));
            assert_eq!(config.timing.normal_interval, Duration::from_millis(5000));
        }
        assert_eq!(legacy.schema_version, None);
    }

    #[test]
    fn test_current_schema_below_floor_is_rejected() {
        let mut entry = DeviceEntry::new("fast", "Fast", "10.0.0.3");
        entry.normal_interval_ms = Some(1000);
        let err = entry.into_config().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::IntervalBelowFloor {
                field: "normal_interval_ms",
                ..
            }
        ));
    }

    #[test]
    fn test_invalid_devices_are_rejected() {
        let no_name = DeviceEntry {
            id: "x".to_string(),
            host: Some("10.0.0.1".to_string()),
            ..DeviceEntry::default()
        };
        assert!(matches!(
            no_name.into_config(),
            Err(ConfigError::MissingName { .. })
        ));

        let bad_host = DeviceEntry::new("x", "X", "phone.local");
        assert!(matches!(
            bad_host.into_config(),
            Err(ConfigError::InvalidHost { .. })
        ));

        let mut bad_port = DeviceEntry::new("x", "X", "10.0.0.1");
        bad_port.port = Some(RawPort::Number(70000));
        assert!(matches!(
            bad_port.into_config(),
            Err(ConfigError::InvalidPort { .. })
        ));

        let mut zero_port = DeviceEntry::new("x", "X", "10.0.0.1");
        zero_port.port = Some(RawPort::Text("0".to_string()));
        assert!(zero_port.into_config().is_err());

        let mut huge_delay = DeviceEntry::new("x", "X", "10.0.0.1");
        huge_delay.away_delay_ms = Some(u64::MAX);
        assert!(matches!(
            huge_delay.into_config(),
            Err(ConfigError::TimingTooLarge {
                field: "away_delay_ms",
                ..
            })
        ));

        let mut huge_threshold = DeviceEntry::new("x", "X", "10.0.0.1");
        huge_threshold.stress_threshold_ms = Some(MAX_TIMING_MS + 1);
        assert!(matches!(
            huge_threshold.into_config(),
            Err(ConfigError::TimingTooLarge {
                field: "stress_threshold_ms",
                ..
            })
        ));

        let mut zero_delay = DeviceEntry::new("x", "X", "10.0.0.1");
        zero_delay.away_delay_ms = Some(0);
        assert!(matches!(
            zero_delay.into_config(),
            Err(ConfigError::ZeroTiming { .. })
        ));
    }

    #[test]
    fn test_duplicate_ids_are_rejected() {
        let config_str = r#"
            [[devices]]
            id = "phone"
            name = "A"
            host = "10.0.0.1"

            [[devices]]
            id = "phone"
            name = "B"
            host = "10.0.0.2"
        "#;
        let config = AppConfig::parse(config_str).unwrap();
        assert!(matches!(
            config.device_configs(),
            Err(ConfigError::DuplicateDevice(_))
        ));
    }
}
