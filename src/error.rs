use thiserror::Error;

use crate::config::DeviceId;

/// A device or file configuration that cannot be scheduled.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("device {id}: name must not be empty")]
    MissingName { id: DeviceId },
    #[error("device id must not be empty")]
    MissingId,
    #[error("device {id}: host is missing")]
    MissingHost { id: DeviceId },
    #[error("device {id}: {host:?} is not an IP address")]
    InvalidHost { id: DeviceId, host: String },
    #[error("device {id}: invalid port {value}")]
    InvalidPort { id: DeviceId, value: String },
    #[error("device {id}: {field} is {value}ms, minimum is {floor}ms")]
    IntervalBelowFloor {
        id: DeviceId,
        field: &'static str,
        value: u64,
        floor: u64,
    },
    #[error("device {id}: {field} is {value}ms, maximum is {max}ms")]
    TimingTooLarge {
        id: DeviceId,
        field: &'static str,
        value: u64,
        max: u64,
    },
    #[error("device {id}: {field} must be greater than zero")]
    ZeroTiming { id: DeviceId, field: &'static str },
    #[error("device {0} is configured more than once")]
    DuplicateDevice(DeviceId),
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("state file io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file is not valid json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("device {0} is not tracked")]
    UnknownDevice(DeviceId),
    #[error("device {0} is already tracked")]
    AlreadyTracked(DeviceId),
    #[error("presence hub has stopped")]
    Stopped,
}
