use thiserror::Error;

use crate::types::SensorRole;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("timer #{index}: {reason}")]
    InvalidTimer { index: usize, reason: &'static str },
    #[error("limits for {role:?}: {reason}")]
    InvalidLimits {
        role: SensorRole,
        reason: &'static str,
    },
    #[error("location must be [lat, lon] within [-90, 90] x [-180, 180]")]
    InvalidLocation,
    #[error("motor protection: {0}")]
    InvalidProtection(&'static str),
    #[error("controller {name}: {reason}")]
    InvalidController { name: String, reason: String },
    #[error("duplicate controller name {0}")]
    DuplicateController(String),
    #[error("schedule: {0}")]
    InvalidSchedule(&'static str),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("storage backend: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("unknown controller {0}")]
    UnknownController(String),
    #[error("controller {0} is not running")]
    ControllerStopped(String),
}
