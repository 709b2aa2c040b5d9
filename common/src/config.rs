use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{
    climate::ClimateSwitch,
    error::ConfigError,
    schedule::Band,
    timer::{SunAnchor, Timer},
    types::{ControllerKind, SensorRole},
};

pub const DEFAULT_TIMERS_PARAM: &str = "timers";

fn default_timers_param() -> String {
    DEFAULT_TIMERS_PARAM.to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerConf {
    /// Seconds since midnight, or a signed offset when `sun` is set.
    pub on: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<u32>,
    /// Minutes between pulses inside `[on, off)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<u32>,
    #[serde(default)]
    pub sun: SunAnchor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionSettings {
    #[serde(rename = "reverse_threshold")]
    pub overcurrent_threshold: f32,
    #[serde(rename = "reverse_duration")]
    pub reverse_duration_s: u64,
    #[serde(rename = "reverse_delay")]
    pub reverse_delay_s: u64,
    pub max_retries: u8,
    #[serde(rename = "expired_limit", default)]
    pub expired_limit_s: Option<u64>,
}

impl Default for ProtectionSettings {
    fn default() -> Self {
        Self {
            overcurrent_threshold: 2.0,
            reverse_duration_s: 5,
            reverse_delay_s: 2,
            max_retries: 3,
            expired_limit_s: None,
        }
    }
}

impl ProtectionSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.overcurrent_threshold.is_finite() || self.overcurrent_threshold <= 0.0 {
            return Err(ConfigError::InvalidProtection(
                "reverse_threshold must be a positive number",
            ));
        }
        if self.max_retries == 0 {
            return Err(ConfigError::InvalidProtection("max_retries must be >= 1"));
        }
        if self.expired_limit_s == Some(0) {
            return Err(ConfigError::InvalidProtection("expired_limit must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub timers: Vec<TimerConf>,
    /// Additional timer lists addressed by a controller's `timers_param`.
    #[serde(default)]
    pub timer_sets: BTreeMap<String, Vec<TimerConf>>,
    /// `[center, tolerance]` per role.
    #[serde(default)]
    pub limits: BTreeMap<SensorRole, [f32; 2]>,
    #[serde(default)]
    pub location: Option<[f64; 2]>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub protection: ProtectionSettings,
    #[serde(rename = "sleep", default = "default_climate_interval")]
    pub climate_interval_s: u64,
}

fn default_climate_interval() -> u64 {
    30
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            mode: None,
            timers: Vec::new(),
            timer_sets: BTreeMap::new(),
            limits: BTreeMap::from([
                (SensorRole::Temperature, [27.0, 7.0]),
                (SensorRole::Humidity, [45.0, 15.0]),
            ]),
            location: None,
            timezone: None,
            protection: ProtectionSettings::default(),
            climate_interval_s: default_climate_interval(),
        }
    }
}

impl Settings {
    pub fn timers_for(&self, param: &str) -> &[TimerConf] {
        if param == DEFAULT_TIMERS_PARAM {
            return &self.timers;
        }
        self.timer_sets
            .get(param)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn static_band(&self, role: SensorRole) -> Option<Band> {
        self.limits
            .get(&role)
            .map(|[center, tolerance]| Band::around(*center, *tolerance))
    }

    /// Sun-anchored timers need both a location and a timezone.
    pub fn sun_location(&self) -> Option<[f64; 2]> {
        let timezone_set = self
            .timezone
            .as_deref()
            .map(|tz| !tz.trim().is_empty())
            .unwrap_or(false);
        if timezone_set {
            self.location
        } else {
            None
        }
    }

    pub fn sanitize(&mut self) {
        self.climate_interval_s = self.climate_interval_s.clamp(5, 3_600);
        if let Some(mode) = &self.mode {
            let trimmed = mode.trim();
            self.mode = if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let lists = std::iter::once(&self.timers).chain(self.timer_sets.values());
        for list in lists {
            for (index, conf) in list.iter().enumerate() {
                Timer::from_conf(conf).map_err(|reason| ConfigError::InvalidTimer { index, reason })?;
            }
        }

        for (role, [center, tolerance]) in &self.limits {
            if !center.is_finite() || !tolerance.is_finite() {
                return Err(ConfigError::InvalidLimits {
                    role: *role,
                    reason: "values must be finite",
                });
            }
            if *tolerance < 0.0 {
                return Err(ConfigError::InvalidLimits {
                    role: *role,
                    reason: "tolerance must not be negative",
                });
            }
        }

        if let Some([lat, lon]) = self.location {
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                return Err(ConfigError::InvalidLocation);
            }
        }

        self.protection.validate()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelaySwitchConfig {
    pub name: String,
    pub line: u8,
    #[serde(default = "default_timers_param")]
    pub timers_param: String,
    /// Schedule parameters holding the day's `[on, off]` times.
    #[serde(default)]
    pub schedule_params: Option<[String; 2]>,
    /// Manual push button input.
    #[serde(default)]
    pub button: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotorConfig {
    pub name: String,
    pub line: u8,
    pub reverse_line: u8,
    #[serde(default = "default_timers_param")]
    pub timers_param: String,
    #[serde(default)]
    pub schedule_params: Option<[String; 2]>,
    /// Sensor id sampled as motor current.
    #[serde(default)]
    pub current_sensor: Option<String>,
    /// `[forward, reverse]` manual button inputs.
    #[serde(default)]
    pub buttons: Option<[u8; 2]>,
    /// `[fully forward, fully reverse]` limit switch inputs.
    #[serde(default)]
    pub completion_sensors: Option<[u8; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimateSensorConfig {
    pub id: String,
    pub role: SensorRole,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimateSwitchConfig {
    pub id: u32,
    pub line: u8,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Profiles this switch runs in; empty means all.
    #[serde(default)]
    pub modes: Vec<String>,
}

impl ClimateSwitchConfig {
    pub fn enabled_in(&self, mode: Option<&str>) -> bool {
        if !self.enabled {
            return false;
        }
        match mode {
            Some(mode) if !self.modes.is_empty() => self.modes.iter().any(|m| m == mode),
            _ => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClimateConfig {
    pub name: String,
    pub sensors: Vec<ClimateSensorConfig>,
    pub switches: BTreeMap<ClimateSwitch, ClimateSwitchConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ControllerConfig {
    RelaySwitch(RelaySwitchConfig),
    Gate(MotorConfig),
    Feeder(MotorConfig),
    Climate(ClimateConfig),
}

impl ControllerConfig {
    pub fn name(&self) -> &str {
        match self {
            Self::RelaySwitch(conf) => &conf.name,
            Self::Gate(conf) | Self::Feeder(conf) => &conf.name,
            Self::Climate(conf) => &conf.name,
        }
    }

    pub fn kind(&self) -> ControllerKind {
        match self {
            Self::RelaySwitch(_) => ControllerKind::RelaySwitch,
            Self::Gate(_) => ControllerKind::Gate,
            Self::Feeder(_) => ControllerKind::Feeder,
            Self::Climate(_) => ControllerKind::Climate,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidController {
            name: self.name().to_string(),
            reason: reason.to_string(),
        };

        if self.name().trim().is_empty() {
            return Err(invalid("name cannot be empty"));
        }

        match self {
            Self::RelaySwitch(conf) => {
                if conf.timers_param.trim().is_empty() {
                    return Err(invalid("timers_param cannot be empty"));
                }
            }
            Self::Gate(conf) | Self::Feeder(conf) => {
                if conf.line == conf.reverse_line {
                    return Err(invalid("line and reverse_line must differ"));
                }
                if conf.timers_param.trim().is_empty() {
                    return Err(invalid("timers_param cannot be empty"));
                }
                if let Some([forward, reverse]) = conf.buttons {
                    if forward == reverse {
                        return Err(invalid("forward and reverse buttons must differ"));
                    }
                }
            }
            Self::Climate(conf) => {
                if conf.switches.is_empty() {
                    return Err(invalid("at least one switch is required"));
                }
                let mut lines = BTreeSet::new();
                for switch in conf.switches.values() {
                    if !lines.insert(switch.line) {
                        return Err(invalid("switch lines must be unique"));
                    }
                }
                let mut ids = BTreeSet::new();
                for sensor in &conf.sensors {
                    if sensor.id.trim().is_empty() || !ids.insert(sensor.id.as_str()) {
                        return Err(invalid("sensor ids must be unique and non-empty"));
                    }
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    #[serde(default)]
    pub controllers: Vec<ControllerConfig>,
}

impl DeviceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut names = BTreeSet::new();
        for controller in &self.controllers {
            controller.validate()?;
            if !names.insert(controller.name()) {
                return Err(ConfigError::DuplicateController(
                    controller.name().to_string(),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub settings: Settings,
}

impl RuntimeConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.device.validate()?;
        self.settings.validate()
    }
}
