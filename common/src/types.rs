use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationSource {
    Manual,
    Timer,
    ScheduleBand,
    Climate,
}

impl ActivationSource {
    pub const ALL: [ActivationSource; 4] = [
        Self::Manual,
        Self::Timer,
        Self::ScheduleBand,
        Self::Climate,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Timer => "timer",
            Self::ScheduleBand => "schedule",
            Self::Climate => "climate",
        }
    }

    fn bit(self) -> u8 {
        match self {
            Self::Manual => 0b0001,
            Self::Timer => 0b0010,
            Self::ScheduleBand => 0b0100,
            Self::Climate => 0b1000,
        }
    }
}

impl fmt::Display for ActivationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Set of activation reasons currently holding an output on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSet(u8);

impl SourceSet {
    pub fn insert(&mut self, source: ActivationSource) -> bool {
        let before = self.0;
        self.0 |= source.bit();
        before != self.0
    }

    pub fn remove(&mut self, source: ActivationSource) -> bool {
        let before = self.0;
        self.0 &= !source.bit();
        before != self.0
    }

    pub fn contains(self, source: ActivationSource) -> bool {
        self.0 & source.bit() != 0
    }

    pub fn any(self) -> bool {
        self.0 != 0
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub fn iter(self) -> impl Iterator<Item = ActivationSource> {
        ActivationSource::ALL
            .into_iter()
            .filter(move |source| self.contains(*source))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Forward,
    Reverse,
}

impl Direction {
    pub fn flipped(self) -> Self {
        match self {
            Self::Forward => Self::Reverse,
            Self::Reverse => Self::Forward,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Reverse => "reverse",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "direction", rename_all = "snake_case")]
pub enum MotorState {
    Idle,
    Running(Direction),
    Reversing,
}

impl MotorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Running(Direction::Forward) => "RUNNING_FORWARD",
            Self::Running(Direction::Reverse) => "RUNNING_REVERSE",
            Self::Reversing => "REVERSING",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorRole {
    Temperature,
    Humidity,
    Co2,
    Pressure,
    Current,
    Voltage,
}

impl SensorRole {
    /// Parameter name used for this role in synced schedules.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Humidity => "humidity",
            Self::Co2 => "co2",
            Self::Pressure => "pressure",
            Self::Current => "current",
            Self::Voltage => "voltage",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerKind {
    RelaySwitch,
    Gate,
    Feeder,
    Climate,
}

impl ControllerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RelaySwitch => "relay_switch",
            Self::Gate => "gate",
            Self::Feeder => "feeder",
            Self::Climate => "climate",
        }
    }
}

/// Half of a button press, as delivered by the (already debounced) input driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    /// Line pulled low: button pressed.
    Falling,
    /// Line released.
    Rising,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SwitchStatus {
    pub id: u32,
    pub enabled: bool,
    pub state: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ControllerSnapshot {
    pub kind: Option<ControllerKind>,
    pub switches: std::collections::BTreeMap<String, SwitchStatus>,
    pub data: std::collections::BTreeMap<String, Option<f32>>,
    #[serde(rename = "motorState", skip_serializing_if = "Option::is_none")]
    pub motor_state: Option<MotorState>,
}
