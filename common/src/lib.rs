pub mod climate;
pub mod config;
pub mod controllers;
pub mod device;
pub mod error;
pub mod output;
pub mod ports;
pub mod protected;
pub mod schedule;
pub mod scheduler;
pub mod sun;
pub mod timer;
pub mod topics;
pub mod types;

pub use climate::{ClimateDecisionEngine, ClimateSwitch};
pub use config::{ControllerConfig, DeviceConfig, RuntimeConfig, Settings};
pub use controllers::{Controller, ControllerCommand};
pub use device::{ControlContext, Device, Hardware};
pub use error::{ConfigError, DeviceError, StoreError};
pub use output::{Actuator, ActuatorOutput};
pub use protected::{ProtectedActuator, ProtectionConfig, RunReport, StopReason};
pub use schedule::{Band, Schedule, SharedSchedule};
pub use scheduler::ControlScheduler;
pub use timer::{Timer, TimerTable};
pub use topics::*;
pub use types::{
    ActivationSource, ControllerKind, ControllerSnapshot, Direction, Edge, MotorState, SensorRole,
    SwitchStatus,
};
