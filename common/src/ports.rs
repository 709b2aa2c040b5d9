//! Boundaries to the collaborators this crate does not implement: wall clock,
//! sensor bus, settings storage, event log, watchdog and the I/O lines.

use std::{convert::Infallible, sync::Arc};

use chrono::{DateTime, FixedOffset};
use embedded_hal::digital::{InputPin, OutputPin};
use tracing::warn;

use crate::{config::Settings, error::StoreError, schedule::Schedule, types::SensorRole};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;
    fn set(&self, now: DateTime<FixedOffset>);
}

pub trait SensorBus: Send + Sync {
    fn read(&self, role: SensorRole, sensor_id: &str) -> Option<f32>;
}

pub trait SettingsStore: Send + Sync {
    fn load(&self) -> Result<Settings, StoreError>;
    fn save(&self, settings: &Settings) -> Result<(), StoreError>;
    fn load_schedule(&self) -> Result<Schedule, StoreError>;
    fn save_schedule(&self, schedule: &Schedule) -> Result<(), StoreError>;
}

pub trait EventLog: Send + Sync {
    fn record(&self, text: &str);
}

pub type LogHandle = Arc<dyn EventLog>;

pub trait Watchdog: Send + Sync {
    fn feed(&self);
}

/// A digital output driving a relay or motor driver input.
pub trait OutputLine: Send {
    fn set(&mut self, on: bool);
}

impl OutputLine for Box<dyn OutputLine> {
    fn set(&mut self, on: bool) {
        (**self).set(on);
    }
}

/// A digital input such as a limit switch; `true` means asserted.
pub trait InputLine: Send {
    fn is_asserted(&mut self) -> bool;
}

impl InputLine for Box<dyn InputLine> {
    fn is_asserted(&mut self) -> bool {
        (**self).is_asserted()
    }
}

/// Latest motor current draw in amperes.
pub trait CurrentSensor: Send {
    fn sample(&mut self) -> Option<f32>;
}

impl CurrentSensor for Box<dyn CurrentSensor> {
    fn sample(&mut self) -> Option<f32> {
        (**self).sample()
    }
}

/// Reads the motor current through the shared sensor bus.
pub struct BusCurrentSensor {
    bus: Arc<dyn SensorBus>,
    sensor_id: String,
}

impl BusCurrentSensor {
    pub fn new(bus: Arc<dyn SensorBus>, sensor_id: impl Into<String>) -> Self {
        Self {
            bus,
            sensor_id: sensor_id.into(),
        }
    }
}

impl CurrentSensor for BusCurrentSensor {
    fn sample(&mut self) -> Option<f32> {
        self.bus.read(SensorRole::Current, &self.sensor_id)
    }
}

/// Output line on an `embedded-hal` pin.
pub struct PinLine<P> {
    pin: P,
}

impl<P: OutputPin> PinLine<P> {
    pub fn new(pin: P) -> Self {
        Self { pin }
    }
}

impl<P: OutputPin + Send> OutputLine for PinLine<P> {
    fn set(&mut self, on: bool) {
        let result = if on {
            self.pin.set_high()
        } else {
            self.pin.set_low()
        };
        if let Err(err) = result {
            warn!("output pin write failed: {err:?}");
        }
    }
}

/// Active-low input with pull-up, the way limit switches and buttons are wired.
pub struct PullUpInput<P> {
    pin: P,
}

impl<P: InputPin> PullUpInput<P> {
    pub fn new(pin: P) -> Self {
        Self { pin }
    }
}

impl<P: InputPin + Send> InputLine for PullUpInput<P> {
    fn is_asserted(&mut self) -> bool {
        match self.pin.is_low() {
            Ok(low) => low,
            Err(err) => {
                warn!("input pin read failed: {err:?}");
                false
            }
        }
    }
}

/// Software stand-in for a pin, shared between the line and whoever drives it.
#[derive(Debug, Clone, Default)]
pub struct SimPin {
    level: Arc<std::sync::atomic::AtomicBool>,
}

impl SimPin {
    pub fn level(&self) -> bool {
        self.level.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn set_level(&self, high: bool) {
        self.level.store(high, std::sync::atomic::Ordering::Relaxed);
    }
}

impl embedded_hal::digital::ErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.set_level(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.set_level(true);
        Ok(())
    }
}

impl InputPin for SimPin {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.level())
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(!self.level())
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pin_adapters_follow_sim_pin_level() {
        let pin = SimPin::default();
        let mut line = PinLine::new(pin.clone());
        let mut input = PullUpInput::new(pin.clone());

        line.set(true);
        assert!(pin.level());
        // Pulled-up input reads high: not asserted.
        assert!(!input.is_asserted());

        line.set(false);
        assert!(input.is_asserted());
    }
}
