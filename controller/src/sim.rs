//! Host stand-ins for the node's hardware collaborators.

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};

use chrono::{DateTime, FixedOffset, Offset, TimeDelta, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use tracing::info;

use agronode_common::{
    ports::{Clock, EventLog, InputLine, OutputLine, PinLine, PullUpInput, SensorBus, SimPin, Watchdog},
    Hardware, SensorRole,
};

const LOG_CAPACITY: usize = 256;

/// Wall clock in a configurable timezone. `set` stores the offset from the
/// system clock instead of touching it.
pub struct SystemClock {
    timezone: RwLock<Tz>,
    skew: RwLock<TimeDelta>,
}

impl SystemClock {
    pub fn new(timezone: Tz) -> Self {
        Self {
            timezone: RwLock::new(timezone),
            skew: RwLock::new(TimeDelta::zero()),
        }
    }

    pub fn timezone(&self) -> Tz {
        *self.timezone.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_timezone(&self, timezone: Tz) {
        *self.timezone.write().unwrap_or_else(PoisonError::into_inner) = timezone;
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        let skew = *self.skew.read().unwrap_or_else(PoisonError::into_inner);
        let local = (Utc::now() + skew).with_timezone(&self.timezone());
        local.with_timezone(&local.offset().fix())
    }

    fn set(&self, now: DateTime<FixedOffset>) {
        let skew = now.with_timezone(&Utc) - Utc::now();
        *self.skew.write().unwrap_or_else(PoisonError::into_inner) = skew;
        info!(%now, skew_s = skew.num_seconds(), "clock set");
    }
}

/// Latest reading per sensor id, fed from MQTT.
#[derive(Default)]
pub struct MqttSensorBus {
    values: RwLock<HashMap<String, f32>>,
}

impl MqttSensorBus {
    pub fn record(&self, sensor_id: &str, value: f32) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(sensor_id.to_string(), value);
    }
}

impl SensorBus for MqttSensorBus {
    fn read(&self, _role: SensorRole, sensor_id: &str) -> Option<f32> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(sensor_id)
            .copied()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub seq: u64,
    pub at: DateTime<FixedOffset>,
    pub text: String,
}

/// Bounded in-memory queue of event records awaiting upload.
pub struct QueueLog {
    clock: Arc<SystemClock>,
    next_seq: AtomicU64,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl QueueLog {
    pub fn new(clock: Arc<SystemClock>) -> Self {
        Self {
            clock,
            next_seq: AtomicU64::new(1),
            entries: Mutex::new(VecDeque::with_capacity(LOG_CAPACITY)),
        }
    }

    /// Entries newer than `after`, oldest first.
    pub fn since(&self, after: u64) -> Vec<LogEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| entry.seq > after)
            .cloned()
            .collect()
    }
}

impl EventLog for QueueLog {
    fn record(&self, text: &str) {
        info!(target: "agronode::event", "{text}");
        let entry = LogEntry {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            at: self.clock.now(),
            text: text.to_string(),
        };
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() == LOG_CAPACITY {
            entries.pop_front();
        }
        entries.push_back(entry);
    }
}

/// The host has no hardware watchdog; feeds are only counted.
#[derive(Default)]
pub struct CountingWatchdog {
    feeds: AtomicU64,
}

impl CountingWatchdog {
    pub fn feeds(&self) -> u64 {
        self.feeds.load(Ordering::Relaxed)
    }
}

impl Watchdog for CountingWatchdog {
    fn feed(&self) {
        self.feeds.fetch_add(1, Ordering::Relaxed);
    }
}

/// Simulated pins, addressable by line number from the HTTP API.
#[derive(Default)]
pub struct SimHardware {
    outputs: Mutex<BTreeMap<u8, SimPin>>,
    inputs: Mutex<BTreeMap<u8, SimPin>>,
}

impl SimHardware {
    fn output_pin(&self, line: u8) -> SimPin {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(line)
            .or_default()
            .clone()
    }

    fn input_pin(&self, line: u8) -> SimPin {
        self.inputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(line)
            .or_insert_with(|| {
                // Pulled up: idle high.
                let pin = SimPin::default();
                pin.set_level(true);
                pin
            })
            .clone()
    }

    /// Drives a simulated input; `asserted` pulls it low.
    pub fn set_input(&self, line: u8, asserted: bool) {
        self.input_pin(line).set_level(!asserted);
    }

    pub fn output_levels(&self) -> BTreeMap<u8, bool> {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(line, pin)| (*line, pin.level()))
            .collect()
    }
}

impl Hardware for SimHardware {
    fn output(&self, line: u8) -> Box<dyn OutputLine> {
        Box::new(PinLine::new(self.output_pin(line)))
    }

    fn input(&self, line: u8) -> Box<dyn InputLine> {
        Box::new(PullUpInput::new(self.input_pin(line)))
    }
}
