use std::{collections::BTreeMap, sync::Arc};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    config::{ClimateConfig, ClimateSensorConfig, ClimateSwitchConfig, Settings},
    output::ActuatorOutput,
    ports::{LogHandle, OutputLine, SensorBus},
    schedule::{Band, Schedule},
    types::{ActivationSource, SensorRole, SwitchStatus},
};

/// Temperature spread between the two sensors that starts the mixing vent.
pub const MIX_ON_DIFF: f32 = 3.0;
pub const MIX_OFF_DIFF: f32 = 1.0;
pub const CO2_LIMIT_PPM: f32 = 2500.0;
/// Margin above the temperature band before air conditioning kicks in.
pub const AC_MARGIN: f32 = 3.0;

const MAX_READINGS_PER_ROLE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClimateSwitch {
    Heat,
    VentMix,
    VentOut,
    Humidifier,
    AirCon,
}

impl ClimateSwitch {
    /// Evaluation order: air conditioning goes before the exhaust vent, which
    /// yields to it.
    pub const ORDER: [ClimateSwitch; 5] = [
        Self::Heat,
        Self::VentMix,
        Self::AirCon,
        Self::VentOut,
        Self::Humidifier,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heat => "heat",
            Self::VentMix => "vent_mix",
            Self::VentOut => "vent_out",
            Self::Humidifier => "humidifier",
            Self::AirCon => "air_con",
        }
    }
}

/// Readings gathered for one cycle, at most two per role, in sensor order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readings {
    pub temperature: Vec<f32>,
    pub humidity: Vec<f32>,
    pub co2: Vec<f32>,
}

impl Readings {
    fn push(&mut self, role: SensorRole, value: f32) {
        let slot = match role {
            SensorRole::Temperature => &mut self.temperature,
            SensorRole::Humidity => &mut self.humidity,
            SensorRole::Co2 => &mut self.co2,
            _ => return,
        };
        if slot.len() < MAX_READINGS_PER_ROLE {
            slot.push(value);
        }
    }

    fn primary_temperature(&self) -> Option<f32> {
        self.temperature.first().copied()
    }

    fn primary_humidity(&self) -> Option<f32> {
        self.humidity.first().copied()
    }

    fn co2(&self) -> Option<f32> {
        self.co2.iter().copied().reduce(f32::max)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Bands {
    pub temperature: Option<Band>,
    pub humidity: Option<Band>,
}

/// Inputs of one switch decision.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInput<'a> {
    pub readings: &'a Readings,
    pub bands: Bands,
    /// Current state of the switch being decided.
    pub current: bool,
    /// Air-conditioning state already decided this cycle.
    pub air_con_on: bool,
}

/// New state for `switch`, or `None` to leave it as it is.
pub fn decide(switch: ClimateSwitch, input: DecisionInput<'_>) -> Option<bool> {
    let readings = input.readings;
    let temperature = readings.primary_temperature();
    let humidity = readings.primary_humidity();

    match switch {
        ClimateSwitch::Heat => {
            let band = input.bands.temperature?;
            Some(temperature? < band.low)
        }
        ClimateSwitch::VentMix => {
            let [a, b] = match readings.temperature.as_slice() {
                [a, b] => [*a, *b],
                _ => return Some(false),
            };
            let diff = (a - b).abs();
            if diff > MIX_ON_DIFF {
                Some(true)
            } else if diff < MIX_OFF_DIFF {
                Some(false)
            } else {
                Some(input.current)
            }
        }
        ClimateSwitch::AirCon => {
            let band = input.bands.temperature?;
            let temperature = temperature?;
            if temperature > band.high + AC_MARGIN {
                Some(true)
            } else if temperature < band.low {
                Some(false)
            } else {
                Some(input.current)
            }
        }
        ClimateSwitch::VentOut => {
            let co2 = readings.co2();
            let humid = humidity
                .zip(input.bands.humidity)
                .map(|(value, band)| value > band.high);
            let hot = temperature
                .zip(input.bands.temperature)
                .map(|(value, band)| value > band.high);
            let stale = co2.map(|value| value > CO2_LIMIT_PPM);

            if humid.is_none() && hot.is_none() && stale.is_none() {
                return None;
            }
            let stale = stale.unwrap_or(false);
            if input.air_con_on && !stale {
                return Some(false);
            }
            Some(humid.unwrap_or(false) || hot.unwrap_or(false) || stale)
        }
        ClimateSwitch::Humidifier => {
            let band = input.bands.humidity?;
            Some(humidity? < band.low)
        }
    }
}

struct ClimateOutput<L> {
    config: ClimateSwitchConfig,
    output: ActuatorOutput<L>,
}

/// Drives the climate switches of one room from its sensors and setpoints.
pub struct ClimateDecisionEngine<L = Box<dyn OutputLine>> {
    name: String,
    sensors: Vec<ClimateSensorConfig>,
    outputs: BTreeMap<ClimateSwitch, ClimateOutput<L>>,
    settings: Arc<Settings>,
    values: BTreeMap<String, Option<f32>>,
}

impl<L: OutputLine> ClimateDecisionEngine<L> {
    pub fn new(
        config: &ClimateConfig,
        mut make_line: impl FnMut(u8) -> L,
        log: LogHandle,
        settings: Arc<Settings>,
    ) -> Self {
        let outputs = config
            .switches
            .iter()
            .map(|(switch, switch_config)| {
                let name = format!("{} {}", config.name, switch.as_str());
                let output = ActuatorOutput::new(name, make_line(switch_config.line), log.clone());
                (
                    *switch,
                    ClimateOutput {
                        config: switch_config.clone(),
                        output,
                    },
                )
            })
            .collect();

        Self {
            name: config.name.clone(),
            sensors: config.sensors.clone(),
            outputs,
            settings,
            values: config
                .sensors
                .iter()
                .map(|sensor| (sensor.id.clone(), None))
                .collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn update_settings(&mut self, settings: Arc<Settings>) {
        self.settings = settings;
    }

    /// Polls every configured sensor; unavailable sensors read as `None`.
    pub fn read(&mut self, bus: &dyn SensorBus) -> Readings {
        let mut readings = Readings::default();
        for sensor in &self.sensors {
            let value = bus.read(sensor.role, &sensor.id).filter(|v| v.is_finite());
            if let Some(value) = value {
                readings.push(sensor.role, value);
            }
            self.values.insert(sensor.id.clone(), value);
        }
        readings
    }

    /// Schedule band for today when present, static limits otherwise.
    pub fn bands(&self, schedule: &Schedule, now: NaiveDateTime) -> Bands {
        let band = |role: SensorRole| {
            schedule
                .band(now, role.as_str())
                .or_else(|| self.settings.static_band(role))
        };
        Bands {
            temperature: band(SensorRole::Temperature),
            humidity: band(SensorRole::Humidity),
        }
    }

    /// One control cycle. Returns the switches whose line changed.
    pub fn adjust(
        &mut self,
        bus: &dyn SensorBus,
        schedule: &Schedule,
        now: NaiveDateTime,
    ) -> Vec<(ClimateSwitch, bool)> {
        let readings = self.read(bus);
        let bands = self.bands(schedule, now);
        let mode = self.settings.mode.clone();
        debug!(name = %self.name, ?readings, ?bands, "climate cycle");

        let mut changes = Vec::new();
        for switch in ClimateSwitch::ORDER {
            let air_con_on = self.is_on(ClimateSwitch::AirCon);
            let Some(entry) = self.outputs.get_mut(&switch) else {
                continue;
            };
            if !entry.config.enabled_in(mode.as_deref()) {
                continue;
            }

            let input = DecisionInput {
                readings: &readings,
                bands,
                current: entry.output.sources().contains(ActivationSource::Climate),
                air_con_on,
            };
            let Some(desired) = decide(switch, input) else {
                continue;
            };
            let changed = if desired {
                entry.output.on(ActivationSource::Climate)
            } else {
                entry.output.off(ActivationSource::Climate)
            };
            if changed {
                changes.push((switch, desired));
            }
        }
        changes
    }

    pub fn output_mut(&mut self, switch: ClimateSwitch) -> Option<&mut ActuatorOutput<L>> {
        self.outputs.get_mut(&switch).map(|entry| &mut entry.output)
    }

    pub fn is_on(&self, switch: ClimateSwitch) -> bool {
        self.outputs
            .get(&switch)
            .is_some_and(|entry| entry.output.is_active())
    }

    /// Latest reading per sensor id.
    pub fn data(&self) -> &BTreeMap<String, Option<f32>> {
        &self.values
    }

    pub fn switches(&self) -> BTreeMap<String, SwitchStatus> {
        let mode = self.settings.mode.as_deref();
        self.outputs
            .iter()
            .map(|(switch, entry)| {
                (
                    switch.as_str().to_string(),
                    SwitchStatus {
                        id: entry.config.id,
                        enabled: entry.config.enabled_in(mode),
                        state: entry.output.is_active(),
                    },
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        ports::testing::{MemoryBus, MemoryLog, RecordingLine},
        schedule::ScheduleParams,
    };

    fn band(low: f32, high: f32) -> Band {
        Band { low, high }
    }

    fn input(readings: &Readings, current: bool) -> DecisionInput<'_> {
        DecisionInput {
            readings,
            bands: Bands {
                temperature: Some(band(20.0, 30.0)),
                humidity: Some(band(40.0, 60.0)),
            },
            current,
            air_con_on: false,
        }
    }

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 5, 2)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    fn switch(id: u32, line: u8) -> ClimateSwitchConfig {
        ClimateSwitchConfig {
            id,
            line,
            enabled: true,
            modes: Vec::new(),
        }
    }

    fn engine(settings: Settings) -> (ClimateDecisionEngine<RecordingLine>, MemoryLog) {
        let config = ClimateConfig {
            name: "barn".to_string(),
            sensors: vec![
                ClimateSensorConfig {
                    id: "t1".to_string(),
                    role: SensorRole::Temperature,
                },
                ClimateSensorConfig {
                    id: "t2".to_string(),
                    role: SensorRole::Temperature,
                },
                ClimateSensorConfig {
                    id: "h1".to_string(),
                    role: SensorRole::Humidity,
                },
                ClimateSensorConfig {
                    id: "c1".to_string(),
                    role: SensorRole::Co2,
                },
            ],
            switches: BTreeMap::from([
                (ClimateSwitch::Heat, switch(1, 10)),
                (ClimateSwitch::VentMix, switch(2, 11)),
                (ClimateSwitch::VentOut, switch(3, 12)),
                (ClimateSwitch::Humidifier, switch(4, 13)),
                (ClimateSwitch::AirCon, switch(5, 14)),
            ]),
        };
        let log = MemoryLog::default();
        let engine = ClimateDecisionEngine::new(
            &config,
            |_| RecordingLine::default(),
            log.handle(),
            Arc::new(settings),
        );
        (engine, log)
    }

    fn settings_with_band() -> Settings {
        Settings {
            limits: BTreeMap::from([
                (SensorRole::Temperature, [25.0, 5.0]),
                (SensorRole::Humidity, [50.0, 10.0]),
            ]),
            ..Settings::default()
        }
    }

    #[test]
    fn heat_follows_band_low() {
        let cold = Readings {
            temperature: vec![19.9],
            ..Readings::default()
        };
        let warm = Readings {
            temperature: vec![20.0],
            ..Readings::default()
        };

        assert_eq!(decide(ClimateSwitch::Heat, input(&cold, false)), Some(true));
        assert_eq!(decide(ClimateSwitch::Heat, input(&warm, true)), Some(false));
        assert_eq!(
            decide(ClimateSwitch::Heat, input(&Readings::default(), true)),
            None
        );
    }

    #[test]
    fn mixing_vent_has_dead_band() {
        let readings = |a: f32, b: f32| Readings {
            temperature: vec![a, b],
            ..Readings::default()
        };

        assert_eq!(
            decide(ClimateSwitch::VentMix, input(&readings(18.0, 25.0), false)),
            Some(true)
        );
        assert_eq!(
            decide(ClimateSwitch::VentMix, input(&readings(20.0, 22.0), true)),
            Some(true)
        );
        assert_eq!(
            decide(ClimateSwitch::VentMix, input(&readings(20.0, 22.0), false)),
            Some(false)
        );
        assert_eq!(
            decide(ClimateSwitch::VentMix, input(&readings(20.0, 20.5), true)),
            Some(false)
        );
        let single = Readings {
            temperature: vec![30.0],
            ..Readings::default()
        };
        assert_eq!(decide(ClimateSwitch::VentMix, input(&single, true)), Some(false));
    }

    #[test]
    fn air_con_needs_margin_and_holds_inside_band() {
        let at = |t: f32| Readings {
            temperature: vec![t],
            ..Readings::default()
        };

        assert_eq!(decide(ClimateSwitch::AirCon, input(&at(33.5), false)), Some(true));
        assert_eq!(decide(ClimateSwitch::AirCon, input(&at(32.0), false)), Some(false));
        assert_eq!(decide(ClimateSwitch::AirCon, input(&at(25.0), true)), Some(true));
        assert_eq!(decide(ClimateSwitch::AirCon, input(&at(19.0), true)), Some(false));
    }

    #[test]
    fn exhaust_vent_reacts_to_any_excess_and_yields_to_air_con() {
        let humid = Readings {
            temperature: vec![25.0],
            humidity: vec![65.0],
            ..Readings::default()
        };
        assert_eq!(decide(ClimateSwitch::VentOut, input(&humid, false)), Some(true));

        let mut with_ac = input(&humid, true);
        with_ac.air_con_on = true;
        assert_eq!(decide(ClimateSwitch::VentOut, with_ac), Some(false));

        let stale = Readings {
            co2: vec![900.0, 2600.0],
            ..Readings::default()
        };
        let mut stale_with_ac = input(&stale, false);
        stale_with_ac.air_con_on = true;
        assert_eq!(decide(ClimateSwitch::VentOut, stale_with_ac), Some(true));

        let fine = Readings {
            temperature: vec![25.0],
            humidity: vec![50.0],
            co2: vec![800.0],
        };
        assert_eq!(decide(ClimateSwitch::VentOut, input(&fine, true)), Some(false));
        assert_eq!(
            decide(ClimateSwitch::VentOut, input(&Readings::default(), true)),
            None
        );
    }

    #[test]
    fn humidifier_turns_on_below_band() {
        let dry = Readings {
            humidity: vec![35.0],
            ..Readings::default()
        };
        assert_eq!(decide(ClimateSwitch::Humidifier, input(&dry, false)), Some(true));
    }

    #[test]
    fn adjust_drives_outputs_from_static_limits() {
        let (mut engine, log) = engine(settings_with_band());
        let bus = MemoryBus::default();
        bus.set("t1", Some(18.0));
        bus.set("t2", Some(25.0));
        bus.set("h1", Some(35.0));

        let changes = engine.adjust(&bus, &Schedule::default(), now());

        assert_eq!(
            changes,
            vec![
                (ClimateSwitch::Heat, true),
                (ClimateSwitch::VentMix, true),
                (ClimateSwitch::Humidifier, true),
            ]
        );
        assert!(log.records().contains(&"barn vent_mix start climate".to_string()));
        assert_eq!(engine.data().get("c1"), Some(&None));
        assert_eq!(engine.data().get("t2"), Some(&Some(25.0)));

        // Nothing changed: no writes, no records.
        let before = log.records().len();
        assert!(engine.adjust(&bus, &Schedule::default(), now()).is_empty());
        assert_eq!(log.records().len(), before);
    }

    #[test]
    fn schedule_band_takes_precedence() {
        let (mut engine, _log) = engine(settings_with_band());
        let schedule = Schedule {
            hash: Some("h".to_string()),
            start: Some(now() - chrono::Duration::days(1)),
            params_list: vec!["temperature".to_string()],
            params: ScheduleParams {
                delta: BTreeMap::from([(0, 1.0)]),
            },
            items: vec![vec![Some(33.0)], vec![Some(32.0)]],
        };
        let bands = engine.bands(&schedule, now());

        assert_eq!(bands.temperature, Some(band(31.0, 33.0)));
        assert_eq!(bands.humidity, Some(band(40.0, 60.0)));

        let bus = MemoryBus::default();
        bus.set("t1", Some(30.0));
        engine.adjust(&bus, &schedule, now());
        assert!(engine.is_on(ClimateSwitch::Heat));
    }

    #[test]
    fn disabled_switch_is_left_alone() {
        let mut settings = settings_with_band();
        settings.mode = Some("summer".to_string());
        let (mut engine, _log) = engine(settings);
        engine.outputs.get_mut(&ClimateSwitch::Heat).unwrap().config.modes =
            vec!["winter".to_string()];
        engine
            .output_mut(ClimateSwitch::Heat)
            .unwrap()
            .on(ActivationSource::Manual);

        let bus = MemoryBus::default();
        bus.set("t1", Some(26.0));
        engine.adjust(&bus, &Schedule::default(), now());

        // Warm enough to stop heating, but the switch is not enabled in this mode.
        assert!(engine.is_on(ClimateSwitch::Heat));
        let status = engine.switches();
        assert_eq!(
            status.get("heat"),
            Some(&SwitchStatus {
                id: 1,
                enabled: false,
                state: true,
            })
        );
    }
}
