use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    config::{ControllerConfig, DeviceConfig, Settings},
    controllers::{Controller, ControllerCommand},
    error::DeviceError,
    ports::{Clock, InputLine, LogHandle, OutputLine, SensorBus, SettingsStore, Watchdog},
    schedule::{Schedule, SharedSchedule},
    types::{ControllerKind, ControllerSnapshot, Edge, SwitchStatus},
};

const COMMAND_QUEUE: usize = 16;

/// Collaborators handed to every controller.
#[derive(Clone)]
pub struct ControlContext {
    pub clock: Arc<dyn Clock>,
    pub sensors: Arc<dyn SensorBus>,
    pub store: Arc<dyn SettingsStore>,
    pub log: LogHandle,
    pub watchdog: Arc<dyn Watchdog>,
    pub schedule: SharedSchedule,
}

/// Maps configured line numbers to physical (or simulated) I/O.
pub trait Hardware: Send + Sync {
    fn output(&self, line: u8) -> Box<dyn OutputLine>;
    fn input(&self, line: u8) -> Box<dyn InputLine>;
}

struct ControllerHandle {
    kind: ControllerKind,
    commands: mpsc::Sender<ControllerCommand>,
    snapshot: watch::Receiver<ControllerSnapshot>,
    task: JoinHandle<()>,
}

/// The running node: one task per controller plus the shared settings.
pub struct Device {
    ctx: ControlContext,
    settings: RwLock<Arc<Settings>>,
    controllers: BTreeMap<String, ControllerHandle>,
    /// Button input line -> (controller, button index).
    buttons: BTreeMap<u8, (String, usize)>,
}

impl Device {
    /// Spawns the controller tasks. Must be called inside a tokio runtime.
    pub fn spawn(
        config: &DeviceConfig,
        mut settings: Settings,
        ctx: ControlContext,
        hardware: &dyn Hardware,
    ) -> Result<Self, DeviceError> {
        config.validate()?;
        settings.sanitize();
        settings.validate()?;
        let settings = Arc::new(settings);

        let mut controllers = BTreeMap::new();
        let mut buttons = BTreeMap::new();
        for controller_config in &config.controllers {
            let name = controller_config.name().to_string();
            match controller_config {
                ControllerConfig::RelaySwitch(relay) => {
                    if let Some(line) = relay.button {
                        buttons.insert(line, (name.clone(), 0));
                    }
                }
                ControllerConfig::Gate(motor) | ControllerConfig::Feeder(motor) => {
                    if let Some([forward, reverse]) = motor.buttons {
                        buttons.insert(forward, (name.clone(), 0));
                        buttons.insert(reverse, (name.clone(), 1));
                    }
                }
                ControllerConfig::Climate(_) => {}
            }

            let controller = Controller::build(controller_config, settings.clone(), &ctx, hardware);
            let (commands, receiver) = mpsc::channel(COMMAND_QUEUE);
            let (snapshots, snapshot) = watch::channel(controller.snapshot());
            let kind = controller.kind();
            let task = tokio::spawn(controller.run(ctx.clone(), receiver, snapshots));

            controllers.insert(
                name,
                ControllerHandle {
                    kind,
                    commands,
                    snapshot,
                    task,
                },
            );
        }
        info!(controllers = controllers.len(), "device started");

        Ok(Self {
            ctx,
            settings: RwLock::new(settings),
            controllers,
            buttons,
        })
    }

    pub fn context(&self) -> &ControlContext {
        &self.ctx
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn controller_kinds(&self) -> BTreeMap<String, ControllerKind> {
        self.controllers
            .iter()
            .map(|(name, handle)| (name.clone(), handle.kind))
            .collect()
    }

    /// Validates, persists and broadcasts new settings. A failed save is
    /// logged; the new settings stay in effect.
    pub async fn update_settings(&self, mut settings: Settings) -> Result<Arc<Settings>, DeviceError> {
        settings.sanitize();
        settings.validate()?;

        if let Err(err) = self.ctx.store.save(&settings) {
            warn!("failed to persist settings: {err}");
            self.ctx.log.record(&format!("settings not saved: {err}"));
        }

        let settings = Arc::new(settings);
        *self.settings.write().unwrap_or_else(PoisonError::into_inner) = settings.clone();
        for (name, handle) in &self.controllers {
            let command = ControllerCommand::UpdateSettings(settings.clone());
            if handle.commands.send(command).await.is_err() {
                warn!(%name, "controller gone, settings not delivered");
            }
        }
        info!("settings applied");
        Ok(settings)
    }

    /// Swaps in a synced schedule. Persistence failures are logged only.
    pub fn replace_schedule(&self, schedule: Schedule) -> Result<(), DeviceError> {
        schedule.validate()?;
        if self.ctx.schedule.snapshot().is_current(schedule.hash.as_deref(), schedule.start) {
            info!("schedule unchanged");
            return Ok(());
        }
        if let Err(err) = self.ctx.schedule.replace(schedule, self.ctx.store.as_ref()) {
            self.ctx.log.record(&format!("schedule not saved: {err}"));
        }
        Ok(())
    }

    pub async fn command(&self, name: &str, command: ControllerCommand) -> Result<(), DeviceError> {
        let handle = self
            .controllers
            .get(name)
            .ok_or_else(|| DeviceError::UnknownController(name.to_string()))?;
        handle
            .commands
            .send(command)
            .await
            .map_err(|_| DeviceError::ControllerStopped(name.to_string()))
    }

    /// Routes a debounced edge on a button input line to its controller.
    pub async fn button_edge(&self, line: u8, edge: Edge) -> Result<(), DeviceError> {
        let Some((name, index)) = self.buttons.get(&line) else {
            warn!(line, "edge on unassigned button line");
            return Ok(());
        };
        self.command(name, ControllerCommand::Button { index: *index, edge })
            .await
    }

    pub fn snapshots(&self) -> BTreeMap<String, ControllerSnapshot> {
        self.controllers
            .iter()
            .map(|(name, handle)| (name.clone(), handle.snapshot.borrow().clone()))
            .collect()
    }

    /// Latest sensor readings across all climate controllers.
    pub fn data(&self) -> BTreeMap<String, Option<f32>> {
        self.controllers
            .values()
            .flat_map(|handle| handle.snapshot.borrow().data.clone())
            .collect()
    }

    /// `controller -> switch -> status` for every output.
    pub fn switches(&self) -> BTreeMap<String, BTreeMap<String, SwitchStatus>> {
        self.controllers
            .iter()
            .map(|(name, handle)| (name.clone(), handle.snapshot.borrow().switches.clone()))
            .collect()
    }

    pub fn shutdown(self) {
        for (name, handle) in self.controllers {
            drop(handle.commands);
            if !handle.task.is_finished() {
                info!(%name, "stopping controller");
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{FixedOffset, TimeZone};
    use pretty_assertions::assert_eq;

    use super::{testing::*, *};
    use crate::{
        config::{MotorConfig, RelaySwitchConfig, TimerConf, DEFAULT_TIMERS_PARAM},
        error::ConfigError,
        ports::testing::MemoryStore,
        schedule::ScheduleParams,
        timer::SunAnchor,
        types::{Direction, MotorState},
    };

    fn noon() -> chrono::DateTime<FixedOffset> {
        FixedOffset::east_opt(0)
            .unwrap()
            .with_ymd_and_hms(2026, 4, 1, 12, 0, 0)
            .unwrap()
    }

    fn device_config() -> DeviceConfig {
        DeviceConfig {
            controllers: vec![
                ControllerConfig::RelaySwitch(RelaySwitchConfig {
                    name: "light".to_string(),
                    line: 4,
                    timers_param: DEFAULT_TIMERS_PARAM.to_string(),
                    schedule_params: None,
                    button: Some(32),
                }),
                ControllerConfig::Gate(MotorConfig {
                    name: "gate".to_string(),
                    line: 5,
                    reverse_line: 6,
                    timers_param: "gate_timers".to_string(),
                    schedule_params: None,
                    current_sensor: None,
                    buttons: Some([30, 31]),
                    completion_sensors: Some([20, 21]),
                }),
            ],
        }
    }

    fn window(on: i32, off: u32) -> TimerConf {
        TimerConf {
            on,
            off: Some(off),
            duration: None,
            period: None,
            sun: SunAnchor::None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn manual_switch_and_settings_reload() {
        let (ctx, rig) = context(noon());
        let hardware = TestHardware::default();
        let device = Device::spawn(&device_config(), Settings::default(), ctx, &hardware).unwrap();

        device
            .command(
                "light",
                ControllerCommand::Switch {
                    target: None,
                    on: true,
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(hardware.line(4).level());
        assert!(device.switches()["light"]["light"].state);

        // A timer window around noon adds a second source; manual off keeps it on.
        let settings = Settings {
            timers: vec![window(11 * 3600, 13 * 3600)],
            ..Settings::default()
        };
        device.update_settings(settings.clone()).await.unwrap();
        device
            .command(
                "light",
                ControllerCommand::Switch {
                    target: None,
                    on: false,
                },
            )
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(hardware.line(4).level());
        assert_eq!(rig.store.saved_settings(), Some(settings));
        assert_eq!(device.settings().timers.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rejects_invalid_settings_and_unknown_controllers() {
        let (ctx, rig) = context(noon());
        let device =
            Device::spawn(&device_config(), Settings::default(), ctx, &TestHardware::default())
                .unwrap();

        let mut settings = Settings::default();
        settings.timers.push(TimerConf {
            on: 90_000,
            off: Some(10),
            duration: None,
            period: None,
            sun: SunAnchor::None,
        });
        let err = device.update_settings(settings).await.unwrap_err();
        assert!(matches!(
            err,
            DeviceError::Config(ConfigError::InvalidTimer { index: 0, .. })
        ));
        assert_eq!(rig.store.saved_settings(), None);

        let err = device
            .command(
                "pump",
                ControllerCommand::Switch {
                    target: None,
                    on: true,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::UnknownController(name) if name == "pump"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_save_keeps_settings_in_memory() {
        let (ctx, rig) = context_with_store(noon(), MemoryStore::failing());
        let device =
            Device::spawn(&device_config(), Settings::default(), ctx, &TestHardware::default())
                .unwrap();

        let settings = Settings {
            mode: Some("brooding".to_string()),
            ..Settings::default()
        };
        device.update_settings(settings).await.unwrap();

        assert_eq!(device.settings().mode.as_deref(), Some("brooding"));
        assert!(rig
            .log
            .records()
            .iter()
            .any(|record| record.starts_with("settings not saved")));
    }

    #[tokio::test(start_paused = true)]
    async fn button_lines_drive_gate_direction() {
        let (ctx, _rig) = context(noon());
        let hardware = TestHardware::default();
        let device = Device::spawn(&device_config(), Settings::default(), ctx, &hardware).unwrap();

        device.button_edge(31, Edge::Falling).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            device.snapshots()["gate"].motor_state,
            Some(MotorState::Running(Direction::Reverse))
        );

        // Fully-reverse limit switch closes.
        hardware.pin(21).set_level(false);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(device.snapshots()["gate"].motor_state, Some(MotorState::Idle));
        assert!(!hardware.line(5).level());

        // Unassigned lines are ignored.
        device.button_edge(99, Edge::Falling).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn relay_button_holds_output_while_pressed() {
        let (ctx, rig) = context(noon());
        let hardware = TestHardware::default();
        let device = Device::spawn(&device_config(), Settings::default(), ctx, &hardware).unwrap();

        device.button_edge(32, Edge::Falling).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(hardware.line(4).level());

        device.button_edge(32, Edge::Rising).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!hardware.line(4).level());
        let records = rig.log.records();
        assert!(records.contains(&"light start manual".to_string()));
        assert!(records.contains(&"light stop manual".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn schedule_replacement_is_persisted_once() {
        let (ctx, rig) = context(noon());
        let device =
            Device::spawn(&device_config(), Settings::default(), ctx, &TestHardware::default())
                .unwrap();
        let schedule = Schedule {
            hash: Some("v1".to_string()),
            start: Some(noon().naive_local()),
            params_list: vec!["temperature".to_string()],
            params: ScheduleParams::default(),
            items: vec![vec![Some(30.0)]],
        };

        device.replace_schedule(schedule.clone()).unwrap();
        assert_eq!(rig.store.saved_schedule(), Some(schedule.clone()));
        assert!(device
            .context()
            .schedule
            .snapshot()
            .is_current(Some("v1"), schedule.start));

        let mut bad = schedule;
        bad.hash = Some("v2".to_string());
        bad.items = vec![vec![Some(1.0), Some(2.0)]];
        assert!(device.replace_schedule(bad).is_err());
        assert_eq!(
            device.context().schedule.snapshot().hash.as_deref(),
            Some("v1")
        );
    }
}
