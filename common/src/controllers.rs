//! One cooperative task per configured controller.
//!
//! Each task owns its outputs exclusively. Everything else reaches it through
//! a [`ControllerCommand`] channel and reads its state back from a
//! [`ControllerSnapshot`] watch channel.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use tokio::{
    sync::{mpsc, watch},
    time::{sleep_until, Instant},
};
use tracing::{info, warn};

use crate::{
    climate::{ClimateDecisionEngine, ClimateSwitch},
    config::{ControllerConfig, MotorConfig, Settings},
    device::{ControlContext, Hardware},
    output::{Actuator, ActuatorOutput},
    ports::{BusCurrentSensor, CurrentSensor},
    protected::{ProtectedActuator, ProtectionConfig, SAMPLE_INTERVAL},
    scheduler::{ControlScheduler, SwitchMode},
    types::{ActivationSource, ControllerKind, ControllerSnapshot, Direction, Edge, SwitchStatus},
};

#[derive(Debug, Clone)]
pub enum ControllerCommand {
    /// Manual on/off. `target` picks a climate switch; other controllers
    /// have a single output and expect `None`.
    Switch {
        target: Option<ClimateSwitch>,
        on: bool,
    },
    /// Button edge; for motors index 0 runs forward and index 1 in reverse.
    Button { index: usize, edge: Edge },
    UpdateSettings(Arc<Settings>),
}

pub struct RelaySwitchController {
    scheduler: ControlScheduler,
    output: ActuatorOutput,
}

pub struct MotorController {
    scheduler: ControlScheduler,
    motor: ProtectedActuator,
    scheduled: Option<bool>,
    /// The scheduled run carries its own nominal duration and ends itself.
    bounded: bool,
    next_tick: Option<Instant>,
}

pub struct ClimateController {
    engine: ClimateDecisionEngine,
    interval: Duration,
}

pub enum Controller {
    RelaySwitch(RelaySwitchController),
    Gate(MotorController),
    Feeder(MotorController),
    Climate(ClimateController),
}

impl Controller {
    pub fn build(
        config: &ControllerConfig,
        settings: Arc<Settings>,
        ctx: &ControlContext,
        hardware: &dyn Hardware,
    ) -> Self {
        match config {
            ControllerConfig::RelaySwitch(conf) => {
                let mode = SwitchMode::new(&conf.timers_param, conf.schedule_params.as_ref());
                Self::RelaySwitch(RelaySwitchController {
                    scheduler: ControlScheduler::new(&conf.name, mode, settings),
                    output: ActuatorOutput::new(
                        &conf.name,
                        hardware.output(conf.line),
                        ctx.log.clone(),
                    ),
                })
            }
            ControllerConfig::Gate(conf) => {
                Self::Gate(MotorController::new(conf, settings, ctx, hardware))
            }
            ControllerConfig::Feeder(conf) => {
                Self::Feeder(MotorController::new(conf, settings, ctx, hardware))
            }
            ControllerConfig::Climate(conf) => Self::Climate(ClimateController {
                interval: Duration::from_secs(settings.climate_interval_s),
                engine: ClimateDecisionEngine::new(
                    conf,
                    |line| hardware.output(line),
                    ctx.log.clone(),
                    settings,
                ),
            }),
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

    pub fn name(&self) -> &str {
        match self {
            Self::RelaySwitch(relay) => relay.output.name(),
            Self::Gate(motor) | Self::Feeder(motor) => motor.motor.output().name(),
            Self::Climate(climate) => climate.engine.name(),
        }
    }

    pub fn snapshot(&self) -> ControllerSnapshot {
        let single = |name: &str, state: bool| {
            BTreeMap::from([(
                name.to_string(),
                SwitchStatus {
                    id: 0,
                    enabled: true,
                    state,
                },
            )])
        };
        let mut snapshot = ControllerSnapshot {
            kind: Some(self.kind()),
            ..ControllerSnapshot::default()
        };
        match self {
            Self::RelaySwitch(relay) => {
                snapshot.switches = single(relay.output.name(), relay.output.is_active());
            }
            Self::Gate(motor) | Self::Feeder(motor) => {
                let output = motor.motor.output();
                snapshot.switches = single(output.name(), output.is_active());
                snapshot.motor_state = Some(motor.motor.motor_state());
            }
            Self::Climate(climate) => {
                snapshot.switches = climate.engine.switches();
                snapshot.data = climate.engine.data().clone();
            }
        }
        snapshot
    }

    /// Runs until the command channel closes.
    pub async fn run(
        mut self,
        ctx: ControlContext,
        mut commands: mpsc::Receiver<ControllerCommand>,
        snapshots: watch::Sender<ControllerSnapshot>,
    ) {
        info!(name = self.name(), kind = self.kind().as_str(), "controller started");
        let mut next_cycle = Instant::now();

        loop {
            ctx.watchdog.feed();
            if Instant::now() >= next_cycle {
                next_cycle = Instant::now() + self.cycle(&ctx);
            }
            if let Self::Gate(motor) | Self::Feeder(motor) = &mut self {
                motor.poll_run().await;
            }
            snapshots.send_replace(self.snapshot());

            let wake = match self.next_tick() {
                Some(tick) => tick.min(next_cycle),
                None => next_cycle,
            };
            tokio::select! {
                _ = sleep_until(wake) => {}
                command = commands.recv() => match command {
                    Some(command) => {
                        if self.handle(command).await {
                            next_cycle = Instant::now();
                        }
                    }
                    None => break,
                },
            }
        }
        info!(name = self.name(), "controller stopped");
    }

    /// One evaluation. Returns how long to wait before the next one.
    fn cycle(&mut self, ctx: &ControlContext) -> Duration {
        let now = ctx.clock.now();
        let schedule = ctx.schedule.snapshot();
        match self {
            Self::RelaySwitch(relay) => {
                let eval = relay.scheduler.evaluate(now, &schedule);
                if let Some(desired) = eval.desired {
                    relay.output.set_source(desired.source, desired.on);
                }
                eval.sleep
            }
            Self::Gate(motor) | Self::Feeder(motor) => {
                let eval = motor.scheduler.evaluate(now, &schedule);
                if let Some(desired) = eval.desired {
                    motor.follow(desired.source, desired.on, desired.remaining);
                }
                eval.sleep
            }
            Self::Climate(climate) => {
                climate
                    .engine
                    .adjust(ctx.sensors.as_ref(), &schedule, now.naive_local());
                climate.interval
            }
        }
    }

    fn next_tick(&self) -> Option<Instant> {
        match self {
            Self::Gate(motor) | Self::Feeder(motor) => motor.next_tick,
            _ => None,
        }
    }

    /// Applies a command. Returns whether the next cycle should run now.
    async fn handle(&mut self, command: ControllerCommand) -> bool {
        let name = self.name().to_string();
        match (self, command) {
            (this, ControllerCommand::UpdateSettings(settings)) => {
                info!(%name, "settings updated");
                match this {
                    Self::RelaySwitch(relay) => relay.scheduler.update_settings(settings),
                    Self::Gate(motor) | Self::Feeder(motor) => motor.update_settings(settings),
                    Self::Climate(climate) => {
                        climate.interval = Duration::from_secs(settings.climate_interval_s);
                        climate.engine.update_settings(settings);
                    }
                }
                true
            }
            (Self::RelaySwitch(relay), ControllerCommand::Switch { target: None, on }) => {
                relay.output.set_source(ActivationSource::Manual, on);
                false
            }
            (Self::RelaySwitch(relay), ControllerCommand::Button { index: 0, edge }) => {
                relay.output.button_edge(edge);
                false
            }
            (Self::Gate(motor) | Self::Feeder(motor), ControllerCommand::Switch { target: None, on }) => {
                motor.manual(on, None).await;
                false
            }
            (Self::Gate(motor) | Self::Feeder(motor), ControllerCommand::Button { index, edge })
                if index < 2 =>
            {
                let direction = if index == 0 {
                    Direction::Forward
                } else {
                    Direction::Reverse
                };
                motor.manual(edge == Edge::Falling, Some(direction)).await;
                false
            }
            (Self::Climate(climate), ControllerCommand::Switch { target: Some(switch), on }) => {
                match climate.engine.output_mut(switch) {
                    Some(output) => output.set_source(ActivationSource::Manual, on),
                    None => warn!(%name, switch = switch.as_str(), "no such climate switch"),
                }
                false
            }
            (_, command) => {
                warn!(%name, ?command, "command not supported by this controller");
                false
            }
        }
    }
}

impl MotorController {
    fn new(
        conf: &MotorConfig,
        settings: Arc<Settings>,
        ctx: &ControlContext,
        hardware: &dyn Hardware,
    ) -> Self {
        let current = conf.current_sensor.as_ref().map(|id| {
            Box::new(BusCurrentSensor::new(ctx.sensors.clone(), id.as_str()))
                as Box<dyn CurrentSensor>
        });
        let completion = conf
            .completion_sensors
            .map(|[forward, reverse]| [hardware.input(forward), hardware.input(reverse)]);
        let motor = ProtectedActuator::new(
            ActuatorOutput::new(&conf.name, hardware.output(conf.line), ctx.log.clone()),
            hardware.output(conf.reverse_line),
            current,
            completion,
            ProtectionConfig::from(&settings.protection),
        );
        let mode = SwitchMode::new(&conf.timers_param, conf.schedule_params.as_ref());

        Self {
            scheduler: ControlScheduler::new(&conf.name, mode, settings),
            motor,
            scheduled: None,
            bounded: false,
            next_tick: None,
        }
    }

    pub fn motor(&self) -> &ProtectedActuator {
        &self.motor
    }

    fn update_settings(&mut self, settings: Arc<Settings>) {
        self.motor
            .set_config(ProtectionConfig::from(&settings.protection));
        self.scheduler.update_settings(settings);
    }

    /// Starts a run when the timer or band opens. A run started with a
    /// nominal duration ends on its active time, so reversals do not cut it
    /// short; latched and band runs stop when the timer or band closes. A run
    /// that already ended is not restarted until the next opening.
    fn follow(&mut self, source: ActivationSource, on: bool, remaining: Option<Duration>) {
        if self.scheduled == Some(on) {
            return;
        }
        self.scheduled = Some(on);
        if on {
            let started = self.motor.start(source, remaining);
            self.bounded = started && remaining.is_some();
        } else if !self.bounded {
            self.motor.stop(source);
        }
    }

    async fn manual(&mut self, on: bool, direction: Option<Direction>) {
        if !on {
            self.motor.deactivate(ActivationSource::Manual);
            return;
        }
        if let Some(direction) = direction {
            self.motor.set_direction(direction).await;
        }
        self.motor.activate(ActivationSource::Manual);
    }

    async fn poll_run(&mut self) {
        if !self.motor.is_running() {
            self.next_tick = None;
            return;
        }
        let now = Instant::now();
        match self.next_tick {
            None => self.next_tick = Some(now + SAMPLE_INTERVAL),
            Some(due) if now >= due => {
                if let Some(report) = self.motor.tick().await {
                    info!(
                        name = self.motor.output().name(),
                        reason = report.reason.as_str(),
                        retries = report.retries,
                        "run ended"
                    );
                }
                self.next_tick = self
                    .motor
                    .is_running()
                    .then(|| Instant::now() + SAMPLE_INTERVAL);
            }
            Some(_) => {}
        }
    }
}
