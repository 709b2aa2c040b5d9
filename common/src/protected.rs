//! Motor output with current-sensing overload protection.
//!
//! A run samples the motor current once per [`SAMPLE_INTERVAL`]. A sample
//! above the threshold triggers a reversal cycle: the motor backs off for
//! `reverse_duration`, then resumes in its original direction. A run ends on
//! the first of: retries exhausted, `expired_limit` reached, nominal duration
//! reached, or the completion sensor for the current direction asserted.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::{
    config::ProtectionSettings,
    output::{Actuator, ActuatorOutput},
    ports::{CurrentSensor, InputLine, OutputLine},
    types::{ActivationSource, Direction, MotorState},
};

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProtectionConfig {
    pub overcurrent_threshold: f32,
    pub reverse_duration: Duration,
    pub reverse_delay: Duration,
    pub max_retries: u8,
    pub expired_limit: Option<Duration>,
}

impl From<&ProtectionSettings> for ProtectionConfig {
    fn from(settings: &ProtectionSettings) -> Self {
        Self {
            overcurrent_threshold: settings.overcurrent_threshold,
            reverse_duration: Duration::from_secs(settings.reverse_duration_s),
            reverse_delay: Duration::from_secs(settings.reverse_delay_s),
            max_retries: settings.max_retries,
            expired_limit: settings.expired_limit_s.map(Duration::from_secs),
        }
    }
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self::from(&ProtectionSettings::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    RetriesExhausted,
    Expired,
    DurationElapsed,
    Completed(Direction),
    Deactivated,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RetriesExhausted => "retries exhausted",
            Self::Expired => "expired",
            Self::DurationElapsed => "duration elapsed",
            Self::Completed(_) => "completed",
            Self::Deactivated => "deactivated",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Self::RetriesExhausted | Self::Expired)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub reason: StopReason,
    pub retries: u8,
    /// Running time with reversal cycles excluded.
    pub elapsed_active: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Run {
    started: Instant,
    nominal: Option<Duration>,
    retries: u8,
    reversing_total: Duration,
}

impl Run {
    fn elapsed_active(&self) -> Duration {
        self.started.elapsed().saturating_sub(self.reversing_total)
    }
}

pub struct ProtectedActuator<
    L = Box<dyn OutputLine>,
    C = Box<dyn CurrentSensor>,
    I = Box<dyn InputLine>,
> {
    output: ActuatorOutput<L>,
    reverse_line: L,
    current: Option<C>,
    completion: Option<[I; 2]>,
    config: ProtectionConfig,
    direction: Direction,
    state: MotorState,
    run: Option<Run>,
}

impl<L, C, I> ProtectedActuator<L, C, I>
where
    L: OutputLine,
    C: CurrentSensor,
    I: InputLine,
{
    pub fn new(
        output: ActuatorOutput<L>,
        mut reverse_line: L,
        current: Option<C>,
        completion: Option<[I; 2]>,
        config: ProtectionConfig,
    ) -> Self {
        reverse_line.set(false);
        Self {
            output,
            reverse_line,
            current,
            completion,
            config,
            direction: Direction::Forward,
            state: MotorState::Idle,
            run: None,
        }
    }

    pub fn output(&self) -> &ActuatorOutput<L> {
        &self.output
    }

    pub fn motor_state(&self) -> MotorState {
        self.state
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_running(&self) -> bool {
        self.run.is_some()
    }

    pub fn retries(&self) -> u8 {
        self.run.map(|run| run.retries).unwrap_or(0)
    }

    pub fn set_config(&mut self, config: ProtectionConfig) {
        self.config = config;
    }

    /// Selects the direction of the next (or current) run. Ignored mid-reversal.
    /// A running motor goes through the same de-energize and delay sequence
    /// as a reversal.
    pub async fn set_direction(&mut self, direction: Direction) {
        if self.state == MotorState::Reversing || direction == self.direction {
            return;
        }
        if self.output.is_active() {
            self.switch_direction(direction).await;
            self.state = MotorState::Running(direction);
        } else {
            self.apply_direction(direction);
        }
    }

    /// Adds `source` and starts a run if the motor was idle. `nominal` bounds
    /// the run's active time; `None` runs until another exit condition.
    /// Returns whether a new run began.
    pub fn start(&mut self, source: ActivationSource, nominal: Option<Duration>) -> bool {
        self.output.on(source);
        if !self.output.is_active() || self.run.is_some() {
            return false;
        }
        self.run = Some(Run {
            started: Instant::now(),
            nominal,
            retries: 0,
            reversing_total: Duration::ZERO,
        });
        self.state = MotorState::Running(self.direction);
        info!(
            name = self.output.name(),
            direction = self.direction.as_str(),
            nominal_s = nominal.map(|d| d.as_secs()),
            "protected run started"
        );
        true
    }

    /// Removes `source`. When no source holds the motor any more the run ends
    /// and the direction falls back to forward.
    pub fn stop(&mut self, source: ActivationSource) -> Option<RunReport> {
        self.output.off(source);
        if self.output.is_active() {
            return None;
        }
        self.finish(StopReason::Deactivated)
    }

    /// One monitoring step: sample current, reverse on overload, then check
    /// the exit conditions. Returns the report when the run ended.
    pub async fn tick(&mut self) -> Option<RunReport> {
        self.run?;

        if let Some(amps) = self.current.as_mut().and_then(|sensor| sensor.sample()) {
            debug!(name = self.output.name(), amps, "current sample");
            self.output
                .log()
                .record(&format!("{} current {amps:.2}", self.output.name()));
            if amps > self.config.overcurrent_threshold {
                warn!(
                    name = self.output.name(),
                    amps,
                    threshold = self.config.overcurrent_threshold,
                    "overcurrent, reversing"
                );
                let spent = self.reversal_cycle().await;
                if let Some(run) = self.run.as_mut() {
                    run.retries += 1;
                    run.reversing_total += spent;
                }
            }
        }

        let reason = self.exit_reason()?;
        self.finish(reason)
    }

    fn exit_reason(&mut self) -> Option<StopReason> {
        let run = self.run?;
        if run.retries >= self.config.max_retries {
            return Some(StopReason::RetriesExhausted);
        }
        if let Some(limit) = self.config.expired_limit {
            if run.started.elapsed() > limit {
                return Some(StopReason::Expired);
            }
        }
        if let Some(nominal) = run.nominal {
            if run.elapsed_active() >= nominal {
                return Some(StopReason::DurationElapsed);
            }
        }
        let index = match self.direction {
            Direction::Forward => 0,
            Direction::Reverse => 1,
        };
        let reached = self
            .completion
            .as_mut()
            .is_some_and(|inputs| inputs[index].is_asserted());
        reached.then_some(StopReason::Completed(self.direction))
    }

    /// Backs off and resumes. Returns the wall time spent, which does not
    /// count against the run's nominal duration.
    async fn reversal_cycle(&mut self) -> Duration {
        let began = Instant::now();
        let original = self.direction;
        self.state = MotorState::Reversing;
        self.output
            .log()
            .record(&format!("{} reverse on", self.output.name()));

        self.switch_direction(original.flipped()).await;
        sleep(self.config.reverse_duration).await;
        self.switch_direction(original).await;

        self.state = MotorState::Running(original);
        self.output
            .log()
            .record(&format!("{} reverse off", self.output.name()));
        began.elapsed()
    }

    /// De-energize, wait, flip, wait, re-energize.
    async fn switch_direction(&mut self, direction: Direction) {
        self.output.drive_line(false);
        sleep(self.config.reverse_delay).await;
        self.apply_direction(direction);
        sleep(self.config.reverse_delay).await;
        self.output.drive_line(true);
    }

    fn apply_direction(&mut self, direction: Direction) {
        self.direction = direction;
        self.reverse_line.set(direction == Direction::Reverse);
    }

    fn finish(&mut self, reason: StopReason) -> Option<RunReport> {
        self.output.release_all(reason.as_str());
        if self.direction != Direction::Forward {
            self.apply_direction(Direction::Forward);
        }
        self.state = MotorState::Idle;

        let run = self.run.take()?;
        let report = RunReport {
            reason,
            retries: run.retries,
            elapsed_active: run.elapsed_active(),
        };
        let name = self.output.name();
        if reason.is_failure() {
            warn!(name, retries = report.retries, "protected run aborted: {}", reason.as_str());
            self.output
                .log()
                .record(&format!("{name} failed: {}", reason.as_str()));
        } else {
            info!(
                name,
                retries = report.retries,
                active_s = report.elapsed_active.as_secs(),
                "protected run finished: {}",
                reason.as_str()
            );
        }
        Some(report)
    }
}

impl<L, C, I> Actuator for ProtectedActuator<L, C, I>
where
    L: OutputLine,
    C: CurrentSensor,
    I: InputLine,
{
    fn activate(&mut self, source: ActivationSource) {
        let _ = self.start(source, None);
    }

    fn deactivate(&mut self, source: ActivationSource) {
        self.stop(source);
    }

    fn state(&self) -> bool {
        self.output.is_active()
    }
}
