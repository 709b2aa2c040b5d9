use std::{sync::Arc, time::Duration};

use chrono::{DateTime, FixedOffset, NaiveDate, Timelike};
use tracing::{info, warn};

use crate::{
    config::Settings,
    schedule::Schedule,
    sun::{sun_times, SunTimes},
    timer::{TimerTable, DAY_SECONDS},
    types::ActivationSource,
};

const CYCLE_SECONDS: u32 = 60;

/// What the evaluated rule wants the output to do right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Desired {
    pub on: bool,
    pub source: ActivationSource,
    /// Remaining on-time of the rule that switched on; `None` when open ended.
    pub remaining: Option<Duration>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// `None` leaves the output untouched.
    pub desired: Option<Desired>,
    pub sleep: Duration,
}

/// Where an output's on/off times come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchMode {
    /// A timer list in the settings.
    Timers { param: String },
    /// The day's `[on, off]` times from two schedule parameters.
    ScheduleBand { params: [String; 2] },
}

impl SwitchMode {
    pub fn new(timers_param: &str, schedule_params: Option<&[String; 2]>) -> Self {
        match schedule_params {
            Some(params) => Self::ScheduleBand {
                params: params.clone(),
            },
            None => Self::Timers {
                param: timers_param.to_string(),
            },
        }
    }
}

/// State of a `[low, high)` time band at `now`, handling bands that wrap
/// past midnight. A band with a single bound only ever switches one way.
pub fn band_state(low: Option<u32>, high: Option<u32>, now: u32) -> Option<bool> {
    match (low, high) {
        (Some(low), Some(high)) if low < high => Some(low <= now && now < high),
        (Some(low), Some(high)) if low > high => Some(now >= low || now < high),
        (Some(_), Some(_)) => Some(false),
        (Some(low), None) => (now >= low).then_some(true),
        (None, Some(high)) => (now >= high).then_some(false),
        (None, None) => None,
    }
}

/// Minute-aligned evaluation of one output's timers or schedule band.
#[derive(Debug)]
pub struct ControlScheduler {
    name: String,
    mode: SwitchMode,
    settings: Arc<Settings>,
    table: TimerTable,
    resolved_for: Option<NaiveDate>,
}

impl ControlScheduler {
    pub fn new(name: impl Into<String>, mode: SwitchMode, settings: Arc<Settings>) -> Self {
        Self {
            name: name.into(),
            mode,
            settings,
            table: TimerTable::default(),
            resolved_for: None,
        }
    }

    pub fn mode(&self) -> &SwitchMode {
        &self.mode
    }

    pub fn table(&self) -> &TimerTable {
        &self.table
    }

    /// Takes effect on the next evaluation; timers are rebuilt then.
    pub fn update_settings(&mut self, settings: Arc<Settings>) {
        self.settings = settings;
        self.resolved_for = None;
    }

    /// Rebuilds the timer table for the day of `now`, resolving sun anchors.
    pub fn init_timers(&mut self, now: DateTime<FixedOffset>) {
        let date = now.date_naive();
        self.resolved_for = Some(date);

        let SwitchMode::Timers { param } = &self.mode else {
            return;
        };
        let sun = self.sun_times(date, now.offset().local_minus_utc());
        let confs = self.settings.timers_for(param);
        self.table = match TimerTable::build(confs, sun) {
            Ok(table) => table,
            Err((index, reason)) => {
                warn!(name = %self.name, index, "timer rejected: {reason}");
                TimerTable::default()
            }
        };
        let dropped = confs.len() - self.table.timers().len();
        info!(
            name = %self.name,
            %date,
            timers = self.table.timers().len(),
            dropped,
            "timers initialised"
        );
    }

    fn sun_times(&self, date: NaiveDate, utc_offset_s: i32) -> Option<SunTimes> {
        let location = self.settings.sun_location()?;
        sun_times(date, location, utc_offset_s)
    }

    pub fn evaluate(&mut self, now: DateTime<FixedOffset>, schedule: &Schedule) -> Evaluation {
        if self.resolved_for != Some(now.date_naive()) {
            self.init_timers(now);
        }

        let seconds = now.num_seconds_from_midnight();
        let to_minute = CYCLE_SECONDS - now.second().min(CYCLE_SECONDS - 1);

        let (desired, boundary) = match &self.mode {
            SwitchMode::Timers { .. } => {
                let desired = self.table.authoritative(seconds).map(|active| {
                    let on = active.is_on();
                    Desired {
                        on,
                        source: ActivationSource::Timer,
                        remaining: on
                            .then(|| active.remaining())
                            .flatten()
                            .map(|s| Duration::from_secs(u64::from(s))),
                    }
                });
                (desired, self.table.next_boundary(seconds))
            }
            SwitchMode::ScheduleBand { params } => {
                let time = |name: &str| {
                    schedule
                        .value(now.naive_local(), name)
                        .filter(|v| v.is_finite() && *v >= 0.0)
                        .map(|v| (v as u32).min(DAY_SECONDS - 1))
                };
                let low = time(&params[0]);
                let high = time(&params[1]);
                let desired = band_state(low, high, seconds).map(|on| Desired {
                    on,
                    source: ActivationSource::ScheduleBand,
                    remaining: None,
                });
                let boundary = [low, high]
                    .into_iter()
                    .flatten()
                    .map(|edge| (edge + DAY_SECONDS - seconds) % DAY_SECONDS)
                    .filter(|delta| *delta > 0)
                    .min();
                (desired, boundary)
            }
        };

        let sleep_s = boundary.map_or(to_minute, |b| b.min(to_minute));
        Evaluation {
            desired,
            sleep: Duration::from_secs(u64::from(sleep_s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::TimerConf,
        schedule::ScheduleParams,
        timer::SunAnchor,
    };

    fn at(seconds: u32) -> DateTime<FixedOffset> {
        let offset = FixedOffset::east_opt(3 * 3600).unwrap();
        offset
            .with_ymd_and_hms(2026, 6, 21, 0, 0, 0)
            .unwrap()
            + chrono::Duration::seconds(i64::from(seconds))
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

    fn timers(list: Vec<TimerConf>) -> ControlScheduler {
        let settings = Settings {
            timers: list,
            ..Settings::default()
        };
        ControlScheduler::new(
            "light",
            SwitchMode::new("timers", None),
            Arc::new(settings),
        )
    }

    fn state(scheduler: &mut ControlScheduler, seconds: u32) -> Option<bool> {
        scheduler
            .evaluate(at(seconds), &Schedule::default())
            .desired
            .map(|d| d.on)
    }

    #[test]
    fn window_timer_switches_at_its_edges() {
        let mut scheduler = timers(vec![window(3600, 7200)]);

        assert_eq!(state(&mut scheduler, 3599), Some(false));
        assert_eq!(state(&mut scheduler, 3600), Some(true));
        assert_eq!(state(&mut scheduler, 5000), Some(true));
        assert_eq!(state(&mut scheduler, 7200), Some(false));
    }

    #[test]
    fn timer_mode_reports_remaining_span() {
        let mut scheduler = timers(vec![window(3600, 7200)]);

        let eval = scheduler.evaluate(at(5000), &Schedule::default());
        assert_eq!(
            eval.desired,
            Some(Desired {
                on: true,
                source: ActivationSource::Timer,
                remaining: Some(Duration::from_secs(2200)),
            })
        );
    }

    #[test]
    fn sleep_aligns_to_minute_and_short_pulses() {
        let mut scheduler = timers(vec![window(3600, 7200), window(3630, 3700)]);

        // 10s into the minute: 50s to the next minute.
        assert_eq!(
            scheduler.evaluate(at(1210), &Schedule::default()).sleep,
            Duration::from_secs(50)
        );
        // A timer 20s ahead shortens the sleep.
        assert_eq!(
            scheduler.evaluate(at(3610), &Schedule::default()).sleep,
            Duration::from_secs(20)
        );
    }

    #[test]
    fn empty_timer_list_leaves_output_alone() {
        let mut scheduler = timers(Vec::new());

        let eval = scheduler.evaluate(at(100), &Schedule::default());
        assert_eq!(eval.desired, None);
        assert_eq!(eval.sleep, Duration::from_secs(20));
    }

    #[test]
    fn sun_timers_are_resolved_per_day_and_reloaded_on_settings() {
        let mut conf = window(0, 23 * 3600);
        conf.sun = SunAnchor::Sunrise;
        let mut scheduler = timers(vec![conf]);

        scheduler.evaluate(at(12 * 3600), &Schedule::default());
        assert!(scheduler.table().is_empty());

        let settings = Settings {
            timers: scheduler.settings.timers.clone(),
            location: Some([55.75, 37.62]),
            timezone: Some("Europe/Moscow".to_string()),
            ..Settings::default()
        };
        scheduler.update_settings(Arc::new(settings));
        scheduler.evaluate(at(12 * 3600), &Schedule::default());

        let sunrise = scheduler.table().timers()[0].time_on();
        assert!((3 * 3600..5 * 3600).contains(&sunrise), "sunrise at {sunrise}");

        // Next day rebuilds the table.
        scheduler.evaluate(at(DAY_SECONDS + 60), &Schedule::default());
        assert_eq!(
            scheduler.resolved_for,
            Some(NaiveDate::from_ymd_opt(2026, 6, 22).unwrap())
        );
    }

    #[test]
    fn band_state_handles_wraparound() {
        assert_eq!(band_state(Some(100), Some(200), 150), Some(true));
        assert_eq!(band_state(Some(100), Some(200), 200), Some(false));
        assert_eq!(band_state(Some(100), Some(200), 50), Some(false));

        assert_eq!(band_state(Some(80_000), Some(3_600), 85_000), Some(true));
        assert_eq!(band_state(Some(80_000), Some(3_600), 1_000), Some(true));
        assert_eq!(band_state(Some(80_000), Some(3_600), 50_000), Some(false));

        assert_eq!(band_state(Some(100), None, 50), None);
        assert_eq!(band_state(Some(100), None, 150), Some(true));
        assert_eq!(band_state(None, Some(100), 150), Some(false));
        assert_eq!(band_state(None, None, 150), None);
    }

    #[test]
    fn schedule_band_mode_uses_current_day_times() {
        let schedule = Schedule {
            hash: Some("x".to_string()),
            start: Some(at(0).naive_local()),
            params_list: vec!["light_on".to_string(), "light_off".to_string()],
            params: ScheduleParams {
                delta: BTreeMap::new(),
            },
            items: vec![vec![Some(21_600.0), Some(79_200.0)]],
        };
        let mut scheduler = ControlScheduler::new(
            "light",
            SwitchMode::new(
                "timers",
                Some(&["light_on".to_string(), "light_off".to_string()]),
            ),
            Arc::new(Settings::default()),
        );

        let eval = scheduler.evaluate(at(21_590), &schedule);
        assert_eq!(eval.desired.map(|d| d.on), Some(false));
        assert_eq!(eval.sleep, Duration::from_secs(10));

        let eval = scheduler.evaluate(at(30_000), &schedule);
        assert_eq!(
            eval.desired,
            Some(Desired {
                on: true,
                source: ActivationSource::ScheduleBand,
                remaining: None,
            })
        );

        // No schedule synced yet: leave the output alone.
        assert_eq!(
            scheduler.evaluate(at(30_000), &Schedule::default()).desired,
            None
        );
    }
}
