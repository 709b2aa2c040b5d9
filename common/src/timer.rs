use serde::{Deserialize, Serialize};

use crate::{config::TimerConf, sun::SunTimes};

pub const DAY_SECONDS: u32 = 86_400;
/// Longest interval period: one pulse a day.
pub const MAX_PERIOD_MIN: u32 = 24 * 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SunAnchor {
    #[default]
    None,
    Sunrise,
    Sunset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerRule {
    /// On inside `[time_on, off)`, wrapping past midnight when `off < time_on`.
    Window { off: u32 },
    /// On for `duration` seconds from `time_on`; `0` latches until superseded.
    Pulse { duration: u32 },
    /// Pulses of `duration` seconds every `period_min` minutes inside the window.
    Interval {
        off: u32,
        duration: u32,
        period_min: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timer {
    time_on: u32,
    rule: TimerRule,
    sun: SunAnchor,
    offset: i32,
}

impl Timer {
    pub fn from_conf(conf: &TimerConf) -> Result<Self, &'static str> {
        if conf.sun == SunAnchor::None && !(0..DAY_SECONDS as i32).contains(&conf.on) {
            return Err("on must be within a day");
        }
        if conf.sun != SunAnchor::None && conf.on.unsigned_abs() >= DAY_SECONDS {
            return Err("sun offset must be shorter than a day");
        }
        if conf.off.is_some_and(|off| off >= DAY_SECONDS) {
            return Err("off must be within a day");
        }

        let rule = match (conf.off, conf.duration, conf.period) {
            (Some(off), Some(duration), Some(period_min)) => {
                if period_min == 0 || period_min > MAX_PERIOD_MIN {
                    return Err("period must be between 1 and 1440 minutes");
                }
                if duration == 0 || duration >= period_min * 60 {
                    return Err("interval duration must be shorter than its period");
                }
                TimerRule::Interval {
                    off,
                    duration,
                    period_min,
                }
            }
            (_, _, Some(_)) => return Err("period requires both off and duration"),
            (Some(off), None, None) => TimerRule::Window { off },
            (None, Some(duration), None) => TimerRule::Pulse { duration },
            _ => return Err("exactly one of off or duration must be set"),
        };

        Ok(Self {
            time_on: if conf.sun == SunAnchor::None {
                conf.on as u32
            } else {
                0
            },
            rule,
            sun: conf.sun,
            offset: conf.on,
        })
    }

    pub fn time_on(&self) -> u32 {
        self.time_on
    }

    pub fn rule(&self) -> TimerRule {
        self.rule
    }

    pub fn sun(&self) -> SunAnchor {
        self.sun
    }

    /// Latches stay on until the next timer takes over.
    pub fn is_latch(&self) -> bool {
        matches!(self.rule, TimerRule::Pulse { duration: 0 })
    }

    /// Folds the sun offset into `time_on`. Sun-anchored timers without
    /// known sun times resolve to nothing and must be left out of the table.
    pub fn resolve_sun_anchor(&self, sun: Option<SunTimes>) -> Option<Timer> {
        let anchor = match self.sun {
            SunAnchor::None => return Some(*self),
            SunAnchor::Sunrise => sun?.sunrise,
            SunAnchor::Sunset => sun?.sunset,
        };
        let time_on = (anchor as i64 + self.offset as i64).rem_euclid(DAY_SECONDS as i64) as u32;
        Some(Timer { time_on, ..*self })
    }

    /// Seconds the timer holds the line on after `time_on`; `None` for latches.
    pub fn span(&self) -> Option<u32> {
        match self.rule {
            TimerRule::Window { off } | TimerRule::Interval { off, .. } => {
                Some(wrap_diff(off, self.time_on))
            }
            TimerRule::Pulse { duration: 0 } => None,
            TimerRule::Pulse { duration } => Some(duration),
        }
    }

    /// Whether the line is on `elapsed` seconds after this timer's `time_on`.
    pub fn covers(&self, elapsed: u32) -> bool {
        match self.rule {
            TimerRule::Pulse { duration: 0 } => true,
            TimerRule::Pulse { duration } => elapsed < duration,
            TimerRule::Window { .. } => self.span().is_some_and(|span| elapsed < span),
            TimerRule::Interval {
                duration,
                period_min,
                ..
            } => {
                self.span().is_some_and(|span| elapsed < span)
                    && elapsed % (period_min * 60) < duration
            }
        }
    }

    /// Seconds from `elapsed` until the timer's on/off state next flips, if it
    /// happens before the timer's own span ends.
    fn next_flip(&self, elapsed: u32) -> Option<u32> {
        match self.rule {
            TimerRule::Pulse { duration: 0 } => None,
            TimerRule::Pulse { duration } => (elapsed < duration).then(|| duration - elapsed),
            TimerRule::Window { .. } => {
                let span = self.span()?;
                (elapsed < span).then(|| span - elapsed)
            }
            TimerRule::Interval {
                duration,
                period_min,
                ..
            } => {
                let span = self.span()?;
                if elapsed >= span {
                    return None;
                }
                let period = period_min * 60;
                let phase = elapsed % period;
                let flip = if phase < duration {
                    duration - phase
                } else {
                    period - phase
                };
                Some(flip.min(span - elapsed))
            }
        }
    }
}

/// `(a - b)` on the 24h circle.
fn wrap_diff(a: u32, b: u32) -> u32 {
    (a + DAY_SECONDS - b) % DAY_SECONDS
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveTimer {
    pub timer: Timer,
    pub elapsed: u32,
}

impl ActiveTimer {
    pub fn is_on(&self) -> bool {
        self.timer.covers(self.elapsed)
    }

    /// Seconds the current on-phase still has to run; `None` when latched.
    /// For interval timers that is the rest of the running pulse.
    pub fn remaining(&self) -> Option<u32> {
        let left = self.timer.span()?.saturating_sub(self.elapsed);
        match self.timer.rule {
            TimerRule::Interval {
                duration,
                period_min,
                ..
            } => {
                let phase = self.elapsed % (period_min * 60);
                Some(duration.saturating_sub(phase).min(left))
            }
            _ => Some(left),
        }
    }
}

/// Resolved timers for one controller and one day, sorted by `time_on`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimerTable {
    timers: Vec<Timer>,
}

impl TimerTable {
    pub fn build(confs: &[TimerConf], sun: Option<SunTimes>) -> Result<Self, (usize, &'static str)> {
        let mut timers = Vec::with_capacity(confs.len());
        for (index, conf) in confs.iter().enumerate() {
            let timer = Timer::from_conf(conf).map_err(|reason| (index, reason))?;
            if let Some(resolved) = timer.resolve_sun_anchor(sun) {
                timers.push(resolved);
            }
        }
        timers.sort_by_key(Timer::time_on);
        Ok(Self { timers })
    }

    pub fn timers(&self) -> &[Timer] {
        &self.timers
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    /// Last timer whose `time_on` has passed; before the first timer of the
    /// day the last timer of the previous day still holds.
    pub fn authoritative(&self, now: u32) -> Option<ActiveTimer> {
        if let Some(timer) = self.timers.iter().rev().find(|t| t.time_on <= now) {
            return Some(ActiveTimer {
                timer: *timer,
                elapsed: now - timer.time_on,
            });
        }
        self.timers.last().map(|timer| ActiveTimer {
            timer: *timer,
            elapsed: wrap_diff(now, timer.time_on),
        })
    }

    pub fn state_at(&self, now: u32) -> Option<bool> {
        self.authoritative(now).map(|active| active.is_on())
    }

    /// Seconds until the next `time_on` or the end of the running on/off phase.
    pub fn next_boundary(&self, now: u32) -> Option<u32> {
        let next_on = self
            .timers
            .iter()
            .find(|t| t.time_on > now)
            .or_else(|| self.timers.first())
            .map(|t| wrap_diff(t.time_on, now))
            .filter(|delta| *delta > 0);

        let flip = self
            .authoritative(now)
            .and_then(|active| active.timer.next_flip(active.elapsed));

        match (next_on, flip) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}
