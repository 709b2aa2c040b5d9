use std::{
    collections::BTreeMap,
    sync::{Arc, PoisonError, RwLock},
};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{error::StoreError, ports::SettingsStore};

const DAY_SECONDS: i64 = 86_400;

/// Acceptable `[low, high)` range for a sensed parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Band {
    pub low: f32,
    pub high: f32,
}

impl Band {
    pub fn around(center: f32, tolerance: f32) -> Self {
        Self {
            low: center - tolerance,
            high: center + tolerance,
        }
    }

    pub fn contains(&self, value: f32) -> bool {
        self.low <= value && value < self.high
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleParams {
    /// Tolerance per parameter index.
    #[serde(default)]
    pub delta: BTreeMap<usize, f32>,
}

/// Day-indexed setpoint table synced from the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub start: Option<NaiveDateTime>,
    #[serde(default)]
    pub params_list: Vec<String>,
    #[serde(default)]
    pub params: ScheduleParams,
    #[serde(default)]
    pub items: Vec<Vec<Option<f32>>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleVersion {
    pub hash: Option<String>,
    pub start: Option<NaiveDateTime>,
}

impl Schedule {
    pub fn version(&self) -> ScheduleVersion {
        ScheduleVersion {
            hash: self.hash.clone(),
            start: self.start,
        }
    }

    pub fn is_current(&self, hash: Option<&str>, start: Option<NaiveDateTime>) -> bool {
        self.hash.as_deref() == hash && self.start == start
    }

    pub fn day_index(&self, now: NaiveDateTime) -> Option<usize> {
        let start = self.start?;
        if self.items.is_empty() {
            return None;
        }
        let elapsed = (now - start).num_seconds();
        let day = if elapsed > 0 {
            (elapsed / DAY_SECONDS) as usize
        } else {
            0
        };
        Some(day.min(self.items.len() - 1))
    }

    pub fn current_day(&self, now: NaiveDateTime) -> Option<&[Option<f32>]> {
        self.day_index(now)
            .and_then(|day| self.items.get(day))
            .map(Vec::as_slice)
    }

    pub fn param_index(&self, name: &str) -> Option<usize> {
        self.params_list.iter().position(|param| param == name)
    }

    pub fn value(&self, now: NaiveDateTime, name: &str) -> Option<f32> {
        let index = self.param_index(name)?;
        self.current_day(now)?.get(index).copied().flatten()
    }

    pub fn tolerance(&self, index: usize) -> Option<f32> {
        self.params.delta.get(&index).copied()
    }

    /// `center ± delta` for today's value of `name`, when both are known.
    pub fn band(&self, now: NaiveDateTime, name: &str) -> Option<Band> {
        let index = self.param_index(name)?;
        let center = self.current_day(now)?.get(index).copied().flatten()?;
        let tolerance = self.tolerance(index)?;
        Some(Band::around(center, tolerance))
    }

    pub fn validate(&self) -> Result<(), crate::error::ConfigError> {
        use crate::error::ConfigError;

        let width = self.params_list.len();
        if self.items.iter().any(|row| row.len() > width) {
            return Err(ConfigError::InvalidSchedule(
                "rows must not be wider than params_list",
            ));
        }
        if self.params.delta.keys().any(|index| *index >= width) {
            return Err(ConfigError::InvalidSchedule(
                "delta refers to an unknown parameter",
            ));
        }
        if self
            .items
            .iter()
            .flatten()
            .flatten()
            .any(|value| !value.is_finite())
        {
            return Err(ConfigError::InvalidSchedule("values must be finite"));
        }
        Ok(())
    }
}

/// Schedule shared by every controller. Readers take a snapshot for the whole
/// cycle; updates swap in a new table, never edit the current one.
#[derive(Debug, Clone, Default)]
pub struct SharedSchedule {
    current: Arc<RwLock<Arc<Schedule>>>,
}

impl SharedSchedule {
    pub fn new(schedule: Schedule) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(schedule))),
        }
    }

    pub fn snapshot(&self) -> Arc<Schedule> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swaps the schedule in and persists it. A failed save leaves the new
    /// schedule active in memory.
    pub fn replace(&self, schedule: Schedule, store: &dyn SettingsStore) -> Result<(), StoreError> {
        let schedule = Arc::new(schedule);
        {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            *current = schedule.clone();
        }
        info!(
            hash = schedule.hash.as_deref().unwrap_or("-"),
            days = schedule.items.len(),
            "schedule replaced"
        );

        store.save_schedule(&schedule).inspect_err(|err| {
            warn!("failed to persist schedule: {err}");
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ports::testing::MemoryStore;

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn sample() -> Schedule {
        Schedule {
            hash: Some("abc".to_string()),
            start: Some(at(1, 0)),
            params_list: vec!["temperature".to_string(), "humidity".to_string()],
            params: ScheduleParams {
                delta: BTreeMap::from([(0, 1.5)]),
            },
            items: vec![
                vec![Some(33.0), Some(60.0)],
                vec![Some(32.0), Some(60.0)],
                vec![Some(31.0), None],
            ],
        }
    }

    #[test]
    fn current_day_indexes_from_start_and_clamps() {
        let schedule = sample();

        assert_eq!(schedule.current_day(at(1, 12)), Some(&schedule.items[0][..]));
        assert_eq!(schedule.current_day(at(2, 0)), Some(&schedule.items[1][..]));
        assert_eq!(schedule.current_day(at(3, 23)), Some(&schedule.items[2][..]));
        assert_eq!(schedule.current_day(at(28, 0)), Some(&schedule.items[2][..]));
        // Before the start date the first day applies.
        let before_start = NaiveDate::from_ymd_opt(2026, 2, 20)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap();
        assert_eq!(schedule.day_index(before_start), Some(0));
    }

    #[test]
    fn no_current_day_without_start_or_items() {
        let mut schedule = sample();
        schedule.start = None;
        assert_eq!(schedule.current_day(at(2, 0)), None);

        let mut schedule = sample();
        schedule.items.clear();
        assert_eq!(schedule.current_day(at(2, 0)), None);
    }

    #[test]
    fn band_needs_value_and_tolerance() {
        let schedule = sample();

        assert_eq!(
            schedule.band(at(2, 6), "temperature"),
            Some(Band {
                low: 30.5,
                high: 33.5
            })
        );
        // No delta for humidity.
        assert_eq!(schedule.band(at(2, 6), "humidity"), None);
        assert_eq!(schedule.band(at(2, 6), "co2"), None);
        assert_eq!(schedule.value(at(3, 6), "humidity"), None);
    }

    #[test]
    fn replace_swaps_and_persists() {
        let shared = SharedSchedule::default();
        let store = MemoryStore::default();
        let before = shared.snapshot();

        shared.replace(sample(), &store).unwrap();

        assert!(before.items.is_empty());
        assert_eq!(shared.snapshot().hash.as_deref(), Some("abc"));
        assert_eq!(store.saved_schedule(), Some(sample()));
    }

    #[test]
    fn failed_persist_keeps_new_schedule() {
        let shared = SharedSchedule::default();
        let store = MemoryStore::failing();

        assert!(shared.replace(sample(), &store).is_err());
        assert!(shared.snapshot().is_current(Some("abc"), Some(at(1, 0))));
    }

    #[test]
    fn validate_rejects_rows_wider_than_params() {
        let mut schedule = sample();
        schedule.items.push(vec![Some(1.0), Some(2.0), Some(3.0)]);

        assert!(schedule.validate().is_err());
    }
}
