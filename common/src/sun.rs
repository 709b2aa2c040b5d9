//! Sunrise and sunset times from the almanac algorithm (official zenith, 90°50').
//!
//! Accurate to a couple of minutes between the polar circles, which is well
//! inside the one-minute cadence the switch scheduler runs at.

use chrono::{Datelike, NaiveDate};

use crate::timer::DAY_SECONDS;

const ZENITH_DEG: f64 = 90.833;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SunTimes {
    /// Local seconds since midnight.
    pub sunrise: u32,
    pub sunset: u32,
}

/// Sun times for `date` at `[lat, lon]`, shifted by `utc_offset_s` into local
/// time. `None` when the sun does not rise or does not set that day.
pub fn sun_times(date: NaiveDate, location: [f64; 2], utc_offset_s: i32) -> Option<SunTimes> {
    let [lat, lon] = location;
    let sunrise = sun_event_utc_hours(date, lat, lon, true)?;
    let sunset = sun_event_utc_hours(date, lat, lon, false)?;

    Some(SunTimes {
        sunrise: to_local_seconds(sunrise, utc_offset_s),
        sunset: to_local_seconds(sunset, utc_offset_s),
    })
}

fn to_local_seconds(utc_hours: f64, utc_offset_s: i32) -> u32 {
    let seconds = (utc_hours * 3600.0).round() as i64 + utc_offset_s as i64;
    seconds.rem_euclid(DAY_SECONDS as i64) as u32
}

fn sun_event_utc_hours(date: NaiveDate, lat: f64, lon: f64, rising: bool) -> Option<f64> {
    let day_of_year = date.ordinal() as f64;
    let lng_hour = lon / 15.0;

    let approx = day_of_year + ((if rising { 6.0 } else { 18.0 }) - lng_hour) / 24.0;
    let mean_anomaly = 0.9856 * approx - 3.289;

    let true_long = normalize_deg(
        mean_anomaly
            + 1.916 * sin_deg(mean_anomaly)
            + 0.020 * sin_deg(2.0 * mean_anomaly)
            + 282.634,
    );

    let mut right_ascension = normalize_deg(atan_deg(0.91764 * tan_deg(true_long)));
    let long_quadrant = (true_long / 90.0).floor() * 90.0;
    let ra_quadrant = (right_ascension / 90.0).floor() * 90.0;
    right_ascension = (right_ascension + long_quadrant - ra_quadrant) / 15.0;

    let sin_dec = 0.39782 * sin_deg(true_long);
    let cos_dec = sin_dec.asin().cos();

    let cos_hour = (cos_deg(ZENITH_DEG) - sin_dec * sin_deg(lat)) / (cos_dec * cos_deg(lat));
    if !(-1.0..=1.0).contains(&cos_hour) {
        return None;
    }

    let hour_angle = if rising {
        360.0 - cos_hour.acos().to_degrees()
    } else {
        cos_hour.acos().to_degrees()
    } / 15.0;

    let local_mean = hour_angle + right_ascension - 0.06571 * approx - 6.622;
    Some((local_mean - lng_hour).rem_euclid(24.0))
}

fn normalize_deg(value: f64) -> f64 {
    value.rem_euclid(360.0)
}

fn sin_deg(value: f64) -> f64 {
    value.to_radians().sin()
}

fn cos_deg(value: f64) -> f64 {
    value.to_radians().cos()
}

fn tan_deg(value: f64) -> f64 {
    value.to_radians().tan()
}

fn atan_deg(value: f64) -> f64 {
    value.atan().to_degrees()
}
