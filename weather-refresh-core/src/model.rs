use std::fmt;

use chrono::{DateTime, FixedOffset, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};

const DEFAULT_TEMP_C: f32 = 20.0;
const DEFAULT_WIND_KPH: i32 = 0;
const DEFAULT_SUNRISE: TimeOfDay = TimeOfDay { hour: 6, minute: 0 };
const DEFAULT_SUNSET: TimeOfDay = TimeOfDay { hour: 18, minute: 0 };

/// Mean length of a lunar cycle in days.
const SYNODIC_MONTH_DAYS: f64 = 29.53;

/// Normalized weather condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Snow,
    Rain,
    Cloudy,
    #[default]
    Sunny,
}

impl Condition {
    /// Map a provider's free-form condition text to a [`Condition`].
    ///
    /// Matching is a case-insensitive substring search. Rules are checked in
    /// order and the first hit wins, so "snow and rain" is `Snow`.
    pub fn from_description(description: &str) -> Self {
        const RULES: &[(&[&str], Condition)] = &[
            (&["snow"], Condition::Snow),
            (&["rain", "storm", "thunder"], Condition::Rain),
            (&["cloud", "overcast", "fog"], Condition::Cloudy),
        ];

        let lower = description.to_lowercase();
        RULES
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
            .map(|(_, condition)| *condition)
            .unwrap_or(Condition::Sunny)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Condition::Snow => "snow",
            Condition::Rain => "rain",
            Condition::Cloudy => "cloudy",
            Condition::Sunny => "sunny",
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MoonPhase {
    NewMoon,
    WaxingCrescent,
    FirstQuarter,
    WaxingGibbous,
    #[default]
    FullMoon,
    WaningGibbous,
    ThirdQuarter,
    WaningCrescent,
}

impl MoonPhase {
    const CYCLE: [MoonPhase; 8] = [
        MoonPhase::NewMoon,
        MoonPhase::WaxingCrescent,
        MoonPhase::FirstQuarter,
        MoonPhase::WaxingGibbous,
        MoonPhase::FullMoon,
        MoonPhase::WaningGibbous,
        MoonPhase::ThirdQuarter,
        MoonPhase::WaningCrescent,
    ];

    /// Nearest discrete phase for a cycle fraction (0.0 = new, 0.5 = full).
    ///
    /// The domain is cyclic: values close to 1.0 resolve to `NewMoon`.
    /// On an exact tie the earlier phase wins.
    pub fn from_fraction(fraction: f64) -> Self {
        let fraction = fraction.rem_euclid(1.0);
        let mut closest = MoonPhase::NewMoon;
        let mut min_distance = f64::MAX;

        // Nine anchors; the last one (1.0) is NewMoon again.
        for step in 0..=Self::CYCLE.len() {
            let anchor = step as f64 / Self::CYCLE.len() as f64;
            let distance = (anchor - fraction).abs();
            if distance < min_distance {
                min_distance = distance;
                closest = Self::CYCLE[step % Self::CYCLE.len()];
            }
        }
        closest
    }

    /// Nearest discrete phase for an "age of moon" in days (0..=29).
    pub fn from_age(age_days: u32) -> Self {
        Self::from_fraction(f64::from(age_days) / SYNODIC_MONTH_DAYS)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MoonPhase::NewMoon => "new moon",
            MoonPhase::WaxingCrescent => "waxing crescent",
            MoonPhase::FirstQuarter => "first quarter",
            MoonPhase::WaxingGibbous => "waxing gibbous",
            MoonPhase::FullMoon => "full moon",
            MoonPhase::WaningGibbous => "waning gibbous",
            MoonPhase::ThirdQuarter => "third quarter",
            MoonPhase::WaningCrescent => "waning crescent",
        }
    }
}

impl fmt::Display for MoonPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Wall-clock hour and minute, used for sunrise and sunset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeOfDay {
    hour: u8,
    minute: u8,
}

impl TimeOfDay {
    /// Returns `None` unless `hour < 24` and `minute < 60`.
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self { hour, minute })
    }

    /// Time of day for a unix timestamp (seconds) in the given offset.
    pub fn from_unix_seconds(secs: i64, offset: FixedOffset) -> Option<Self> {
        let at = DateTime::from_timestamp(secs, 0)?;
        Some(Self::at(at, offset))
    }

    pub fn at(instant: DateTime<Utc>, offset: FixedOffset) -> Self {
        let local = instant.with_timezone(&offset);
        // chrono guarantees hour < 24 and minute < 60
        Self {
            hour: local.hour() as u8,
            minute: local.minute() as u8,
        }
    }

    pub fn hour(&self) -> u8 {
        self.hour
    }

    pub fn minute(&self) -> u8 {
        self.minute
    }

    fn as_pair(&self) -> (i32, i32) {
        (i32::from(self.hour), i32::from(self.minute))
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// Where the sun is relative to the record's sunrise and sunset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DayPhase {
    Sunrise,
    Day,
    Sunset,
    Night,
}

/// Normalized snapshot of current conditions; the unit of cache and persistence.
///
/// Records start from defaults and are only changed by a provider parse
/// against a freshly seeded copy. `last_update` is stamped by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherRecord {
    temperature_celsius: f32,
    #[serde(default)]
    condition: Condition,
    #[serde(default)]
    moon_phase: MoonPhase,
    sunrise: TimeOfDay,
    sunset: TimeOfDay,
    wind_kph: i32,
    last_update: DateTime<Utc>,
}

impl Default for WeatherRecord {
    fn default() -> Self {
        Self {
            temperature_celsius: DEFAULT_TEMP_C,
            condition: Condition::default(),
            moon_phase: MoonPhase::default(),
            sunrise: DEFAULT_SUNRISE,
            sunset: DEFAULT_SUNSET,
            wind_kph: DEFAULT_WIND_KPH,
            last_update: DateTime::<Utc>::default(),
        }
    }
}

impl WeatherRecord {
    pub fn celsius(&self) -> f32 {
        self.temperature_celsius
    }

    /// Truncated to whole degrees.
    pub fn fahrenheit(&self) -> i32 {
        (9.0 / 5.0 * self.temperature_celsius + 32.0) as i32
    }

    pub fn condition(&self) -> Condition {
        self.condition
    }

    pub fn moon_phase(&self) -> MoonPhase {
        self.moon_phase
    }

    pub fn sunrise(&self) -> TimeOfDay {
        self.sunrise
    }

    pub fn sunset(&self) -> TimeOfDay {
        self.sunset
    }

    pub fn wind_kph(&self) -> i32 {
        self.wind_kph
    }

    pub fn wind_mph(&self) -> i32 {
        (self.wind_kph as f32 * 0.6214) as i32
    }

    pub fn last_update(&self) -> DateTime<Utc> {
        self.last_update
    }

    /// Age of the record relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.last_update
    }

    pub fn set_celsius(&mut self, celsius: f32) {
        self.temperature_celsius = celsius;
    }

    pub fn set_condition(&mut self, condition: Condition) {
        self.condition = condition;
    }

    pub fn set_moon_phase(&mut self, moon_phase: MoonPhase) {
        self.moon_phase = moon_phase;
    }

    pub fn set_sunrise(&mut self, sunrise: TimeOfDay) {
        self.sunrise = sunrise;
    }

    pub fn set_sunset(&mut self, sunset: TimeOfDay) {
        self.sunset = sunset;
    }

    pub fn set_wind_kph(&mut self, wind_kph: i32) {
        self.wind_kph = wind_kph;
    }

    /// Copy of this record carrying a persist timestamp. Only stores call this.
    pub fn stamped(mut self, at: DateTime<Utc>) -> Self {
        self.last_update = at;
        self
    }

    pub fn is_sunrise(&self, now: TimeOfDay) -> bool {
        let (h, m) = self.sunrise.as_pair();
        after(now, h - 1, m) && before(now, h + 1, m)
    }

    pub fn is_day(&self, now: TimeOfDay) -> bool {
        let (rise_h, rise_m) = self.sunrise.as_pair();
        let (set_h, set_m) = self.sunset.as_pair();
        (after(now, rise_h + 1, rise_m) && before(now, set_h - 1, set_m))
            || equal(now, set_h - 1, set_m)
            || equal(now, rise_h + 1, rise_m)
    }

    pub fn is_sunset(&self, now: TimeOfDay) -> bool {
        let (h, m) = self.sunset.as_pair();
        after(now, h - 1, m) && before(now, h + 1, m)
    }

    pub fn is_night(&self, now: TimeOfDay) -> bool {
        !self.is_sunrise(now) && !self.is_day(now) && !self.is_sunset(now)
    }

    pub fn day_phase(&self, now: TimeOfDay) -> DayPhase {
        if self.is_sunrise(now) {
            DayPhase::Sunrise
        } else if self.is_sunset(now) {
            DayPhase::Sunset
        } else if self.is_day(now) {
            DayPhase::Day
        } else {
            DayPhase::Night
        }
    }
}

fn before(now: TimeOfDay, hour: i32, minute: i32) -> bool {
    let (h, m) = now.as_pair();
    h < hour || (h == hour && m < minute)
}

fn after(now: TimeOfDay, hour: i32, minute: i32) -> bool {
    let (h, m) = now.as_pair();
    h > hour || (h == hour && m > minute)
}

fn equal(now: TimeOfDay, hour: i32, minute: i32) -> bool {
    now.as_pair() == (hour, minute)
}

/// Read-time overrides for demos and tests. Never persisted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WeatherOverrides {
    pub condition: Option<Condition>,
    pub sunrise: Option<TimeOfDay>,
    pub sunset: Option<TimeOfDay>,
}

impl WeatherOverrides {
    pub fn is_empty(&self) -> bool {
        self.condition.is_none() && self.sunrise.is_none() && self.sunset.is_none()
    }

    pub fn apply(&self, record: &WeatherRecord) -> WeatherRecord {
        let mut out = record.clone();
        if let Some(condition) = self.condition {
            out.condition = condition;
        }
        if let Some(sunrise) = self.sunrise {
            out.sunrise = sunrise;
        }
        if let Some(sunset) = self.sunset {
            out.sunset = sunset;
        }
        out
    }
}

/// A device position, consumed once per pipeline run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub captured_at: DateTime<Utc>,
}

impl Position {
    pub fn new(latitude: f64, longitude: f64, captured_at: DateTime<Utc>) -> Self {
        Self {
            latitude,
            longitude,
            captured_at,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> TimeDelta {
        now - self.captured_at
    }
}

/// Result of one refresh run, as reported to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    /// Refreshed, or skipped because the record is still fresh.
    Success,
    /// Transient problem; the scheduler should retry with backoff.
    Reschedule,
    /// Do not retry.
    Failure,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Success => "success",
            Outcome::Reschedule => "reschedule",
            Outcome::Failure => "failure",
        })
    }
}
