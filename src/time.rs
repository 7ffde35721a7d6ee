use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};

/// Minutes since midnight.
pub type Minute = u16;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeError {
    #[error("malformed time of day {0:?}, expected HH:MM")]
    Malformed(String),
    #[error("{0} minutes is past the end of the day")]
    OutOfRange(u32),
    #[error("{start} + {minutes} min crosses midnight")]
    DayRollover { start: TimeOfDay, minutes: u32 },
}

/// Wall-clock time of day with minute resolution, `00:00..=23:59`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(Minute);

impl TimeOfDay {
    pub const MIDNIGHT: TimeOfDay = TimeOfDay(0);

    /// Const constructor for literals. Panics on an invalid hour or minute.
    pub const fn hm(hour: u8, minute: u8) -> Self {
        assert!(hour < 24 && minute < 60, "invalid time of day");
        TimeOfDay(hour as Minute * 60 + minute as Minute)
    }

    pub fn from_minutes(minutes: u32) -> Result<Self, TimeError> {
        if minutes >= MINUTES_PER_DAY as u32 {
            return Err(TimeError::OutOfRange(minutes));
        }
        Ok(TimeOfDay(minutes as Minute))
    }

    pub fn to_minutes(self) -> Minute {
        self.0
    }

    pub fn hour(self) -> u8 {
        (self.0 / 60) as u8
    }

    pub fn minute(self) -> u8 {
        (self.0 % 60) as u8
    }

    /// Add `minutes` without wrapping. Reaching or passing midnight is an error.
    pub fn add_minutes(self, minutes: u32) -> Result<Self, TimeError> {
        match (self.0 as u32).checked_add(minutes) {
            Some(total) if total < MINUTES_PER_DAY as u32 => Ok(TimeOfDay(total as Minute)),
            _ => Err(TimeError::DayRollover { start: self, minutes }),
        }
    }

    /// The instant this time of day falls on `date`.
    pub fn on(self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(NaiveTime::MIN) + TimeDelta::minutes(self.0 as i64)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for TimeOfDay {
    type Err = TimeError;

    /// Accepts `H:MM`, `HH:MM` and `HH:MM:00`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || TimeError::Malformed(s.to_string());
        let mut parts = s.trim().split(':');
        let hour: u8 = parts
            .next()
            .filter(|p| (1..=2).contains(&p.len()))
            .and_then(|p| p.parse().ok())
            .ok_or_else(malformed)?;
        let minute: u8 = parts
            .next()
            .filter(|p| p.len() == 2)
            .and_then(|p| p.parse().ok())
            .ok_or_else(malformed)?;
        if let Some(seconds) = parts.next()
            && seconds != "00"
        {
            return Err(malformed());
        }
        if parts.next().is_some() || hour >= 24 || minute >= 60 {
            return Err(malformed());
        }
        Ok(TimeOfDay(hour as Minute * 60 + minute as Minute))
    }
}

/// Half-open overlap test: `[a_start, a_end)` and `[b_start, b_end)` share at least one instant.
pub fn overlaps<T: Ord>(a_start: T, a_end: T, b_start: T, b_end: T) -> bool {
    a_start < b_end && b_start < a_end
}

/// Half-open interval `[start, end)` on the minute scale of a single day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Minute,
    pub end: Minute,
}

impl Span {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Span of an appointment starting at `start` and lasting `duration` minutes.
    pub fn starting_at(start: TimeOfDay, duration: u32) -> Result<Self, TimeError> {
        let end = start.add_minutes(duration)?;
        Ok(Span::new(start.to_minutes(), end.to_minutes()))
    }

    pub fn duration_minutes(&self) -> u32 {
        (self.end - self.start) as u32
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        overlaps(self.start, self.end, other.start, other.end)
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// Source of "now" in clinic-local time.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Manually driven clock for deterministic tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    at: Mutex<NaiveDateTime>,
}

impl FixedClock {
    pub fn new(at: NaiveDateTime) -> Self {
        Self { at: Mutex::new(at) }
    }

    pub fn set(&self, at: NaiveDateTime) {
        *self.at.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut guard = self.at.lock().unwrap_or_else(|e| e.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        *self.at.lock().unwrap_or_else(|e| e.into_inner())
    }
}
