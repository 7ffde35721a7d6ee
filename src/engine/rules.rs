use chrono::{NaiveDate, NaiveDateTime, TimeDelta};

use crate::config::SchedulingConfig;
use crate::time::{Span, TimeOfDay};

use super::SchedulingError;

/// Check a candidate booking against the practice rules.
///
/// Rules run in a fixed order and the first violation wins:
/// duration bounds, working window, past start, lead time.
/// Returns the occupied span on success.
pub fn validate_booking(
    config: &SchedulingConfig,
    date: NaiveDate,
    start: TimeOfDay,
    duration_minutes: u32,
    now: NaiveDateTime,
) -> Result<Span, SchedulingError> {
    if !(config.min_duration_minutes..=config.max_duration_minutes).contains(&duration_minutes) {
        return Err(SchedulingError::InvalidDuration {
            minutes: duration_minutes,
            min: config.min_duration_minutes,
            max: config.max_duration_minutes,
        });
    }

    let outside = || SchedulingError::OutsideWorkingHours {
        start,
        minutes: duration_minutes,
        window_start: config.window_start,
        window_end: config.window_end,
    };
    if start < config.window_start {
        return Err(outside());
    }
    // Midnight rollover is just another way of leaving the window.
    let end = start.add_minutes(duration_minutes).map_err(|_| outside())?;
    if end > config.window_end {
        return Err(outside());
    }

    let starts_at = start.on(date);
    if starts_at < now {
        return Err(SchedulingError::PastDate { starts_at });
    }
    if starts_at - now < TimeDelta::minutes(config.min_lead_time_minutes as i64) {
        return Err(SchedulingError::InsufficientLeadTime {
            starts_at,
            min_lead_minutes: config.min_lead_time_minutes,
        });
    }

    Ok(Span::new(start.to_minutes(), end.to_minutes()))
}
