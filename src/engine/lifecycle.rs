use chrono::NaiveDateTime;

use crate::model::AppointmentStatus::{self, *};

use super::SchedulingError;

/// Statuses reachable from `current` in one step, ignoring timing.
pub fn next_statuses(current: AppointmentStatus) -> &'static [AppointmentStatus] {
    match current {
        Scheduled => &[Confirmed, Cancelled, NoShow],
        Confirmed => &[InProgress, Cancelled, NoShow],
        InProgress => &[Completed, Cancelled],
        Completed | Cancelled | NoShow => &[],
    }
}

/// Validate `current -> requested`. Transitions are strict: `x -> x` is rejected.
/// A no-show can only be recorded once the appointment's start has passed.
pub fn check_transition(
    current: AppointmentStatus,
    requested: AppointmentStatus,
    starts_at: NaiveDateTime,
    now: NaiveDateTime,
) -> Result<(), SchedulingError> {
    let reject = || SchedulingError::InvalidStatusTransition {
        current,
        requested: Some(requested),
    };
    if !next_statuses(current).contains(&requested) {
        return Err(reject());
    }
    if requested == NoShow && now < starts_at {
        return Err(reject());
    }
    Ok(())
}

/// Temporal fields may only change before the visit starts.
pub fn check_reschedulable(current: AppointmentStatus) -> Result<(), SchedulingError> {
    match current {
        Scheduled | Confirmed => Ok(()),
        _ => Err(SchedulingError::InvalidStatusTransition {
            current,
            requested: None,
        }),
    }
}
