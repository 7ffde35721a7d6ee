use chrono::NaiveDateTime;
use ulid::Ulid;

use crate::model::AppointmentStatus;
use crate::time::TimeOfDay;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulingError {
    #[error("duration {minutes} min outside [{min}, {max}]")]
    InvalidDuration { minutes: u32, min: u32, max: u32 },
    #[error("{start} + {minutes} min is outside working hours {window_start}-{window_end}")]
    OutsideWorkingHours {
        start: TimeOfDay,
        minutes: u32,
        window_start: TimeOfDay,
        window_end: TimeOfDay,
    },
    #[error("interval {start}-{end} is empty")]
    EmptyInterval { start: TimeOfDay, end: TimeOfDay },
    #[error("appointment start {starts_at} is in the past")]
    PastDate { starts_at: NaiveDateTime },
    #[error("appointment start {starts_at} is less than {min_lead_minutes} min away")]
    InsufficientLeadTime {
        starts_at: NaiveDateTime,
        min_lead_minutes: u32,
    },
    #[error("patient not found: {0}")]
    PatientNotFound(Ulid),
    #[error("patient is inactive: {0}")]
    PatientInactive(Ulid),
    #[error("patient already booked by appointment {0}")]
    PatientConflict(Ulid),
    #[error("clinician already booked by appointment {0}")]
    ClinicianConflict(Ulid),
    #[error("{}", describe_transition(.current, .requested))]
    InvalidStatusTransition {
        current: AppointmentStatus,
        /// `None` when the rejected change was a reschedule.
        requested: Option<AppointmentStatus>,
    },
    #[error("appointment not found: {0}")]
    NotFound(Ulid),
    #[error("appointment already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("clinician {caller} may not modify appointment {appointment}")]
    Forbidden { appointment: Ulid, caller: Ulid },
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

fn describe_transition(current: &AppointmentStatus, requested: &Option<AppointmentStatus>) -> String {
    match requested {
        Some(requested) => format!("invalid status transition: {current} -> {requested}"),
        None => format!("invalid status transition: cannot reschedule a {current} appointment"),
    }
}

impl SchedulingError {
    /// Stable identifier surfaced to callers.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulingError::InvalidDuration { .. } => "invalid_duration",
            SchedulingError::OutsideWorkingHours { .. } => "outside_working_hours",
            SchedulingError::EmptyInterval { .. } => "empty_interval",
            SchedulingError::PastDate { .. } => "past_date",
            SchedulingError::InsufficientLeadTime { .. } => "insufficient_lead_time",
            SchedulingError::PatientNotFound(_) => "patient_not_found",
            SchedulingError::PatientInactive(_) => "patient_inactive",
            SchedulingError::PatientConflict(_) => "patient_conflict",
            SchedulingError::ClinicianConflict(_) => "clinician_conflict",
            SchedulingError::InvalidStatusTransition { .. } => "invalid_status_transition",
            SchedulingError::NotFound(_) => "not_found",
            SchedulingError::AlreadyExists(_) => "already_exists",
            SchedulingError::Forbidden { .. } => "forbidden",
            SchedulingError::LimitExceeded(_) => "limit_exceeded",
            SchedulingError::StoreUnavailable(_) => "store_unavailable",
        }
    }

    /// SQLSTATE sent over the wire. Domain outcomes use the private `SC` class.
    pub fn sqlstate(&self) -> &'static str {
        match self {
            SchedulingError::InvalidDuration { .. } => "SC001",
            SchedulingError::OutsideWorkingHours { .. } => "SC002",
            SchedulingError::PastDate { .. } => "SC003",
            SchedulingError::InsufficientLeadTime { .. } => "SC004",
            SchedulingError::EmptyInterval { .. } => "SC005",
            SchedulingError::PatientNotFound(_) => "SC010",
            SchedulingError::PatientInactive(_) => "SC011",
            SchedulingError::PatientConflict(_) => "SC020",
            SchedulingError::ClinicianConflict(_) => "SC021",
            SchedulingError::InvalidStatusTransition { .. } => "SC030",
            SchedulingError::NotFound(_) => "SC040",
            SchedulingError::AlreadyExists(_) => "SC041",
            SchedulingError::Forbidden { .. } => "42501",
            SchedulingError::LimitExceeded(_) => "54000",
            SchedulingError::StoreUnavailable(_) => "58030",
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            SchedulingError::InvalidDuration { .. }
            | SchedulingError::OutsideWorkingHours { .. }
            | SchedulingError::PastDate { .. }
            | SchedulingError::InsufficientLeadTime { .. }
            | SchedulingError::EmptyInterval { .. } => "validation",
            SchedulingError::PatientConflict(_) | SchedulingError::ClinicianConflict(_) => "conflict",
            SchedulingError::InvalidStatusTransition { .. } => "lifecycle",
            SchedulingError::NotFound(_)
            | SchedulingError::PatientNotFound(_)
            | SchedulingError::PatientInactive(_)
            | SchedulingError::AlreadyExists(_) => "reference",
            SchedulingError::Forbidden { .. } => "access",
            SchedulingError::LimitExceeded(_) => "limit",
            SchedulingError::StoreUnavailable(_) => "infrastructure",
        }
    }
}
