use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::time::{Minute, Span, TimeError, TimeOfDay};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {what}: {value:?}")]
pub struct UnknownVariant {
    pub what: &'static str,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentStatus {
    Scheduled,
    Confirmed,
    InProgress,
    Completed,
    Cancelled,
    NoShow,
}

impl AppointmentStatus {
    pub const ALL: [AppointmentStatus; 6] = [
        AppointmentStatus::Scheduled,
        AppointmentStatus::Confirmed,
        AppointmentStatus::InProgress,
        AppointmentStatus::Completed,
        AppointmentStatus::Cancelled,
        AppointmentStatus::NoShow,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentStatus::Scheduled => "scheduled",
            AppointmentStatus::Confirmed => "confirmed",
            AppointmentStatus::InProgress => "in_progress",
            AppointmentStatus::Completed => "completed",
            AppointmentStatus::Cancelled => "cancelled",
            AppointmentStatus::NoShow => "no_show",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            AppointmentStatus::Completed | AppointmentStatus::Cancelled | AppointmentStatus::NoShow
        )
    }

    /// Whether an appointment in this status still occupies its interval.
    pub fn holds_slot(self) -> bool {
        !matches!(self, AppointmentStatus::Cancelled | AppointmentStatus::NoShow)
    }
}

impl fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        AppointmentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or(UnknownVariant { what: "status", value: s })
    }
}

/// Category label. Carried, never interpreted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppointmentKind {
    Consultation,
    FollowUp,
    Emergency,
    Evaluation,
    Therapy,
    MedicationReview,
}

impl AppointmentKind {
    pub const ALL: [AppointmentKind; 6] = [
        AppointmentKind::Consultation,
        AppointmentKind::FollowUp,
        AppointmentKind::Emergency,
        AppointmentKind::Evaluation,
        AppointmentKind::Therapy,
        AppointmentKind::MedicationReview,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AppointmentKind::Consultation => "consultation",
            AppointmentKind::FollowUp => "follow_up",
            AppointmentKind::Emergency => "emergency",
            AppointmentKind::Evaluation => "evaluation",
            AppointmentKind::Therapy => "therapy",
            AppointmentKind::MedicationReview => "medication_review",
        }
    }
}

impl fmt::Display for AppointmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppointmentKind {
    type Err = UnknownVariant;

    /// Accepts `follow_up` and `follow-up` spellings alike.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase().replace('-', "_");
        AppointmentKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or(UnknownVariant { what: "appointment kind", value: s })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub patient_id: Ulid,
    pub clinician_id: Ulid,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub duration_minutes: u32,
    pub status: AppointmentStatus,
    pub kind: AppointmentKind,
    pub notes: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
    /// Bumped by every committed mutation.
    pub version: u64,
}

impl Appointment {
    /// Occupied interval. Stored appointments never cross midnight.
    pub fn span(&self) -> Span {
        let start = self.start.to_minutes();
        Span::new(start, start + self.duration_minutes as Minute)
    }

    /// Derived end time; never stored.
    pub fn end(&self) -> Result<TimeOfDay, TimeError> {
        self.start.add_minutes(self.duration_minutes)
    }

    pub fn starts_at(&self) -> NaiveDateTime {
        self.start.on(self.date)
    }

    pub fn patient_scope(&self) -> Scope {
        Scope::patient(self.patient_id)
    }

    pub fn clinician_scope(&self) -> Scope {
        Scope::clinician(self.clinician_id)
    }

    /// The two scope-days this appointment reserves, patient first.
    pub fn scope_days(&self) -> [ScopeDayKey; 2] {
        [
            ScopeDayKey::new(self.patient_scope(), self.date),
            ScopeDayKey::new(self.clinician_scope(), self.date),
        ]
    }
}

/// Caller-supplied booking request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub id: Ulid,
    pub patient_id: Ulid,
    pub date: NaiveDate,
    pub start: TimeOfDay,
    pub duration_minutes: u32,
    pub kind: AppointmentKind,
    pub notes: Option<String>,
}

/// Temporal changes for a reschedule. `None` keeps the current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Reschedule {
    pub date: Option<NaiveDate>,
    pub start: Option<TimeOfDay>,
    pub duration_minutes: Option<u32>,
}

// ── Scopes ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ScopeKind {
    Patient,
    Clinician,
}

impl ScopeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ScopeKind::Patient => "patient",
            ScopeKind::Clinician => "clinician",
        }
    }
}

impl fmt::Display for ScopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScopeKind {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "patient" => Ok(ScopeKind::Patient),
            "clinician" => Ok(ScopeKind::Clinician),
            other => Err(UnknownVariant { what: "scope", value: other.to_string() }),
        }
    }
}

/// The entity against which no-overlap is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Scope {
    pub kind: ScopeKind,
    pub id: Ulid,
}

impl Scope {
    pub fn patient(id: Ulid) -> Self {
        Self { kind: ScopeKind::Patient, id }
    }

    pub fn clinician(id: Ulid) -> Self {
        Self { kind: ScopeKind::Clinician, id }
    }
}

/// One scope on one calendar day: the unit of locking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeDayKey {
    pub scope: Scope,
    pub date: NaiveDate,
}

impl ScopeDayKey {
    pub fn new(scope: Scope, date: NaiveDate) -> Self {
        Self { scope, date }
    }
}

/// An interval held by a live appointment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub appointment_id: Ulid,
    pub span: Span,
}

/// Live reservations of one scope-day, sorted by `span.start`.
/// Only appointments that hold their slot appear here.
#[derive(Debug, Clone)]
pub struct ScopeDay {
    pub key: ScopeDayKey,
    pub reservations: Vec<Reservation>,
}

impl ScopeDay {
    pub fn new(key: ScopeDayKey) -> Self {
        Self { key, reservations: Vec::new() }
    }

    /// Reservations overlapping `query`.
    /// Uses binary search to skip reservations starting at or after `query.end`.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.span.start < query.end);
        self.reservations[..right_bound]
            .iter()
            .filter(move |r| r.span.end > query.start)
    }

    /// Exclusion constraint: insert unless another appointment's interval overlaps.
    /// Re-reserving an appointment replaces its previous interval.
    pub fn reserve(&mut self, appointment_id: Ulid, span: Span) -> Result<(), Ulid> {
        if let Some(clash) = self
            .overlapping(&span)
            .find(|r| r.appointment_id != appointment_id)
        {
            return Err(clash.appointment_id);
        }
        self.release(appointment_id);
        let pos = self
            .reservations
            .binary_search_by_key(&span.start, |r| r.span.start)
            .unwrap_or_else(|e| e);
        self.reservations.insert(pos, Reservation { appointment_id, span });
        Ok(())
    }

    pub fn release(&mut self, appointment_id: Ulid) -> Option<Reservation> {
        let pos = self
            .reservations
            .iter()
            .position(|r| r.appointment_id == appointment_id)?;
        Some(self.reservations.remove(pos))
    }

    pub fn busy_spans(&self) -> Vec<Span> {
        self.reservations.iter().map(|r| r.span).collect()
    }
}

/// WAL record format. Flat, no nesting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    PatientRegistered {
        id: Ulid,
        active: bool,
    },
    AppointmentBooked {
        appointment: Appointment,
    },
    AppointmentRescheduled {
        id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
        duration_minutes: u32,
        at: NaiveDateTime,
    },
    AppointmentStatusChanged {
        id: Ulid,
        status: AppointmentStatus,
        at: NaiveDateTime,
    },
    AppointmentDeleted {
        id: Ulid,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::PatientRegistered { .. } => "patient_registered",
            Event::AppointmentBooked { .. } => "appointment_booked",
            Event::AppointmentRescheduled { .. } => "appointment_rescheduled",
            Event::AppointmentStatusChanged { .. } => "appointment_status_changed",
            Event::AppointmentDeleted { .. } => "appointment_deleted",
        }
    }
}
