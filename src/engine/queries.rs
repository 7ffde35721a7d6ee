use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;
use crate::time::{Span, TimeOfDay};

use super::availability::{available_slots, AvailableSlots};
use super::conflict::has_conflict;
use super::{Engine, SchedulingError};

impl Engine {
    pub fn get_appointment(&self, id: &Ulid) -> Option<Appointment> {
        self.appointments.get(id).map(|e| e.value().clone())
    }

    /// Every appointment of a scope on `date`, whatever its status, ordered by start.
    pub fn list_appointments(&self, scope: Scope, date: NaiveDate) -> Vec<Appointment> {
        let mut found: Vec<Appointment> = self
            .appointments
            .iter()
            .filter(|e| {
                let a = e.value();
                a.date == date
                    && match scope.kind {
                        ScopeKind::Patient => a.patient_id == scope.id,
                        ScopeKind::Clinician => a.clinician_id == scope.id,
                    }
            })
            .map(|e| e.value().clone())
            .collect();
        found.sort_by_key(|a| (a.start, a.id));
        found
    }

    pub fn appointment_count(&self) -> usize {
        self.appointments.len()
    }

    /// Snapshot of the busy intervals of one scope-day.
    pub async fn busy_spans(&self, key: ScopeDayKey) -> Vec<Span> {
        let Some(day) = self.scope_days.get(&key).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let guard = day.read().await;
        guard.busy_spans()
    }

    /// Whether `[start, end)` overlaps a slot-holding appointment of the scope on `date`.
    pub async fn find_conflicts(
        &self,
        kind: ScopeKind,
        scope_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
        end: TimeOfDay,
    ) -> Result<bool, SchedulingError> {
        if end <= start {
            return Err(SchedulingError::EmptyInterval { start, end });
        }
        let key = ScopeDayKey::new(Scope { kind, id: scope_id }, date);
        let Some(day) = self.scope_days.get(&key).map(|e| e.value().clone()) else {
            return Ok(false);
        };
        let guard = day.read().await;
        Ok(has_conflict(
            &guard,
            &Span::new(start.to_minutes(), end.to_minutes()),
            None,
        ))
    }

    /// Free start times for a clinician, stepping through the working window.
    /// `granularity_minutes` falls back to the configured slot granularity.
    pub async fn list_availability(
        &self,
        clinician_id: Ulid,
        date: NaiveDate,
        duration_minutes: u32,
        granularity_minutes: Option<u32>,
    ) -> Result<AvailableSlots, SchedulingError> {
        if duration_minutes == 0 {
            return Err(SchedulingError::InvalidDuration {
                minutes: 0,
                min: self.config.min_duration_minutes,
                max: self.config.max_duration_minutes,
            });
        }
        let step = granularity_minutes.unwrap_or(self.config.slot_granularity_minutes);
        if step == 0 {
            return Err(SchedulingError::LimitExceeded("granularity must be positive"));
        }
        let busy = self
            .busy_spans(ScopeDayKey::new(Scope::clinician(clinician_id), date))
            .await;
        Ok(available_slots(
            self.config.window_start,
            self.config.window_end,
            busy,
            duration_minutes,
            step,
        ))
    }
}
