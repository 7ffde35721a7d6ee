use tokio::sync::oneshot;
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability;

use super::conflict::check_scope;
use super::lifecycle::{check_reschedulable, check_transition};
use super::rules::validate_booking;
use super::{Engine, SchedulingError, WalCommand};

/// Outcome of one optimistic attempt.
enum Attempt<T> {
    Done(T),
    /// The appointment changed between the unlocked read and lock acquisition.
    Stale,
}

/// Only the owning clinician may touch an appointment.
fn authorize(appointment: &Appointment, caller: Ulid) -> Result<(), SchedulingError> {
    if appointment.clinician_id != caller {
        return Err(SchedulingError::Forbidden {
            appointment: appointment.id,
            caller,
        });
    }
    Ok(())
}

fn record_rejection(op: &'static str, err: &SchedulingError) {
    metrics::counter!(observability::REJECTIONS_TOTAL, "op" => op, "code" => err.code())
        .increment(1);
    if let SchedulingError::PatientConflict(_) | SchedulingError::ClinicianConflict(_) = err {
        metrics::counter!(observability::CONFLICTS_TOTAL, "code" => err.code()).increment(1);
    }
}

fn stale_exhausted(id: Ulid) -> SchedulingError {
    SchedulingError::StoreUnavailable(format!("appointment {id} kept changing concurrently"))
}

impl Engine {
    pub async fn register_patient(&self, id: Ulid, active: bool) -> Result<(), SchedulingError> {
        if !self.patients.contains(&id) && self.patients.len() >= MAX_PATIENTS_PER_PRACTICE {
            return Err(SchedulingError::LimitExceeded("too many patients"));
        }
        let txn = self.begin(&[]).await;
        self.commit(txn, Event::PatientRegistered { id, active }).await?;
        Ok(())
    }

    /// Book a new appointment for `caller`, who becomes its clinician.
    pub async fn create_appointment(
        &self,
        request: BookingRequest,
        caller: Ulid,
    ) -> Result<Appointment, SchedulingError> {
        self.try_create(request, caller)
            .await
            .inspect_err(|e| record_rejection("create", e))
    }

    async fn try_create(
        &self,
        request: BookingRequest,
        caller: Ulid,
    ) -> Result<Appointment, SchedulingError> {
        if request.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(SchedulingError::LimitExceeded("notes too long"));
        }
        let now = self.now();
        let span = validate_booking(
            &self.config,
            request.date,
            request.start,
            request.duration_minutes,
            now,
        )?;
        if !self.directory.patient_exists(request.patient_id).await {
            return Err(SchedulingError::PatientNotFound(request.patient_id));
        }
        if !self.directory.patient_is_active(request.patient_id).await {
            return Err(SchedulingError::PatientInactive(request.patient_id));
        }
        // Held until the appointment is published, whatever scope-days it locks.
        let _claim = self.claim_id(request.id)?;
        if self.appointments.len() >= MAX_APPOINTMENTS_PER_PRACTICE {
            return Err(SchedulingError::LimitExceeded("too many appointments"));
        }

        let appointment = Appointment {
            id: request.id,
            patient_id: request.patient_id,
            clinician_id: caller,
            date: request.date,
            start: request.start,
            duration_minutes: request.duration_minutes,
            status: AppointmentStatus::Scheduled,
            kind: request.kind,
            notes: request.notes,
            created_at: now,
            updated_at: now,
            version: 1,
        };
        let keys = appointment.scope_days();
        let txn = self.begin(&keys).await;
        // Patient first, then clinician: the patient's clash is the one reported.
        for key in &keys {
            let day = txn.day(key)?;
            if day.reservations.len() >= MAX_RESERVATIONS_PER_SCOPE_DAY {
                return Err(SchedulingError::LimitExceeded("too many appointments on one day"));
            }
            check_scope(day, &span, None)?;
        }

        self.commit(txn, Event::AppointmentBooked { appointment: appointment.clone() })
            .await?;
        info!(
            "booked {} for patient {} with clinician {} on {} at {}",
            appointment.id, appointment.patient_id, caller, appointment.date, appointment.start
        );
        Ok(appointment)
    }

    /// Move an appointment. Unset fields keep their current values.
    pub async fn reschedule_appointment(
        &self,
        id: Ulid,
        changes: Reschedule,
        caller: Ulid,
    ) -> Result<Appointment, SchedulingError> {
        self.reschedule_with_retry(id, changes, caller)
            .await
            .inspect_err(|e| record_rejection("reschedule", e))
    }

    async fn reschedule_with_retry(
        &self,
        id: Ulid,
        changes: Reschedule,
        caller: Ulid,
    ) -> Result<Appointment, SchedulingError> {
        for _ in 0..2 {
            match self.try_reschedule(id, changes, caller).await? {
                Attempt::Done(appointment) => return Ok(appointment),
                Attempt::Stale => self.note_stale("reschedule", id),
            }
        }
        Err(stale_exhausted(id))
    }

    async fn try_reschedule(
        &self,
        id: Ulid,
        changes: Reschedule,
        caller: Ulid,
    ) -> Result<Attempt<Appointment>, SchedulingError> {
        let snapshot = self.current(&id)?;
        authorize(&snapshot, caller)?;
        check_reschedulable(snapshot.status)?;

        let date = changes.date.unwrap_or(snapshot.date);
        let start = changes.start.unwrap_or(snapshot.start);
        let duration_minutes = changes.duration_minutes.unwrap_or(snapshot.duration_minutes);
        let span = validate_booking(&self.config, date, start, duration_minutes, self.now())?;

        let targets = [
            ScopeDayKey::new(snapshot.patient_scope(), date),
            ScopeDayKey::new(snapshot.clinician_scope(), date),
        ];
        let mut keys = snapshot.scope_days().to_vec();
        keys.extend(targets);
        let txn = self.begin(&keys).await;

        let current = self.current(&id)?;
        if current.version != snapshot.version {
            return Ok(Attempt::Stale);
        }
        for key in &targets {
            let day = txn.day(key)?;
            if key.date != snapshot.date && day.reservations.len() >= MAX_RESERVATIONS_PER_SCOPE_DAY {
                return Err(SchedulingError::LimitExceeded("too many appointments on one day"));
            }
            check_scope(day, &span, Some(id))?;
        }

        let event = Event::AppointmentRescheduled {
            id,
            date,
            start,
            duration_minutes,
            at: self.now(),
        };
        let updated = self.commit(txn, event).await?.ok_or(SchedulingError::NotFound(id))?;
        info!("rescheduled {id} to {date} at {start} for {duration_minutes} min");
        Ok(Attempt::Done(updated))
    }

    /// Move an appointment along its lifecycle.
    /// Cancelling or marking a no-show frees the interval for other bookings.
    pub async fn set_appointment_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
        caller: Ulid,
    ) -> Result<Appointment, SchedulingError> {
        self.set_status_with_retry(id, status, caller)
            .await
            .inspect_err(|e| record_rejection("set_status", e))
    }

    async fn set_status_with_retry(
        &self,
        id: Ulid,
        status: AppointmentStatus,
        caller: Ulid,
    ) -> Result<Appointment, SchedulingError> {
        for _ in 0..2 {
            match self.try_set_status(id, status, caller).await? {
                Attempt::Done(appointment) => return Ok(appointment),
                Attempt::Stale => self.note_stale("set_status", id),
            }
        }
        Err(stale_exhausted(id))
    }

    async fn try_set_status(
        &self,
        id: Ulid,
        status: AppointmentStatus,
        caller: Ulid,
    ) -> Result<Attempt<Appointment>, SchedulingError> {
        let snapshot = self.current(&id)?;
        authorize(&snapshot, caller)?;
        check_transition(snapshot.status, status, snapshot.starts_at(), self.now())?;

        let txn = self.begin(&snapshot.scope_days()).await;
        if self.current(&id)?.version != snapshot.version {
            return Ok(Attempt::Stale);
        }
        let event = Event::AppointmentStatusChanged {
            id,
            status,
            at: self.now(),
        };
        let updated = self.commit(txn, event).await?.ok_or(SchedulingError::NotFound(id))?;
        info!("appointment {id}: {} -> {status}", snapshot.status);
        Ok(Attempt::Done(updated))
    }

    /// Remove an appointment outright, releasing its interval if held.
    pub async fn delete_appointment(&self, id: Ulid, caller: Ulid) -> Result<(), SchedulingError> {
        for _ in 0..2 {
            let snapshot = self.current(&id)?;
            authorize(&snapshot, caller)?;
            let txn = self.begin(&snapshot.scope_days()).await;
            if self.current(&id)?.version != snapshot.version {
                self.note_stale("delete", id);
                continue;
            }
            self.commit(txn, Event::AppointmentDeleted { id }).await?;
            info!("deleted appointment {id}");
            return Ok(());
        }
        Err(stale_exhausted(id))
    }

    fn note_stale(&self, op: &'static str, id: Ulid) {
        warn!("{op} of {id} lost a race with a concurrent change, retrying");
        metrics::counter!(observability::COMMIT_RETRIES_TOTAL, "reason" => "version").increment(1);
    }

    /// Rewrite the WAL as a snapshot of current patients and appointments.
    pub async fn compact_wal(&self) -> Result<(), SchedulingError> {
        let _gate = self.commit_gate.write().await;

        let mut events: Vec<Event> = self
            .patients
            .snapshot()
            .into_iter()
            .map(|(id, active)| Event::PatientRegistered { id, active })
            .collect();
        let mut appointments: Vec<Appointment> =
            self.appointments.iter().map(|e| e.value().clone()).collect();
        // Deterministic output; ULIDs sort by creation time.
        appointments.sort_by_key(|a| a.id);
        events.extend(
            appointments
                .into_iter()
                .map(|appointment| Event::AppointmentBooked { appointment }),
        );
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| SchedulingError::StoreUnavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| SchedulingError::StoreUnavailable("WAL writer dropped response".into()))?
            .map_err(|e| SchedulingError::StoreUnavailable(e.to_string()))?;
        info!("compacted WAL to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
