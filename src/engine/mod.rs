mod availability;
mod conflict;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod rules;
mod txn;

pub use availability::{available_slots, AvailableSlots};
pub use conflict::{find_conflict, has_conflict, overlaps_any};
pub use error::SchedulingError;
pub use lifecycle::{check_reschedulable, check_transition, next_statuses};
pub use rules::validate_booking;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDateTime;
use dashmap::{DashMap, DashSet};
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::config::SchedulingConfig;
use crate::directory::{PatientDirectory, PatientRegistry};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability;
use crate::time::Clock;
use crate::wal::Wal;

use txn::Txn;

pub type SharedScopeDay = Arc<RwLock<ScopeDay>>;

/// An appointment id reserved by an in-flight create. Dropped after the
/// appointment is published, or when the create gives up.
pub(super) struct IdClaim<'a> {
    claimed: &'a DashSet<Ulid>,
    id: Ulid,
}

impl Drop for IdClaim<'_> {
    fn drop(&mut self) {
        self.claimed.remove(&self.id);
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result. A failed batch is
///    discarded as a whole, which keeps the single retry in `append_durably` safe.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                flush_and_respond(&mut wal, &mut batch);
                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<Pending>) {
    metrics::histogram!(observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// All or nothing: on any failure the batch is cut from the file again, so
/// a caller told its append failed never sees the event come back on replay.
fn flush_batch(wal: &mut Wal, batch: &[Pending]) -> io::Result<()> {
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.discard_unsynced()
    {
        error!("could not discard a failed WAL batch: {e}");
    }
    result
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the writer loop"),
    }
}

// ── Engine ───────────────────────────────────────────────

/// One practice's scheduling store.
///
/// Appointments live in a flat map; each (scope, date) pair owns a locked
/// [`ScopeDay`] holding the intervals of slot-holding appointments. Every
/// mutation write-locks the scope-days it touches in sorted order, stages its
/// reservations, appends to the WAL and only then publishes to the map.
pub struct Engine {
    pub(super) appointments: DashMap<Ulid, Appointment>,
    pub(super) scope_days: DashMap<ScopeDayKey, SharedScopeDay>,
    /// Ids of creates between their duplicate check and publish.
    pub(super) claimed_ids: DashSet<Ulid>,
    pub(super) patients: Arc<PatientRegistry>,
    pub(super) directory: Arc<dyn PatientDirectory>,
    pub(super) config: SchedulingConfig,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Commits hold this shared; compaction takes it exclusively so the
    /// snapshot it writes cannot miss a concurrent append.
    pub(super) commit_gate: RwLock<()>,
    pub notify: Arc<NotifyHub>,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        config: SchedulingConfig,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let patients = Arc::new(PatientRegistry::new());
        let directory: Arc<dyn PatientDirectory> = patients.clone();
        let engine = Self {
            appointments: DashMap::new(),
            scope_days: DashMap::new(),
            claimed_ids: DashSet::new(),
            patients,
            directory,
            config,
            clock,
            wal_tx,
            commit_gate: RwLock::new(()),
            notify,
        };

        // Sole owner of every lock here, so try_write_owned never contends.
        // Blocking lock calls are off limits: this may run inside the runtime.
        for event in &events {
            engine.replay_event(event)?;
        }
        if !events.is_empty() {
            info!(
                "replayed {} events from {}: {} appointments, {} patients",
                events.len(),
                wal_path.display(),
                engine.appointments.len(),
                engine.patients.len()
            );
        }
        Ok(engine)
    }

    /// Swap the patient lookup for an external directory.
    /// The built-in registry keeps receiving `register_patient` calls.
    pub fn with_patient_directory(mut self, directory: Arc<dyn PatientDirectory>) -> Self {
        self.directory = directory;
        self
    }

    pub fn config(&self) -> &SchedulingConfig {
        &self.config
    }

    pub fn patients(&self) -> &PatientRegistry {
        &self.patients
    }

    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    fn replay_event(&self, event: &Event) -> io::Result<()> {
        let mut keys = self.event_scope_days(event);
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            let guard = self
                .scope_day(key)
                .try_write_owned()
                .map_err(|_| io::Error::other("replay: scope-day unexpectedly locked"))?;
            guards.push((key, guard));
        }
        let mut txn = Txn::new(guards).pruning(&self.scope_days);
        if let Err(e) = self.stage(event, &mut txn) {
            warn!("replay: skipping {}: {e}", event.name());
            txn.rollback();
            return Ok(());
        }
        self.publish(event);
        Ok(())
    }

    /// Scope-days an event touches, computed against the current map.
    fn event_scope_days(&self, event: &Event) -> Vec<ScopeDayKey> {
        match event {
            Event::PatientRegistered { .. } => Vec::new(),
            Event::AppointmentBooked { appointment } => appointment.scope_days().to_vec(),
            Event::AppointmentRescheduled { id, date, .. } => match self.appointments.get(id) {
                Some(prior) => {
                    let mut keys = prior.scope_days().to_vec();
                    keys.push(ScopeDayKey::new(prior.patient_scope(), *date));
                    keys.push(ScopeDayKey::new(prior.clinician_scope(), *date));
                    keys
                }
                None => Vec::new(),
            },
            Event::AppointmentStatusChanged { id, .. } | Event::AppointmentDeleted { id } => self
                .appointments
                .get(id)
                .map(|prior| prior.scope_days().to_vec())
                .unwrap_or_default(),
        }
    }

    pub(super) fn scope_day(&self, key: ScopeDayKey) -> SharedScopeDay {
        self.scope_days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(ScopeDay::new(key))))
            .value()
            .clone()
    }

    /// Write-lock scope-days in ascending key order. Concurrent transactions
    /// over overlapping sets therefore cannot deadlock.
    pub(super) async fn begin(&self, keys: &[ScopeDayKey]) -> Txn<'_> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in keys {
            guards.push((key, self.scope_day(key).write_owned().await));
        }
        Txn::new(guards).pruning(&self.scope_days)
    }

    /// Reserve `id` for a create. Fails if the id is taken or being booked.
    pub(super) fn claim_id(&self, id: Ulid) -> Result<IdClaim<'_>, SchedulingError> {
        if !self.claimed_ids.insert(id) {
            return Err(SchedulingError::AlreadyExists(id));
        }
        let claim = IdClaim {
            claimed: &self.claimed_ids,
            id,
        };
        if self.appointments.contains_key(&id) {
            return Err(SchedulingError::AlreadyExists(id));
        }
        Ok(claim)
    }

    fn current(&self, id: &Ulid) -> Result<Appointment, SchedulingError> {
        self.appointments
            .get(id)
            .map(|a| a.value().clone())
            .ok_or(SchedulingError::NotFound(*id))
    }

    /// Apply an event's reservation changes inside `txn`.
    fn stage(&self, event: &Event, txn: &mut Txn<'_>) -> Result<(), SchedulingError> {
        match event {
            Event::PatientRegistered { .. } => Ok(()),
            Event::AppointmentBooked { appointment } => {
                if self.appointments.contains_key(&appointment.id) {
                    return Err(SchedulingError::AlreadyExists(appointment.id));
                }
                if appointment.status.holds_slot() {
                    for key in appointment.scope_days() {
                        txn.reserve(key, appointment.id, appointment.span())?;
                    }
                }
                Ok(())
            }
            Event::AppointmentRescheduled {
                id,
                date,
                start,
                duration_minutes,
                ..
            } => {
                let prior = self.current(id)?;
                if !prior.status.holds_slot() {
                    return Ok(());
                }
                for key in prior.scope_days() {
                    txn.release(key, *id)?;
                }
                let moved = Appointment {
                    date: *date,
                    start: *start,
                    duration_minutes: *duration_minutes,
                    ..prior
                };
                for key in moved.scope_days() {
                    txn.reserve(key, *id, moved.span())?;
                }
                Ok(())
            }
            Event::AppointmentStatusChanged { id, status, .. } => {
                let prior = self.current(id)?;
                if prior.status.holds_slot() && !status.holds_slot() {
                    for key in prior.scope_days() {
                        txn.release(key, *id)?;
                    }
                }
                Ok(())
            }
            Event::AppointmentDeleted { id } => {
                let prior = self.current(id)?;
                for key in prior.scope_days() {
                    txn.release(key, *id)?;
                }
                Ok(())
            }
        }
    }

    /// Make a durable event visible in the appointment map.
    /// Returns the affected appointment as it now stands (or stood, for deletes).
    fn publish(&self, event: &Event) -> Option<Appointment> {
        match event {
            Event::PatientRegistered { id, active } => {
                self.patients.upsert(*id, *active);
                None
            }
            Event::AppointmentBooked { appointment } => {
                self.appointments.insert(appointment.id, appointment.clone());
                Some(appointment.clone())
            }
            Event::AppointmentRescheduled {
                id,
                date,
                start,
                duration_minutes,
                at,
            } => {
                let mut entry = self.appointments.get_mut(id)?;
                entry.date = *date;
                entry.start = *start;
                entry.duration_minutes = *duration_minutes;
                entry.updated_at = *at;
                entry.version += 1;
                Some(entry.value().clone())
            }
            Event::AppointmentStatusChanged { id, status, at } => {
                let mut entry = self.appointments.get_mut(id)?;
                entry.status = *status;
                entry.updated_at = *at;
                entry.version += 1;
                Some(entry.value().clone())
            }
            Event::AppointmentDeleted { id } => self.appointments.remove(id).map(|(_, a)| a),
        }
    }

    /// Stage, persist, publish. Any failure before the WAL acknowledges the
    /// event rolls the staged reservations back. Locks are released last.
    pub(super) async fn commit(
        &self,
        mut txn: Txn<'_>,
        event: Event,
    ) -> Result<Option<Appointment>, SchedulingError> {
        if let Err(e) = self.stage(&event, &mut txn) {
            txn.rollback();
            return Err(e);
        }
        let _gate = self.commit_gate.read().await;
        if let Err(e) = self.append_durably(&event).await {
            txn.rollback();
            return Err(e);
        }
        let published = self.publish(&event);
        if let Some(appointment) = &published {
            self.notify.send(appointment.clinician_id, &event);
        }
        metrics::counter!(observability::COMMITS_TOTAL, "event" => event.name()).increment(1);
        debug!("committed {}", event.name());
        drop(txn);
        Ok(published)
    }

    /// WAL append with a single retry before giving up.
    async fn append_durably(&self, event: &Event) -> Result<(), SchedulingError> {
        let Err(first) = self.wal_append(event).await else {
            return Ok(());
        };
        warn!("WAL append of {} failed, retrying: {first}", event.name());
        metrics::counter!(observability::COMMIT_RETRIES_TOTAL, "reason" => "wal").increment(1);
        self.wal_append(event).await.map_err(|e| {
            error!("WAL append of {} failed twice: {e}", event.name());
            SchedulingError::StoreUnavailable(e.to_string())
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| io::Error::other("WAL writer shut down"))?;
        rx.await
            .map_err(|_| io::Error::other("WAL writer dropped response"))?
    }
}
