use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OwnedRwLockWriteGuard;
use ulid::Ulid;

use crate::model::*;
use crate::time::Span;

use super::conflict::conflict_error;
use super::{SchedulingError, SharedScopeDay};

pub(super) type ScopeDayGuard = OwnedRwLockWriteGuard<ScopeDay>;

enum Undo {
    Reserved {
        key: ScopeDayKey,
        id: Ulid,
        previous: Option<Reservation>,
    },
    Released {
        key: ScopeDayKey,
        reservation: Reservation,
    },
}

/// Write locks on a set of scope-days plus an undo log of staged changes.
///
/// Staged reservations are invisible to other tasks until the locks drop,
/// so a rollback before that point leaves no trace. Scope-days left empty
/// are removed from the registry when the transaction ends.
pub(super) struct Txn<'a> {
    days: Vec<(ScopeDayKey, ScopeDayGuard)>,
    undo: Vec<Undo>,
    registry: Option<&'a DashMap<ScopeDayKey, SharedScopeDay>>,
}

impl<'a> Txn<'a> {
    pub(super) fn new(mut days: Vec<(ScopeDayKey, ScopeDayGuard)>) -> Self {
        days.sort_by_key(|(key, _)| *key);
        Self {
            days,
            undo: Vec::new(),
            registry: None,
        }
    }

    pub(super) fn pruning(mut self, registry: &'a DashMap<ScopeDayKey, SharedScopeDay>) -> Self {
        self.registry = Some(registry);
        self
    }

    fn index(&self, key: &ScopeDayKey) -> Result<usize, SchedulingError> {
        self.days
            .binary_search_by_key(key, |(k, _)| *k)
            .map_err(|_| {
                SchedulingError::StoreUnavailable(format!(
                    "{} {} on {} not locked",
                    key.scope.kind, key.scope.id, key.date
                ))
            })
    }

    pub(super) fn day(&self, key: &ScopeDayKey) -> Result<&ScopeDay, SchedulingError> {
        let i = self.index(key)?;
        Ok(&self.days[i].1)
    }

    /// Stage a reservation through the scope-day's exclusion constraint.
    pub(super) fn reserve(
        &mut self,
        key: ScopeDayKey,
        id: Ulid,
        span: Span,
    ) -> Result<(), SchedulingError> {
        let i = self.index(&key)?;
        let day = &mut self.days[i].1;
        let previous = day
            .reservations
            .iter()
            .find(|r| r.appointment_id == id)
            .copied();
        day.reserve(id, span)
            .map_err(|with| conflict_error(key.scope.kind, with))?;
        self.undo.push(Undo::Reserved { key, id, previous });
        Ok(())
    }

    pub(super) fn release(&mut self, key: ScopeDayKey, id: Ulid) -> Result<(), SchedulingError> {
        let i = self.index(&key)?;
        if let Some(reservation) = self.days[i].1.release(id) {
            self.undo.push(Undo::Released { key, reservation });
        }
        Ok(())
    }

    /// Undo staged changes in reverse order, then release the locks.
    pub(super) fn rollback(mut self) {
        while let Some(step) = self.undo.pop() {
            let (key, restore) = match step {
                Undo::Reserved { key, id, previous } => {
                    if let Ok(i) = self.index(&key) {
                        self.days[i].1.release(id);
                    }
                    (key, previous)
                }
                Undo::Released { key, reservation } => (key, Some(reservation)),
            };
            if let (Some(r), Ok(i)) = (restore, self.index(&key)) {
                // Restoring a slot that was held a moment ago cannot clash.
                let _ = self.days[i].1.reserve(r.appointment_id, r.span);
            }
        }
    }
}

impl Drop for Txn<'_> {
    fn drop(&mut self) {
        let Some(registry) = self.registry else {
            return;
        };
        for (key, guard) in self.days.drain(..) {
            let empty = guard.reservations.is_empty();
            drop(guard);
            if empty {
                // Under the shard lock a lone Arc cannot be cloned, so nobody
                // else can be holding or waiting for this day.
                registry.remove_if(&key, |_, day| {
                    Arc::strong_count(day) == 1
                        && day.try_read().is_ok_and(|d| d.reservations.is_empty())
                });
            }
        }
    }
}
