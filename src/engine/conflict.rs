use ulid::Ulid;

use crate::model::*;
use crate::time::Span;

use super::SchedulingError;

/// First appointment in `day` whose interval overlaps `span`, skipping `exclude`.
///
/// `day` only ever holds slot-holding appointments, so cancelled and no-show
/// bookings never show up here.
pub fn find_conflict(day: &ScopeDay, span: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    day.overlapping(span)
        .find(|r| Some(r.appointment_id) != exclude && r.span.overlaps(span))
        .map(|r| r.appointment_id)
}

pub fn has_conflict(day: &ScopeDay, span: &Span, exclude: Option<Ulid>) -> bool {
    find_conflict(day, span, exclude).is_some()
}

/// Overlap predicate over a plain snapshot of busy spans.
pub fn overlaps_any(busy: &[Span], span: &Span) -> bool {
    busy.iter().any(|b| b.overlaps(span))
}

/// Scan one scope and map a hit to that scope's error kind.
pub(crate) fn check_scope(
    day: &ScopeDay,
    span: &Span,
    exclude: Option<Ulid>,
) -> Result<(), SchedulingError> {
    match find_conflict(day, span, exclude) {
        None => Ok(()),
        Some(with) => Err(conflict_error(day.key.scope.kind, with)),
    }
}

pub(crate) fn conflict_error(kind: ScopeKind, with: Ulid) -> SchedulingError {
    match kind {
        ScopeKind::Patient => SchedulingError::PatientConflict(with),
        ScopeKind::Clinician => SchedulingError::ClinicianConflict(with),
    }
}
