use std::iter::FusedIterator;

use crate::time::{Minute, Span, TimeOfDay};

use super::conflict::overlaps_any;

// ── Slot enumeration ──────────────────────────────────────────────

/// Lazy sequence of free start times for one clinician-day.
///
/// Candidates are `window_start + k * granularity` for every `k` whose
/// `[start, start + duration)` still ends inside the window; a candidate is
/// emitted when it overlaps none of the busy spans. The busy spans are an
/// owned snapshot, so the sequence is deterministic and can be replayed
/// with [`AvailableSlots::restart`] or by cloning before iteration.
#[derive(Debug, Clone)]
pub struct AvailableSlots {
    busy: Vec<Span>,
    first: u32,
    /// Last admissible start, `None` when nothing fits.
    last: Option<u32>,
    duration: u32,
    step: u32,
    next: u32,
}

pub fn available_slots(
    window_start: TimeOfDay,
    window_end: TimeOfDay,
    busy: Vec<Span>,
    duration_minutes: u32,
    granularity_minutes: u32,
) -> AvailableSlots {
    let first = window_start.to_minutes() as u32;
    let end = window_end.to_minutes() as u32;
    let last = if duration_minutes == 0 || granularity_minutes == 0 {
        None
    } else {
        end.checked_sub(duration_minutes).filter(|&last| last >= first)
    };
    AvailableSlots {
        busy,
        first,
        last,
        duration: duration_minutes,
        step: granularity_minutes,
        next: first,
    }
}

impl AvailableSlots {
    /// Rewind to the first candidate.
    pub fn restart(&mut self) {
        self.next = self.first;
    }

    fn remaining_candidates(&self) -> usize {
        match self.last {
            Some(last) if self.next <= last => ((last - self.next) / self.step + 1) as usize,
            _ => 0,
        }
    }
}

impl Iterator for AvailableSlots {
    type Item = TimeOfDay;

    fn next(&mut self) -> Option<TimeOfDay> {
        let last = self.last?;
        while self.next <= last {
            let start = self.next;
            self.next += self.step;
            let span = Span::new(start as Minute, (start + self.duration) as Minute);
            if !overlaps_any(&self.busy, &span) {
                return TimeOfDay::from_minutes(start).ok();
            }
        }
        None
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining_candidates()))
    }
}

impl FusedIterator for AvailableSlots {}
