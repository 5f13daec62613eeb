use chrono::{Datelike, Duration, NaiveDateTime};

use crate::types::{Job, Recurrence, TriggerTime};

/// Compute the next local trigger instant strictly after `now`.
///
/// Returns `None` for a `once` job that has already run (`last_run_at` set).
/// The result depends only on the arguments, never on the wall clock.
pub fn compute_next(
    trigger: TriggerTime,
    recurrence: Recurrence,
    last_run_at: Option<NaiveDateTime>,
    now: NaiveDateTime,
) -> Option<NaiveDateTime> {
    if recurrence == Recurrence::Once && last_run_at.is_some() {
        return None;
    }

    // Today's candidate at HH:MM:00; roll to tomorrow once it has passed.
    let mut candidate = now.date().and_time(trigger.as_naive());
    if candidate <= now {
        candidate += Duration::days(1);
    }

    // Every recurrence allows at least one weekday, so this ends within a week.
    while !recurrence.allows(candidate.weekday()) {
        candidate += Duration::days(1);
    }
    Some(candidate)
}

/// What the periodic scan should do with a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DueState {
    /// Disabled, exhausted, or its trigger is still in the future.
    Idle,
    /// Enabled and `next_run_at <= now`: enqueue it.
    Due,
    /// Enabled but never evaluated: compute `next_run_at`, do not run yet.
    Unscheduled,
}

/// Classify `job` against `now`.
pub fn due_state(job: &Job, now: NaiveDateTime) -> DueState {
    if !job.enabled {
        return DueState::Idle;
    }
    match job.next_run_at {
        Some(next) if next <= now => DueState::Due,
        Some(_) => DueState::Idle,
        None if job.is_exhausted() => DueState::Idle,
        None => DueState::Unscheduled,
    }
}
