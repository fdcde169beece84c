//! Effective priority resolution.
//!
//! Maps a task's base priority plus its temporal urgency to a comparable
//! scalar. Pure and I/O free so it can run from any context, including a
//! background trigger handler.
//!
//! `effective = base * 100 + urgency`, where urgency is bounded below one
//! base step: a task can climb over peers of its own base priority but never
//! over a task one level above it.

use crate::task::Task;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::cmp::Ordering;

/// Weight of one base-priority step.
const BASE_WEIGHT: u32 = 100;

const OVERDUE_BONUS: u32 = 60;
const WITHIN_15_MIN_BONUS: u32 = 40;
const WITHIN_HOUR_BONUS: u32 = 20;
const WITHIN_DAY_BONUS: u32 = 5;

/// Derived, comparable priority score. Higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EffectivePriority(u32);

impl EffectivePriority {
    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }
}

/// Urgency bonus derived from how close the task's due time is to `now`.
fn urgency(task: &Task, now: DateTime<Utc>) -> u32 {
    let Some(due) = task.scheduled_at else {
        return 0;
    };
    if due <= now {
        return OVERDUE_BONUS;
    }
    let until = due - now;
    if until <= ChronoDuration::minutes(15) {
        WITHIN_15_MIN_BONUS
    } else if until <= ChronoDuration::hours(1) {
        WITHIN_HOUR_BONUS
    } else if until <= ChronoDuration::hours(24) {
        WITHIN_DAY_BONUS
    } else {
        0
    }
}

/// Compute the effective priority of `task` at `now`.
#[must_use]
pub fn effective_priority(task: &Task, now: DateTime<Utc>) -> EffectivePriority {
    EffectivePriority(u32::from(task.priority.value()) * BASE_WEIGHT + urgency(task, now))
}

/// Compare two tasks for arbitration.
///
/// Orders by effective priority, then by earlier deadline (a scheduled task
/// beats an unscheduled one). Returns [`Ordering::Equal`] for a full tie; the
/// caller breaks that by arrival order.
#[must_use]
pub fn compare(a: &Task, b: &Task, now: DateTime<Utc>) -> Ordering {
    effective_priority(a, now)
        .cmp(&effective_priority(b, now))
        .then_with(|| match (a.scheduled_at, b.scheduled_at) {
            (Some(da), Some(db)) => db.cmp(&da),
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => Ordering::Equal,
        })
}

/// Returns `true` when `proposal` strictly outranks `active`.
///
/// Ties keep the incumbent, which arrived first.
#[must_use]
pub fn preempts(proposal: &Task, active: &Task, now: DateTime<Utc>) -> bool {
    compare(proposal, active, now) == Ordering::Greater
}
