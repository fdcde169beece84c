//! Task and geofence data model.
//!
//! Tasks and geofences are owned by the external stores; the core only holds
//! transient snapshots of them.

use crate::error::{AttendError, Result};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque task identifier assigned by the task store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        s.trim().parse().map(Self)
    }
}

/// Opaque geofence identifier assigned by the geofence store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GeofenceId(pub i64);

impl fmt::Display for GeofenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Base task priority, 1 (lowest) through 5 (highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(1);
    pub const MAX: Priority = Priority(5);

    /// Build a priority, rejecting values outside `1..=5`.
    pub fn new(value: u8) -> Result<Self> {
        if (Self::MIN.0..=Self::MAX.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(AttendError::InvalidTask(format!(
                "priority {value} outside 1..=5"
            )))
        }
    }

    #[must_use]
    pub fn value(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(3)
    }
}

impl TryFrom<u8> for Priority {
    type Error = AttendError;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(p: Priority) -> Self {
        p.0
    }
}

/// Day of the week for weekly recurrences.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl From<chrono::Weekday> for Weekday {
    fn from(day: chrono::Weekday) -> Self {
        match day {
            chrono::Weekday::Mon => Self::Mon,
            chrono::Weekday::Tue => Self::Tue,
            chrono::Weekday::Wed => Self::Wed,
            chrono::Weekday::Thu => Self::Thu,
            chrono::Weekday::Fri => Self::Fri,
            chrono::Weekday::Sat => Self::Sat,
            chrono::Weekday::Sun => Self::Sun,
        }
    }
}

/// How a task repeats after it is stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Recurrence {
    /// Same time every day.
    Daily,
    /// Same time on each listed weekday.
    Weekly {
        /// Days the task recurs on. An empty list never recurs.
        weekdays: Vec<Weekday>,
    },
    /// Every N minutes.
    EveryMinutes {
        /// Minutes between occurrences.
        minutes: u32,
    },
}

impl Recurrence {
    /// Next occurrence strictly after `now`, anchored on `anchor`'s time of day.
    #[must_use]
    pub fn next_after(&self, anchor: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Daily => {
                if anchor > now {
                    return Some(anchor);
                }
                let days = (now - anchor).num_days() + 1;
                Some(anchor + ChronoDuration::days(days))
            }
            Self::Weekly { weekdays } => {
                if weekdays.is_empty() {
                    return None;
                }
                let start = if anchor > now {
                    anchor
                } else {
                    anchor + ChronoDuration::days((now - anchor).num_days())
                };
                (0..=7)
                    .map(|offset| start + ChronoDuration::days(offset))
                    .find(|candidate| {
                        *candidate > now && weekdays.contains(&Weekday::from(candidate.weekday()))
                    })
            }
            Self::EveryMinutes { minutes } => {
                if *minutes == 0 {
                    return None;
                }
                let step = ChronoDuration::minutes(i64::from(*minutes));
                if anchor > now {
                    return Some(anchor);
                }
                let steps = (now - anchor).num_minutes() / i64::from(*minutes) + 1;
                let mut next = anchor + step * i32::try_from(steps).ok()?;
                while next <= now {
                    next += step;
                }
                Some(next)
            }
        }
    }
}

/// A reminder task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Store-assigned id; `None` until persisted.
    pub id: Option<TaskId>,
    /// Display name.
    pub name: String,
    /// Base priority (1-5).
    pub priority: Priority,
    /// When the task is due, if scheduled.
    #[serde(default)]
    pub scheduled_at: Option<DateTime<Utc>>,
    /// Recurrence rule, if the task repeats.
    #[serde(default)]
    pub recurrence: Option<Recurrence>,
    /// Associated geofence (foreign key into the geofence store).
    #[serde(default)]
    pub geofence_id: Option<GeofenceId>,
    /// Whether the task has been completed.
    #[serde(default)]
    pub completed: bool,
}

impl Task {
    /// Create an unscheduled, unpersisted task.
    pub fn new(name: impl Into<String>, priority: Priority) -> Self {
        Self {
            id: None,
            name: name.into(),
            priority,
            scheduled_at: None,
            recurrence: None,
            geofence_id: None,
            completed: false,
        }
    }

    /// Builder: set the id.
    #[must_use]
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(TaskId(id));
        self
    }

    /// Builder: set the due time.
    #[must_use]
    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Builder: set the recurrence rule.
    #[must_use]
    pub fn recurring(mut self, recurrence: Recurrence) -> Self {
        self.recurrence = Some(recurrence);
        self
    }

    /// Builder: attach a geofence.
    #[must_use]
    pub fn with_geofence(mut self, geofence_id: GeofenceId) -> Self {
        self.geofence_id = Some(geofence_id);
        self
    }

    /// The persisted id, or an error for tasks the store has not seen yet.
    pub fn require_id(&self) -> Result<TaskId> {
        self.id
            .ok_or_else(|| AttendError::InvalidTask(format!("task '{}' has no id", self.name)))
    }

    #[must_use]
    pub fn is_recurring(&self) -> bool {
        self.recurrence.is_some()
    }

    /// Move `scheduled_at` to the next occurrence after `now`.
    ///
    /// Returns `false` when the task does not recur (or its rule never fires
    /// again); the caller should then mark it complete.
    pub fn advance_occurrence(&mut self, now: DateTime<Utc>) -> bool {
        let Some(rule) = &self.recurrence else {
            return false;
        };
        let anchor = self.scheduled_at.unwrap_or(now);
        match rule.next_after(anchor, now) {
            Some(next) => {
                self.scheduled_at = Some(next);
                self.completed = false;
                true
            }
            None => false,
        }
    }
}

/// A circular region that triggers its associated task on entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geofence {
    /// Store-assigned id; `None` until persisted.
    pub id: Option<GeofenceId>,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Radius in metres.
    pub radius_m: f64,
}

impl Geofence {
    pub fn new(name: impl Into<String>, latitude: f64, longitude: f64, radius_m: f64) -> Self {
        Self {
            id: None,
            name: name.into(),
            latitude,
            longitude,
            radius_m,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(GeofenceId(id));
        self
    }
}
