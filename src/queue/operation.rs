//! Queued mutation types.

use crate::collaborators::{GeofenceStore, TaskStore};
use crate::error::{AttendError, Result};
use crate::task::{Geofence, GeofenceId, Task, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A data mutation that could not reach the backing store immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Mutation {
    TaskCreate(Task),
    TaskUpdate(Task),
    TaskDelete { id: TaskId },
    GeofenceCreate(Geofence),
    GeofenceUpdate(Geofence),
    GeofenceDelete { id: GeofenceId },
}

/// Execution priority, derived from the mutation kind.
///
/// Creates run before updates, updates before deletes, so one entity's
/// create/update/delete sequence never executes out of causal order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPriority {
    Low,
    Normal,
    High,
}

impl Mutation {
    /// Stable snake_case name, also the dedup key prefix.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TaskCreate(_) => "task_create",
            Self::TaskUpdate(_) => "task_update",
            Self::TaskDelete { .. } => "task_delete",
            Self::GeofenceCreate(_) => "geofence_create",
            Self::GeofenceUpdate(_) => "geofence_update",
            Self::GeofenceDelete { .. } => "geofence_delete",
        }
    }

    #[must_use]
    pub fn priority(&self) -> OperationPriority {
        match self {
            Self::TaskCreate(_) | Self::GeofenceCreate(_) => OperationPriority::High,
            Self::TaskUpdate(_) | Self::GeofenceUpdate(_) => OperationPriority::Normal,
            Self::TaskDelete { .. } | Self::GeofenceDelete { .. } => OperationPriority::Low,
        }
    }

    /// Entity id the mutation targets, when the entity has one yet.
    fn entity_id(&self) -> Option<i64> {
        match self {
            Self::TaskCreate(task) | Self::TaskUpdate(task) => task.id.map(|id| id.0),
            Self::TaskDelete { id } => Some(id.0),
            Self::GeofenceCreate(g) | Self::GeofenceUpdate(g) => g.id.map(|id| id.0),
            Self::GeofenceDelete { id } => Some(id.0),
        }
    }

    /// Key collapsing superseded intents, e.g. `task_update:7`.
    ///
    /// Entities without an id yet fall back to the operation id, so distinct
    /// creates are never merged.
    #[must_use]
    pub fn dedup_key(&self, op_id: Uuid) -> String {
        match self.entity_id() {
            Some(id) => format!("{}:{id}", self.kind()),
            None => format!("{}:{op_id}", self.kind()),
        }
    }

    /// Apply the mutation to the backing stores.
    pub async fn execute(&self, tasks: &dyn TaskStore, geofences: &dyn GeofenceStore) -> Result<()> {
        match self {
            Self::TaskCreate(task) => tasks.insert_task(task).await.map(|_| ()),
            Self::TaskUpdate(task) => {
                if task.id.is_none() {
                    return Err(AttendError::InvalidTask(format!(
                        "cannot update unsaved task '{}'",
                        task.name
                    )));
                }
                tasks.update_task(task).await
            }
            Self::TaskDelete { id } => tasks.delete_task(*id).await,
            Self::GeofenceCreate(g) | Self::GeofenceUpdate(g) => {
                geofences.save_geofence(g).await.map(|_| ())
            }
            Self::GeofenceDelete { id } => geofences.delete_geofence(*id).await,
        }
    }
}

impl fmt::Display for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.entity_id() {
            Some(id) => write!(f, "{} #{id}", self.kind()),
            None => write!(f, "{} (new)", self.kind()),
        }
    }
}

/// A durable, retryable mutation intent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    pub id: Uuid,
    pub mutation: Mutation,
    pub created_at: DateTime<Utc>,
    pub priority: OperationPriority,
    /// Monotonic arrival order within the queue.
    pub sequence: u64,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    /// Not eligible before this time.
    #[serde(default)]
    pub next_retry_at: Option<DateTime<Utc>>,
    pub dedup_key: String,
}

impl QueuedOperation {
    #[must_use]
    pub fn new(mutation: Mutation, sequence: u64, created_at: DateTime<Utc>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            priority: mutation.priority(),
            dedup_key: mutation.dedup_key(id),
            mutation,
            created_at,
            sequence,
            retry_count: 0,
            last_error: None,
            next_retry_at: None,
        }
    }

    /// Whether the operation is outside its backoff window at `now`.
    #[must_use]
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.next_retry_at.is_none_or(|at| at <= now)
    }
}
