//! Contracts for the external collaborators the core consumes.
//!
//! Implementations live outside the crate (platform stores, notification
//! presenters). [`crate::memory`] provides in-process versions for tests and
//! the stdio host.

use crate::error::Result;
use crate::task::{Geofence, GeofenceId, Task, TaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Persistent task store. Eventually consistent, single writer.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn get_task_by_id(&self, id: TaskId) -> Result<Option<Task>>;

    async fn get_tasks(&self) -> Result<Vec<Task>>;

    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Insert a task and return the id the store assigned.
    async fn insert_task(&self, task: &Task) -> Result<TaskId>;

    async fn delete_task(&self, id: TaskId) -> Result<()>;

    /// Append a completed run to task history.
    async fn record_completion(&self, task: &Task, elapsed: Duration) -> Result<()>;
}

/// Persistent geofence store. Saving a geofence (re-)registers it with the
/// platform geofencing service.
#[async_trait]
pub trait GeofenceStore: Send + Sync {
    async fn get_geofence_by_id(&self, id: GeofenceId) -> Result<Option<Geofence>>;

    /// Insert or update; returns the stored id.
    async fn save_geofence(&self, geofence: &Geofence) -> Result<GeofenceId>;

    async fn delete_geofence(&self, id: GeofenceId) -> Result<()>;
}

/// An action button on a prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptAction {
    /// Machine-readable action identifier.
    pub id: String,
    /// Button label.
    pub label: String,
}

/// A notification or in-app prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRequest {
    /// Presenter-level id, used to cancel the prompt.
    pub id: i32,
    pub title: String,
    pub body: String,
    pub actions: Vec<PromptAction>,
    /// Opaque payload returned with the user's decision.
    pub payload: String,
}

/// Surfaces prompts to the user, including while the app is backgrounded.
#[async_trait]
pub trait Presenter: Send + Sync {
    async fn show(&self, request: PromptRequest) -> Result<()>;

    async fn cancel(&self, id: i32) -> Result<()>;
}

/// Collaborator handles the [`crate::Arbiter`] is built from.
#[derive(Clone)]
pub struct Collaborators {
    pub tasks: std::sync::Arc<dyn TaskStore>,
    pub geofences: std::sync::Arc<dyn GeofenceStore>,
    pub presenter: std::sync::Arc<dyn Presenter>,
    pub kv: std::sync::Arc<dyn crate::storage::KeyValueStore>,
}
