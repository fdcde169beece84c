//! In-process collaborator implementations.
//!
//! Used by the stdio host and by tests. The task and geofence stores can be
//! told to fail a number of upcoming calls to exercise retry paths.

use crate::collaborators::{GeofenceStore, Presenter, PromptRequest, TaskStore};
use crate::error::{AttendError, Result};
use crate::task::{Geofence, GeofenceId, Task, TaskId};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

/// Counts down injected failures.
#[derive(Debug, Default)]
struct FailureBudget(AtomicUsize);

impl FailureBudget {
    fn set(&self, n: usize) {
        self.0.store(n, Ordering::SeqCst);
    }

    fn check(&self, what: &str) -> Result<()> {
        let took = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match took {
            Ok(_) => Err(AttendError::Store(format!("injected failure: {what}"))),
            Err(_) => Ok(()),
        }
    }
}

/// A completed run recorded through [`TaskStore::record_completion`].
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRecord {
    pub task: Task,
    pub elapsed: Duration,
}

/// In-memory [`TaskStore`].
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: Mutex<BTreeMap<TaskId, Task>>,
    history: Mutex<Vec<CompletionRecord>>,
    next_id: AtomicUsize,
    failures: FailureBudget,
    delete_calls: AtomicUsize,
}

impl InMemoryTaskStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            ..Self::default()
        }
    }

    /// Seed a store with tasks that already have ids.
    #[must_use]
    pub fn with_tasks(tasks: impl IntoIterator<Item = Task>) -> Self {
        let store = Self::new();
        let mut max_id = 0;
        {
            let mut map = store.tasks.lock().unwrap_or_else(|e| e.into_inner());
            for task in tasks {
                if let Some(id) = task.id {
                    max_id = max_id.max(id.0);
                    map.insert(id, task);
                }
            }
        }
        store
            .next_id
            .store(usize::try_from(max_id).unwrap_or(0) + 1, Ordering::SeqCst);
        store
    }

    /// Fail the next `n` calls.
    pub fn fail_next(&self, n: usize) {
        self.failures.set(n);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    #[must_use]
    pub fn completions(&self) -> Vec<CompletionRecord> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn get_task_by_id(&self, id: TaskId) -> Result<Option<Task>> {
        self.failures.check("get_task_by_id")?;
        Ok(self.get(id))
    }

    async fn get_tasks(&self) -> Result<Vec<Task>> {
        self.failures.check("get_tasks")?;
        Ok(self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect())
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        self.failures.check("update_task")?;
        let id = task.require_id()?;
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        match tasks.get_mut(&id) {
            Some(existing) => {
                *existing = task.clone();
                Ok(())
            }
            None => Err(AttendError::Store(format!("task {id} not found"))),
        }
    }

    async fn insert_task(&self, task: &Task) -> Result<TaskId> {
        self.failures.check("insert_task")?;
        let id = match task.id {
            Some(id) => id,
            None => TaskId(i64::try_from(self.next_id.fetch_add(1, Ordering::SeqCst)).unwrap_or(i64::MAX)),
        };
        let mut stored = task.clone();
        stored.id = Some(id);
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, stored);
        Ok(id)
    }

    async fn delete_task(&self, id: TaskId) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.check("delete_task")?;
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        Ok(())
    }

    async fn record_completion(&self, task: &Task, elapsed: Duration) -> Result<()> {
        self.failures.check("record_completion")?;
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(CompletionRecord {
                task: task.clone(),
                elapsed,
            });
        Ok(())
    }
}

/// In-memory [`GeofenceStore`].
#[derive(Debug, Default)]
pub struct InMemoryGeofenceStore {
    geofences: Mutex<BTreeMap<GeofenceId, Geofence>>,
    next_id: AtomicUsize,
    failures: FailureBudget,
    save_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl InMemoryGeofenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: AtomicUsize::new(1),
            ..Self::default()
        }
    }

    pub fn fail_next(&self, n: usize) {
        self.failures.set(n);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.geofences.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of save (register) calls, including failed ones.
    #[must_use]
    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GeofenceStore for InMemoryGeofenceStore {
    async fn get_geofence_by_id(&self, id: GeofenceId) -> Result<Option<Geofence>> {
        self.failures.check("get_geofence_by_id")?;
        Ok(self
            .geofences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned())
    }

    async fn save_geofence(&self, geofence: &Geofence) -> Result<GeofenceId> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.check("save_geofence")?;
        let id = match geofence.id {
            Some(id) => id,
            None => GeofenceId(
                i64::try_from(self.next_id.fetch_add(1, Ordering::SeqCst)).unwrap_or(i64::MAX),
            ),
        };
        let mut stored = geofence.clone();
        stored.id = Some(id);
        self.geofences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, stored);
        Ok(id)
    }

    async fn delete_geofence(&self, id: GeofenceId) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.failures.check("delete_geofence")?;
        self.geofences
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id);
        Ok(())
    }
}

/// Presenter notification, as observed by [`ChannelPresenter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenterCall {
    Show(PromptRequest),
    Cancel(i32),
}

/// [`Presenter`] that forwards every call to a channel.
///
/// The receiving side plays the user: it can read the payload from a
/// `Show` and feed a decision back to the arbiter.
pub struct ChannelPresenter {
    tx: mpsc::UnboundedSender<PresenterCall>,
}

impl ChannelPresenter {
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PresenterCall>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl Presenter for ChannelPresenter {
    async fn show(&self, request: PromptRequest) -> Result<()> {
        // A dropped receiver only means nobody is watching.
        let _ = self.tx.send(PresenterCall::Show(request));
        Ok(())
    }

    async fn cancel(&self, id: i32) -> Result<()> {
        let _ = self.tx.send(PresenterCall::Cancel(id));
        Ok(())
    }
}
