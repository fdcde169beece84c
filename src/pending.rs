//! Pending (snooze) queue.
//!
//! Tasks that lost arbitration or were deliberately deferred wait here until
//! their snooze deadline. Each entry owns a timer that reports the task id on
//! the expiry channel; the arbiter then removes the entry and re-arms the
//! originating trigger. Expiry depends on the process staying alive, so the
//! map is persisted after every mutation and reloaded on start.

use crate::storage::{self, KeyValueStore, keys};
use crate::task::{Task, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Persisted form of one pending entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub task_id: TaskId,
    pub snoozed_until: DateTime<Utc>,
}

/// Deferred tasks keyed by id.
pub struct PendingQueue {
    entries: Mutex<HashMap<TaskId, DateTime<Utc>>>,
    timers: Mutex<HashMap<TaskId, JoinHandle<()>>>,
    persist_lock: tokio::sync::Mutex<()>,
    kv: Arc<dyn KeyValueStore>,
    default_snooze: Duration,
    expiry_tx: mpsc::UnboundedSender<TaskId>,
}

impl PendingQueue {
    /// Create an empty queue. Expired task ids are sent on `expiry_tx`.
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        default_snooze: Duration,
        expiry_tx: mpsc::UnboundedSender<TaskId>,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            persist_lock: tokio::sync::Mutex::new(()),
            kv,
            default_snooze,
            expiry_tx,
        }
    }

    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, DateTime<Utc>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, JoinHandle<()>>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn default_snooze(&self) -> Duration {
        self.default_snooze
    }

    /// Defer `task` until now + snooze.
    ///
    /// A stored per-task preference overrides `duration`; with neither the
    /// service default applies. Returns the deadline, or `None` for a task
    /// without an id.
    pub async fn add_to_pending(
        &self,
        task: &Task,
        duration: Option<Duration>,
    ) -> Option<DateTime<Utc>> {
        let Some(id) = task.id else {
            warn!(task = %task.name, "cannot snooze a task without an id");
            return None;
        };

        let snooze = match self.snooze_preference(id).await {
            Some(pref) => pref,
            None => duration.unwrap_or(self.default_snooze),
        };
        let now = Utc::now();
        let until = chrono::Duration::from_std(snooze)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        self.entries().insert(id, until);
        self.arm_timer(id, snooze);
        self.persist().await;

        info!(task_id = %id, task = %task.name, %until, "task snoozed");
        Some(until)
    }

    /// Whether `id` is waiting in the queue.
    #[must_use]
    pub fn is_pending(&self, id: TaskId) -> bool {
        self.entries().contains_key(&id)
    }

    /// Time left until `id` is re-proposed; `None` when not pending.
    #[must_use]
    pub fn remaining_time(&self, id: TaskId) -> Option<Duration> {
        let until = *self.entries().get(&id)?;
        Some((until - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    #[must_use]
    pub fn snoozed_until(&self, id: TaskId) -> Option<DateTime<Utc>> {
        self.entries().get(&id).copied()
    }

    /// Snapshot of all entries, soonest deadline first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<PendingRecord> {
        let mut records: Vec<PendingRecord> = self
            .entries()
            .iter()
            .map(|(task_id, snoozed_until)| PendingRecord {
                task_id: *task_id,
                snoozed_until: *snoozed_until,
            })
            .collect();
        records.sort_by_key(|r| (r.snoozed_until, r.task_id));
        records
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop `id` (cancelled, completed or promoted into the slot).
    pub async fn remove(&self, id: TaskId) -> bool {
        if let Some(handle) = self.timers().remove(&id) {
            handle.abort();
        }
        let removed = self.entries().remove(&id).is_some();
        if removed {
            self.persist().await;
        }
        removed
    }

    /// Remove `id` if its deadline has passed.
    ///
    /// Called when a timer fires. An entry that is not due yet (the timer
    /// clock ran ahead of the wall clock) gets its timer re-armed.
    pub async fn expire(&self, id: TaskId) -> bool {
        let Some(until) = self.entries().get(&id).copied() else {
            return false;
        };
        let now = Utc::now();
        if until > now {
            let remaining = (until - now).to_std().unwrap_or(Duration::ZERO);
            self.arm_timer(id, remaining);
            return false;
        }
        self.timers().remove(&id);
        self.entries().remove(&id);
        self.persist().await;
        debug!(task_id = %id, "snooze expired");
        true
    }

    /// Reload persisted entries, dropping expired ones and re-arming timers.
    pub async fn load(&self) {
        let records: Vec<PendingRecord> =
            match storage::get_json(self.kv.as_ref(), keys::PENDING_TASKS).await {
                Ok(Some(records)) => records,
                Ok(None) => return,
                Err(e) => {
                    warn!("cannot load pending snoozes: {e}");
                    return;
                }
            };

        let now = Utc::now();
        let total = records.len();
        let mut kept = 0;
        for record in records {
            if record.snoozed_until <= now {
                continue;
            }
            let remaining = (record.snoozed_until - now)
                .to_std()
                .unwrap_or(Duration::ZERO);
            self.entries().insert(record.task_id, record.snoozed_until);
            self.arm_timer(record.task_id, remaining);
            kept += 1;
        }

        if kept != total {
            self.persist().await;
        }
        debug!(kept, dropped = total - kept, "pending snoozes reloaded");
    }

    /// Store a per-task snooze preference in minutes.
    pub async fn set_snooze_preference(&self, id: TaskId, minutes: u32) {
        if let Err(e) = self
            .kv
            .set(&keys::snooze_minutes(id), minutes.to_string())
            .await
        {
            warn!(task_id = %id, "cannot store snooze preference: {e}");
        }
    }

    async fn snooze_preference(&self, id: TaskId) -> Option<Duration> {
        match storage::get_parsed::<u64>(self.kv.as_ref(), &keys::snooze_minutes(id)).await {
            Ok(Some(minutes)) if minutes > 0 => Some(Duration::from_secs(minutes * 60)),
            Ok(_) => None,
            Err(e) => {
                warn!(task_id = %id, "cannot read snooze preference: {e}");
                None
            }
        }
    }

    fn arm_timer(&self, id: TaskId, after: Duration) {
        let tx = self.expiry_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(id);
        });
        if let Some(previous) = self.timers().insert(id, handle) {
            previous.abort();
        }
    }

    /// Snapshot under the persist lock so concurrent writers land in order.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let records = self.snapshot();
        if let Err(e) = storage::set_json(self.kv.as_ref(), keys::PENDING_TASKS, &records).await {
            warn!("cannot persist pending snoozes: {e}");
        }
    }
}

impl Drop for PendingQueue {
    fn drop(&mut self) {
        for (_, handle) in self.timers().drain() {
            handle.abort();
        }
    }
}
