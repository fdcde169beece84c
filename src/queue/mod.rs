//! Offline mutation queue.
//!
//! Data mutations that cannot reach the backing store are queued here,
//! deduplicated by entity, ordered by (priority desc, arrival asc) and
//! executed serially once connectivity is available. Failures back off
//! exponentially up to a retry ceiling, after which the operation is dropped
//! and reported on the event stream. The queue is persisted after every
//! mutation so it survives restarts.

pub mod backoff;
pub mod operation;

pub use backoff::RetryPolicy;
pub use operation::{Mutation, OperationPriority, QueuedOperation};

use crate::collaborators::{GeofenceStore, TaskStore};
use crate::storage::{KeyValueStore, keys};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 64;

/// Structured queue outcomes for sync-status consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum QueueEvent {
    /// An operation was added; `superseded` is set when it replaced an older
    /// one with the same dedup key.
    Enqueued {
        op_id: Uuid,
        dedup_key: String,
        superseded: bool,
    },
    /// An operation reached the backing store.
    Executed { op_id: Uuid, dedup_key: String },
    /// An attempt failed and will be retried.
    RetryScheduled {
        op_id: Uuid,
        dedup_key: String,
        retry_count: u32,
        retry_at: DateTime<Utc>,
        error: String,
    },
    /// An operation exhausted its retries and was removed.
    Dropped {
        op_id: Uuid,
        dedup_key: String,
        retry_count: u32,
        error: String,
    },
}

/// Result of one drain pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub executed: usize,
    pub rescheduled: usize,
    pub dropped: usize,
    /// Operations left waiting inside their backoff window.
    pub deferred: usize,
}

#[derive(Default)]
struct QueueState {
    ops: Vec<QueuedOperation>,
    next_sequence: u64,
}

impl QueueState {
    fn sort(&mut self) {
        self.ops
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.sequence.cmp(&b.sequence)));
    }

    fn earliest_retry(&self) -> Option<DateTime<Utc>> {
        self.ops.iter().filter_map(|op| op.next_retry_at).min()
    }
}

/// Pending drain scheduled for the end of the nearest backoff window.
struct RetryTimer {
    generation: u64,
    handle: JoinHandle<()>,
}

struct QueueInner {
    state: Mutex<QueueState>,
    drain_lock: tokio::sync::Mutex<()>,
    persist_lock: tokio::sync::Mutex<()>,
    online: AtomicBool,
    kv: Arc<dyn KeyValueStore>,
    tasks: Arc<dyn TaskStore>,
    geofences: Arc<dyn GeofenceStore>,
    policy: RetryPolicy,
    events_tx: broadcast::Sender<QueueEvent>,
    retry_timer: Mutex<Option<RetryTimer>>,
    timer_generation: AtomicU64,
}

impl QueueInner {
    fn retry_timer(&self) -> std::sync::MutexGuard<'_, Option<RetryTimer>> {
        self.retry_timer.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for QueueInner {
    fn drop(&mut self) {
        if let Some(timer) = self.retry_timer().take() {
            timer.handle.abort();
        }
    }
}

/// Ordered, deduplicated, retrying queue of mutation intents.
///
/// While online, a failed operation is retried automatically once its
/// backoff window has passed.
pub struct OfflineQueue {
    inner: Arc<QueueInner>,
}

impl OfflineQueue {
    pub fn new(
        kv: Arc<dyn KeyValueStore>,
        tasks: Arc<dyn TaskStore>,
        geofences: Arc<dyn GeofenceStore>,
        policy: RetryPolicy,
        online: bool,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                drain_lock: tokio::sync::Mutex::new(()),
                persist_lock: tokio::sync::Mutex::new(()),
                online: AtomicBool::new(online),
                kv,
                tasks,
                geofences,
                policy,
                events_tx,
                retry_timer: Mutex::new(None),
                timer_generation: AtomicU64::new(0),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.inner.events_tx.send(event);
    }

    /// Queue a mutation, replacing any older one with the same dedup key.
    ///
    /// Drains immediately when online. Returns the new operation id.
    pub async fn enqueue(&self, mutation: Mutation) -> Uuid {
        let (op_id, dedup_key, superseded) = {
            let mut state = self.state();
            let op = QueuedOperation::new(mutation, state.next_sequence, Utc::now());
            state.next_sequence += 1;

            let before = state.ops.len();
            state.ops.retain(|existing| existing.dedup_key != op.dedup_key);
            let superseded = state.ops.len() != before;

            let ids = (op.id, op.dedup_key.clone());
            state.ops.push(op);
            state.sort();
            (ids.0, ids.1, superseded)
        };

        debug!(%op_id, %dedup_key, superseded, "mutation queued");
        self.persist().await;
        self.emit(QueueEvent::Enqueued {
            op_id,
            dedup_key,
            superseded,
        });

        if self.is_online() {
            self.drain().await;
        }
        op_id
    }

    /// Attempt every eligible operation once, in queue order.
    pub async fn drain(&self) -> DrainReport {
        self.drain_at(Utc::now()).await
    }

    /// Drain treating `now` as the current time for backoff decisions.
    ///
    /// Operations left inside a backoff window arm a retry timer for the
    /// earliest one.
    pub async fn drain_at(&self, now: DateTime<Utc>) -> DrainReport {
        let _guard = self.inner.drain_lock.lock().await;
        let mut report = DrainReport::default();

        if !self.is_online() {
            debug!("offline, skipping drain");
            report.deferred = self.queue_size();
            return report;
        }

        let mut attempted: HashSet<Uuid> = HashSet::new();
        loop {
            let next = self
                .state()
                .ops
                .iter()
                .find(|op| !attempted.contains(&op.id) && op.is_eligible(now))
                .cloned();
            let Some(op) = next else {
                break;
            };
            attempted.insert(op.id);

            match op
                .mutation
                .execute(self.inner.tasks.as_ref(), self.inner.geofences.as_ref())
                .await
            {
                Ok(()) => {
                    self.state().ops.retain(|o| o.id != op.id);
                    info!(op_id = %op.id, mutation = %op.mutation, "queued mutation executed");
                    self.emit(QueueEvent::Executed {
                        op_id: op.id,
                        dedup_key: op.dedup_key.clone(),
                    });
                    report.executed += 1;
                }
                Err(e) => match self.record_failure(op.id, &e.to_string(), now) {
                    Some(event @ QueueEvent::Dropped { .. }) => {
                        report.dropped += 1;
                        self.emit(event);
                    }
                    Some(event) => {
                        report.rescheduled += 1;
                        self.emit(event);
                    }
                    None => {
                        debug!(op_id = %op.id, "failed operation was superseded while running");
                    }
                },
            }
            self.persist().await;

            if !self.is_online() {
                info!("connectivity lost, stopping drain");
                break;
            }
        }

        let earliest = self.state().earliest_retry();
        match earliest {
            Some(at) if self.is_online() => self.arm_retry(at),
            _ => self.cancel_retry(),
        }

        report.deferred = self.queue_size();
        report
    }

    /// Schedule a drain for `at`, replacing any earlier schedule.
    fn arm_retry(&self, at: DateTime<Utc>) {
        let generation = self.inner.timer_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let after = (at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);

        // Held until the new timer is stored so it cannot observe the slot first.
        let mut slot = self.inner.retry_timer();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut slot = inner.retry_timer();
                if slot.as_ref().is_some_and(|t| t.generation == generation) {
                    slot.take();
                }
            }
            debug!("backoff window elapsed, retrying queued mutations");
            OfflineQueue { inner }.drain().await;
        });
        debug!(%at, "queued mutation retry scheduled");
        if let Some(previous) = slot.replace(RetryTimer { generation, handle }) {
            previous.handle.abort();
        }
    }

    fn cancel_retry(&self) {
        if let Some(timer) = self.inner.retry_timer().take() {
            timer.handle.abort();
        }
    }

    /// Bump the retry count of `op_id`, rescheduling or dropping it.
    fn record_failure(&self, op_id: Uuid, err: &str, now: DateTime<Utc>) -> Option<QueueEvent> {
        let mut state = self.state();
        let index = state.ops.iter().position(|o| o.id == op_id)?;

        let retry_count = state.ops[index].retry_count + 1;
        if self.inner.policy.exhausted(retry_count) {
            let op = state.ops.remove(index);
            error!(
                op_id = %op.id,
                mutation = %op.mutation,
                retry_count,
                "queued mutation dropped after final failure: {err}"
            );
            return Some(QueueEvent::Dropped {
                op_id: op.id,
                dedup_key: op.dedup_key,
                retry_count,
                error: err.to_owned(),
            });
        }

        let delay = self.inner.policy.delay_for(retry_count);
        let retry_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let op = &mut state.ops[index];
        op.retry_count = retry_count;
        op.last_error = Some(err.to_owned());
        op.next_retry_at = Some(retry_at);
        warn!(
            op_id = %op.id,
            mutation = %op.mutation,
            retry_count,
            %retry_at,
            "queued mutation failed, will retry: {err}"
        );
        Some(QueueEvent::RetryScheduled {
            op_id: op.id,
            dedup_key: op.dedup_key.clone(),
            retry_count,
            retry_at,
            error: err.to_owned(),
        })
    }

    /// Record a connectivity change; an offline to online transition drains.
    pub async fn set_online(&self, online: bool) {
        let was_online = self.inner.online.swap(online, Ordering::SeqCst);
        if online && !was_online {
            info!(queued = self.queue_size(), "connectivity restored, draining queue");
            self.drain().await;
        } else if !online && was_online {
            self.cancel_retry();
            info!("connectivity lost, queueing mutations");
        }
    }

    /// Follow a connectivity signal until its sender is dropped.
    pub fn watch_connectivity(self: Arc<Self>, mut rx: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let initial = *rx.borrow_and_update();
            self.set_online(initial).await;
            while rx.changed().await.is_ok() {
                let online = *rx.borrow_and_update();
                self.set_online(online).await;
            }
            debug!("connectivity signal closed");
        })
    }

    /// Reload persisted operations, skipping entries that fail to decode.
    pub async fn load(&self) {
        let raw = match self.inner.kv.get(keys::OFFLINE_QUEUE).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return,
            Err(e) => {
                warn!("cannot load offline queue: {e}");
                return;
            }
        };
        let values: Vec<serde_json::Value> = match serde_json::from_str(&raw) {
            Ok(values) => values,
            Err(e) => {
                warn!("offline queue state is malformed, ignoring: {e}");
                return;
            }
        };

        let mut loaded = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_value::<QueuedOperation>(value) {
                Ok(op) => loaded.push(op),
                Err(e) => warn!("skipping unreadable queued operation: {e}"),
            }
        }

        let count = {
            let mut state = self.state();
            for op in loaded {
                state.next_sequence = state.next_sequence.max(op.sequence + 1);
                // Later arrivals win a duplicated key.
                if let Some(existing) = state.ops.iter().position(|o| o.dedup_key == op.dedup_key) {
                    if state.ops[existing].sequence < op.sequence {
                        state.ops[existing] = op;
                    }
                } else {
                    state.ops.push(op);
                }
            }
            state.sort();
            state.ops.len()
        };
        debug!(count, "offline queue reloaded");
    }

    /// Write the current queue. The snapshot is taken under the persist lock
    /// so concurrent writers land in snapshot order.
    async fn persist(&self) {
        let _guard = self.inner.persist_lock.lock().await;
        let ops = self.operations();
        if let Err(e) =
            crate::storage::set_json(self.inner.kv.as_ref(), keys::OFFLINE_QUEUE, &ops).await
        {
            warn!("cannot persist offline queue: {e}");
        }
    }

    /// Snapshot of queued operations in execution order.
    #[must_use]
    pub fn operations(&self) -> Vec<QueuedOperation> {
        self.state().ops.clone()
    }

    #[must_use]
    pub fn queue_size(&self) -> usize {
        self.state().ops.len()
    }

    #[must_use]
    pub fn has_pending_operations(&self) -> bool {
        self.queue_size() > 0
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::memory::{InMemoryGeofenceStore, InMemoryTaskStore};
    use crate::storage::MemoryKeyValueStore;
    use crate::error::Result;
    use crate::task::{Geofence, GeofenceId, Priority, Task, TaskId};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(50),
            max_retries: 3,
            max_exponent: 5,
        }
    }

    /// Memory store whose first write stalls, letting a later write overtake it.
    #[derive(Default)]
    struct StallingStore {
        inner: MemoryKeyValueStore,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl KeyValueStore for StallingStore {
        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: String) -> Result<()> {
            if self.writes.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<()> {
            self.inner.remove(key).await
        }
    }

    struct Fixture {
        queue: Arc<OfflineQueue>,
        kv: Arc<MemoryKeyValueStore>,
        tasks: Arc<InMemoryTaskStore>,
        geofences: Arc<InMemoryGeofenceStore>,
    }

    fn fixture(online: bool) -> Fixture {
        fixture_with(online, RetryPolicy::default())
    }

    fn fixture_with(online: bool, policy: RetryPolicy) -> Fixture {
        let kv = Arc::new(MemoryKeyValueStore::new());
        let tasks = Arc::new(InMemoryTaskStore::new());
        let geofences = Arc::new(InMemoryGeofenceStore::new());
        let queue = Arc::new(OfflineQueue::new(
            kv.clone(),
            tasks.clone(),
            geofences.clone(),
            policy,
            online,
        ));
        Fixture {
            queue,
            kv,
            tasks,
            geofences,
        }
    }

    fn update(id: i64, name: &str) -> Mutation {
        Mutation::TaskUpdate(Task::new(name, Priority::default()).with_id(id))
    }

    #[tokio::test]
    async fn duplicate_key_supersedes_older_operation() {
        let f = fixture(false);
        f.queue.enqueue(update(7, "first")).await;
        f.queue.enqueue(update(7, "second")).await;

        assert_eq!(f.queue.queue_size(), 1);
        let ops = f.queue.operations();
        assert_eq!(ops[0].dedup_key, "task_update:7");
        match &ops[0].mutation {
            Mutation::TaskUpdate(task) => assert_eq!(task.name, "second"),
            other => panic!("unexpected mutation {other:?}"),
        }
    }

    #[tokio::test]
    async fn queue_orders_by_priority_then_arrival() {
        let f = fixture(false);
        f.queue.enqueue(Mutation::TaskDelete { id: TaskId(1) }).await;
        f.queue
            .enqueue(Mutation::TaskCreate(Task::new("new", Priority::default())))
            .await;
        f.queue.enqueue(Mutation::TaskDelete { id: TaskId(2) }).await;

        let kinds: Vec<String> = f
            .queue
            .operations()
            .iter()
            .map(|op| op.mutation.to_string())
            .collect();
        assert_eq!(kinds, vec!["task_create (new)", "task_delete #1", "task_delete #2"]);
    }

    #[tokio::test]
    async fn enqueue_while_online_executes_immediately() {
        let f = fixture(true);
        f.queue
            .enqueue(Mutation::GeofenceCreate(Geofence::new("home", 1.0, 2.0, 100.0)))
            .await;
        assert!(!f.queue.has_pending_operations());
        assert_eq!(f.geofences.len(), 1);
    }

    #[tokio::test]
    async fn offline_drain_is_skipped() {
        let f = fixture(false);
        f.queue.enqueue(Mutation::TaskDelete { id: TaskId(1) }).await;
        let report = f.queue.drain().await;
        assert_eq!(report.executed, 0);
        assert_eq!(report.deferred, 1);
        assert_eq!(f.tasks.delete_calls(), 0);
    }

    #[tokio::test]
    async fn backoff_schedule_then_drop() {
        let f = fixture(false);
        f.tasks.fail_next(usize::MAX);
        let mut events = f.queue.subscribe_events();
        let op_id = f.queue.enqueue(Mutation::TaskDelete { id: TaskId(9) }).await;
        f.queue.set_online(true).await;

        // set_online drained once at wall-clock now.
        let first = f.queue.operations()[0].clone();
        assert_eq!(first.retry_count, 1);
        let t1 = first.next_retry_at.unwrap();

        // Still inside the 4s window: nothing attempted.
        let report = f.queue.drain_at(t1 - chrono::Duration::milliseconds(1)).await;
        assert_eq!(report, DrainReport { deferred: 1, ..DrainReport::default() });

        let report = f.queue.drain_at(t1).await;
        assert_eq!(report.rescheduled, 1);
        let second = f.queue.operations()[0].clone();
        assert_eq!(second.retry_count, 2);
        assert_eq!(second.next_retry_at.unwrap() - t1, chrono::Duration::seconds(8));

        let report = f.queue.drain_at(second.next_retry_at.unwrap()).await;
        assert_eq!(report.dropped, 1);
        assert_eq!(f.queue.queue_size(), 0);

        let report = f.queue.drain_at(t1 + chrono::Duration::hours(1)).await;
        assert_eq!(report, DrainReport::default());
        assert_eq!(f.tasks.delete_calls(), 3);

        let mut saw_drop = false;
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::Dropped {
                op_id: dropped,
                retry_count,
                ..
            } = event
            {
                assert_eq!(dropped, op_id);
                assert_eq!(retry_count, 3);
                saw_drop = true;
            }
        }
        assert!(saw_drop);
    }

    #[tokio::test]
    async fn first_retry_waits_four_seconds() {
        let f = fixture(true);
        f.tasks.fail_next(1);
        let now = Utc::now();
        f.queue.set_online(false).await;
        f.queue.enqueue(Mutation::TaskDelete { id: TaskId(3) }).await;
        f.queue.set_online(true).await;

        let op = f.queue.operations()[0].clone();
        let wait = op.next_retry_at.unwrap() - now;
        assert!(wait >= chrono::Duration::seconds(4));
        assert!(wait < chrono::Duration::seconds(6));
        assert_eq!(op.last_error.as_deref().map(|e| e.contains("injected")), Some(true));

        let report = f.queue.drain_at(op.next_retry_at.unwrap()).await;
        assert_eq!(report.executed, 1);
        assert!(!f.queue.has_pending_operations());
    }

    #[tokio::test]
    async fn failure_does_not_block_later_operations() {
        let f = fixture(false);
        f.tasks.fail_next(1);
        f.queue.enqueue(Mutation::TaskDelete { id: TaskId(1) }).await;
        f.queue
            .enqueue(Mutation::GeofenceDelete { id: GeofenceId(4) })
            .await;
        f.queue.set_online(true).await;

        assert_eq!(f.queue.queue_size(), 1);
        assert_eq!(f.queue.operations()[0].dedup_key, "task_delete:1");
        assert_eq!(f.geofences.delete_calls(), 1);
    }

    #[tokio::test]
    async fn connectivity_watcher_drains_on_restore() {
        let f = fixture(false);
        f.queue.enqueue(Mutation::TaskDelete { id: TaskId(1) }).await;

        let (tx, rx) = watch::channel(false);
        let handle = Arc::clone(&f.queue).watch_connectivity(rx);
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.queue.has_pending_operations() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("queue drained after connectivity restored");
        assert!(f.queue.is_online());
        handle.abort();
    }

    #[tokio::test]
    async fn persisted_queue_reloads_and_skips_unknown_kinds() {
        let f = fixture(false);
        f.queue.enqueue(update(7, "keep")).await;
        f.queue.enqueue(Mutation::TaskDelete { id: TaskId(8) }).await;

        // Splice an unknown kind into the stored state.
        let raw = f.kv.get(keys::OFFLINE_QUEUE).await.unwrap().unwrap();
        let mut values: Vec<serde_json::Value> = serde_json::from_str(&raw).unwrap();
        let mut bogus = values[0].clone();
        bogus["mutation"] = serde_json::json!({"type": "calendar_sync", "payload": {}});
        bogus["dedup_key"] = serde_json::json!("calendar_sync:1");
        values.push(bogus);
        f.kv
            .set(keys::OFFLINE_QUEUE, serde_json::to_string(&values).unwrap())
            .await
            .unwrap();

        let restored = OfflineQueue::new(
            f.kv.clone(),
            f.tasks.clone(),
            f.geofences.clone(),
            RetryPolicy::default(),
            false,
        );
        restored.load().await;

        assert_eq!(restored.operations(), f.queue.operations());

        // New arrivals continue the sequence.
        restored.enqueue(Mutation::TaskDelete { id: TaskId(9) }).await;
        let last = restored.operations().last().cloned().unwrap();
        assert_eq!(last.dedup_key, "task_delete:9");
    }

    #[tokio::test]
    async fn failed_operation_retries_when_backoff_elapses() {
        let f = fixture_with(true, fast_policy());
        f.tasks.fail_next(1);
        f.queue.enqueue(Mutation::TaskDelete { id: TaskId(1) }).await;
        assert_eq!(f.queue.queue_size(), 1);
        assert_eq!(f.tasks.delete_calls(), 1);

        tokio::time::timeout(Duration::from_secs(2), async {
            while f.queue.has_pending_operations() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("operation retried after its backoff window");
        assert_eq!(f.tasks.delete_calls(), 2);
    }

    #[tokio::test]
    async fn retries_run_until_the_ceiling_without_manual_drain() {
        let f = fixture_with(true, fast_policy());
        f.tasks.fail_next(usize::MAX);
        let mut events = f.queue.subscribe_events();
        f.queue.enqueue(Mutation::TaskDelete { id: TaskId(1) }).await;

        // 100ms then 200ms windows.
        tokio::time::timeout(Duration::from_secs(3), async {
            while f.queue.has_pending_operations() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("operation dropped after the final retry");
        assert_eq!(f.tasks.delete_calls(), 3);

        let mut dropped = false;
        while let Ok(event) = events.try_recv() {
            dropped |= matches!(event, QueueEvent::Dropped { retry_count: 3, .. });
        }
        assert!(dropped);
    }

    #[tokio::test]
    async fn going_offline_cancels_scheduled_retry() {
        let f = fixture_with(true, fast_policy());
        f.tasks.fail_next(1);
        f.queue.enqueue(Mutation::TaskDelete { id: TaskId(1) }).await;
        f.queue.set_online(false).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(f.tasks.delete_calls(), 1);
        assert_eq!(f.queue.queue_size(), 1);

        f.queue.set_online(true).await;
        assert!(!f.queue.has_pending_operations());
    }

    #[tokio::test]
    async fn concurrent_writes_persist_latest_queue() {
        let kv = Arc::new(StallingStore::default());
        let queue = OfflineQueue::new(
            kv.clone(),
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(InMemoryGeofenceStore::new()),
            RetryPolicy::default(),
            false,
        );

        tokio::join!(
            queue.enqueue(Mutation::TaskDelete { id: TaskId(1) }),
            queue.enqueue(Mutation::TaskDelete { id: TaskId(2) }),
        );

        let raw = kv.get(keys::OFFLINE_QUEUE).await.unwrap().unwrap();
        let stored: Vec<QueuedOperation> = serde_json::from_str(&raw).unwrap();
        assert_eq!(stored, queue.operations());
        assert_eq!(stored.len(), 2);
    }
}
