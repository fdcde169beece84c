//! Task activation slot.
//!
//! Holds at most one active task and its elapsed-time timer. While running,
//! a tick task recomputes elapsed time every tick interval and publishes it
//! on a watch channel for UI consumers.
//!
//! ```text
//! Idle -> Running -> {Paused, Idle}
//! Paused -> {Running, Idle}
//! ```
//!
//! `Paused { interrupted: true }` marks a task frozen by a winning switch
//! request rather than by the user.

use crate::task::Task;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

/// Observable slot state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SlotState {
    Idle,
    Running,
    Paused {
        /// `true` when paused by arbitration, `false` for a manual pause.
        interrupted: bool,
    },
}

#[derive(Default)]
struct SlotInner {
    active: Option<Task>,
    started_at: Option<DateTime<Utc>>,
    /// Elapsed time accumulated before the current running span.
    accumulated: Duration,
    /// Start of the current running span; `None` while paused or idle.
    running_since: Option<Instant>,
    /// Last value computed by the tick.
    elapsed: Duration,
    interrupted: bool,
    ticker: Option<JoinHandle<()>>,
}

impl SlotInner {
    fn current_elapsed(&self) -> Duration {
        match self.running_since {
            Some(since) => self.accumulated + since.elapsed(),
            None => self.accumulated,
        }
    }

    fn state(&self) -> SlotState {
        match (&self.active, self.running_since) {
            (None, _) => SlotState::Idle,
            (Some(_), Some(_)) => SlotState::Running,
            (Some(_), None) => SlotState::Paused {
                interrupted: self.interrupted,
            },
        }
    }

    fn stop_ticker(&mut self) {
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }

    /// Freeze elapsed time. Returns `false` if nothing is running.
    fn freeze(&mut self) -> bool {
        let Some(since) = self.running_since.take() else {
            return false;
        };
        self.accumulated += since.elapsed();
        self.elapsed = self.accumulated;
        self.stop_ticker();
        true
    }
}

/// Single-task activation slot.
pub struct ActivationSlot {
    inner: Arc<Mutex<SlotInner>>,
    tick_interval: Duration,
    elapsed_tx: Arc<watch::Sender<Duration>>,
}

impl ActivationSlot {
    #[must_use]
    pub fn new(tick_interval: Duration) -> Self {
        let (elapsed_tx, _) = watch::channel(Duration::ZERO);
        Self {
            inner: Arc::new(Mutex::new(SlotInner::default())),
            tick_interval,
            elapsed_tx: Arc::new(elapsed_tx),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start `task` with zero elapsed time.
    ///
    /// Returns `false` if a task is already active; callers must go through
    /// arbitration instead.
    pub fn start(&self, task: Task) -> bool {
        self.restore(task, Duration::ZERO)
    }

    /// Start `task` continuing from a previously captured elapsed time.
    pub fn restore(&self, task: Task, elapsed: Duration) -> bool {
        let mut inner = self.lock();
        if inner.active.is_some() {
            debug!(
                task = %task.name,
                "slot occupied, refusing start"
            );
            return false;
        }
        debug!(task = %task.name, ?elapsed, "slot started");
        inner.active = Some(task);
        inner.started_at = Some(Utc::now());
        inner.accumulated = elapsed;
        inner.elapsed = elapsed;
        inner.interrupted = false;
        inner.running_since = Some(Instant::now());
        self.elapsed_tx.send_replace(elapsed);
        self.spawn_ticker(&mut inner);
        true
    }

    /// Freeze elapsed time. No-op when idle or already paused.
    pub fn pause(&self) -> bool {
        let mut inner = self.lock();
        let changed = inner.freeze();
        if changed {
            self.elapsed_tx.send_replace(inner.elapsed);
        }
        changed
    }

    /// Pause on behalf of a winning switch request.
    ///
    /// Returns a snapshot of the task and its elapsed time for the paused
    /// entry, or `None` when no task is running.
    pub fn interrupt(&self) -> Option<(Task, Duration)> {
        let mut inner = self.lock();
        if !inner.freeze() {
            return None;
        }
        inner.interrupted = true;
        self.elapsed_tx.send_replace(inner.elapsed);
        let task = inner.active.clone()?;
        Some((task, inner.accumulated))
    }

    /// Continue a paused task from its frozen elapsed time.
    pub fn resume(&self) -> bool {
        let mut inner = self.lock();
        if inner.active.is_none() || inner.running_since.is_some() {
            return false;
        }
        inner.running_since = Some(Instant::now());
        inner.interrupted = false;
        self.spawn_ticker(&mut inner);
        true
    }

    /// Clear the slot, returning the task and its total elapsed time.
    pub fn stop(&self) -> Option<(Task, Duration)> {
        let mut inner = self.lock();
        let elapsed = inner.current_elapsed();
        inner.stop_ticker();
        let task = inner.active.take()?;
        *inner = SlotInner::default();
        self.elapsed_tx.send_replace(Duration::ZERO);
        debug!(task = %task.name, ?elapsed, "slot stopped");
        Some((task, elapsed))
    }

    #[must_use]
    pub fn state(&self) -> SlotState {
        self.lock().state()
    }

    #[must_use]
    pub fn active_task(&self) -> Option<Task> {
        self.lock().active.clone()
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.lock().active.is_some()
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        matches!(self.state(), SlotState::Paused { .. })
    }

    /// Wall-clock time the current task was started.
    #[must_use]
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.lock().started_at
    }

    /// Exact elapsed time (not rounded to the last tick).
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.lock().current_elapsed()
    }

    /// Elapsed time as last published by the tick.
    pub fn subscribe_elapsed(&self) -> watch::Receiver<Duration> {
        self.elapsed_tx.subscribe()
    }

    fn spawn_ticker(&self, inner: &mut SlotInner) {
        inner.stop_ticker();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!("no tokio runtime, elapsed tick disabled");
            return;
        };
        let shared = Arc::clone(&self.inner);
        let tx = Arc::clone(&self.elapsed_tx);
        let period = self.tick_interval;
        inner.ticker = Some(runtime.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let elapsed = {
                    let mut guard = shared.lock().unwrap_or_else(|e| e.into_inner());
                    if guard.running_since.is_none() {
                        break;
                    }
                    guard.elapsed = guard.current_elapsed();
                    guard.elapsed
                };
                tx.send_replace(elapsed);
            }
        }));
    }
}

impl Drop for ActivationSlot {
    fn drop(&mut self) {
        self.lock().stop_ticker();
    }
}
