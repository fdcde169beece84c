//! Composition root for task activation.
//!
//! [`Arbiter`] owns the activation slot, the pending queue, the switch
//! registry and the paused entries, and is the only place they are mutated
//! together. Proposals are arbitrated one at a time in arrival order.

use crate::arbitration::{
    ACTION_SNOOZE, ACTION_START_NOW, PromptPayload, SwitchDecision, SwitchRegistry, SwitchRequest,
    SwitchResolution,
};
use crate::collaborators::{
    Collaborators, GeofenceStore, Presenter, PromptAction, PromptRequest, TaskStore,
};
use crate::config::AttendConfig;
use crate::error::Result;
use crate::handoff::{self, HandoffState};
use crate::pending::{PendingQueue, PendingRecord};
use crate::priority;
use crate::slot::{ActivationSlot, SlotState};
use crate::storage::KeyValueStore;
use crate::task::{Task, TaskId};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// A task frozen by arbitration, with the elapsed time it had reached.
#[derive(Debug, Clone, PartialEq)]
pub struct PausedEntry {
    pub task: Task,
    pub elapsed: Duration,
    /// Still waiting on its switch request; a snooze resumes it.
    pub awaiting_decision: bool,
}

/// What happened to a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProposalOutcome {
    /// The slot was free; the task is now running.
    Started,
    /// The proposal is the task already in the slot.
    AlreadyActive,
    /// The active task won or tied; the proposal was deferred.
    Deferred {
        snoozed_until: Option<DateTime<Utc>>,
    },
    /// The user accepted the switch; the interrupted task stays paused.
    Switched {
        request_id: Uuid,
        interrupted: TaskId,
    },
    /// The user snoozed the proposal, or nobody answered in time.
    Snoozed {
        request_id: Uuid,
        timed_out: bool,
        snoozed_until: Option<DateTime<Utc>>,
    },
}

/// Result of stopping the active task.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedRun {
    /// The task as written back to the store.
    pub task: Task,
    pub elapsed: Duration,
    /// `true` when a recurring task moved to its next occurrence instead of
    /// being marked complete.
    pub rescheduled: bool,
}

/// Snapshot for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ArbiterStatus {
    pub slot: SlotState,
    pub active: Option<Task>,
    pub elapsed_secs: f64,
    pub pending: Vec<PendingRecord>,
    pub paused: Vec<TaskId>,
    pub open_switch_requests: usize,
}

/// What [`Arbiter::reconcile`] recovered.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Task put back into the slot.
    pub restored: Option<TaskId>,
    /// Proposal of a switch request left open by the restart, now pending.
    pub snoozed: Option<TaskId>,
    /// Background proposal that was picked up, with its outcome.
    pub proposed: Option<(TaskId, ProposalOutcome)>,
}

/// Single-task activation arbiter.
pub struct Arbiter {
    slot: ActivationSlot,
    pending: PendingQueue,
    switches: SwitchRegistry,
    paused: Mutex<HashMap<TaskId, PausedEntry>>,
    tasks: Arc<dyn TaskStore>,
    geofences: Arc<dyn GeofenceStore>,
    presenter: Arc<dyn Presenter>,
    kv: Arc<dyn KeyValueStore>,
    decision_timeout: Duration,
    proposals: tokio::sync::Mutex<()>,
    tasks_changed: watch::Sender<u64>,
    expiry_rx: Mutex<Option<mpsc::UnboundedReceiver<TaskId>>>,
}

impl Arbiter {
    #[must_use]
    pub fn new(config: &AttendConfig, deps: Collaborators) -> Self {
        let (expiry_tx, expiry_rx) = mpsc::unbounded_channel();
        let (tasks_changed, _) = watch::channel(0);
        Self {
            slot: ActivationSlot::new(config.slot.tick_interval()),
            pending: PendingQueue::new(
                Arc::clone(&deps.kv),
                config.arbitration.default_snooze(),
                expiry_tx,
            ),
            switches: SwitchRegistry::new(),
            paused: Mutex::new(HashMap::new()),
            tasks: deps.tasks,
            geofences: deps.geofences,
            presenter: deps.presenter,
            kv: deps.kv,
            decision_timeout: config.arbitration.decision_timeout(),
            proposals: tokio::sync::Mutex::new(()),
            tasks_changed,
            expiry_rx: Mutex::new(Some(expiry_rx)),
        }
    }

    /// Override the switch decision timeout.
    #[must_use]
    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = timeout;
        self
    }

    fn paused(&self) -> std::sync::MutexGuard<'_, HashMap<TaskId, PausedEntry>> {
        self.paused.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn notify(&self) {
        self.tasks_changed.send_modify(|n| *n = n.wrapping_add(1));
    }

    /// Start the snooze expiry watcher.
    ///
    /// Expired entries are removed and their geofence trigger re-armed.
    /// Returns `None` if the watcher is already running.
    pub fn spawn_expiry_watcher(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let mut rx = self
            .expiry_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        let weak: Weak<Self> = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            while let Some(task_id) = rx.recv().await {
                let Some(arbiter) = weak.upgrade() else {
                    break;
                };
                arbiter.handle_expiry(task_id).await;
            }
            debug!("snooze expiry watcher stopped");
        }))
    }

    async fn handle_expiry(&self, task_id: TaskId) {
        if !self.pending.expire(task_id).await {
            return;
        }
        info!(%task_id, "snooze elapsed, re-arming trigger");
        self.rearm(task_id).await;
        self.notify();
    }

    /// Re-register the geofence linked to `task_id`. Best effort.
    async fn rearm(&self, task_id: TaskId) {
        let task = match self.tasks.get_task_by_id(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                debug!(%task_id, "expired task no longer exists");
                return;
            }
            Err(e) => {
                warn!(%task_id, "cannot load task for re-arm: {e}");
                return;
            }
        };
        let Some(geofence_id) = task.geofence_id else {
            return;
        };
        let geofence = match self.geofences.get_geofence_by_id(geofence_id).await {
            Ok(Some(geofence)) => geofence,
            Ok(None) => {
                warn!(%task_id, %geofence_id, "linked geofence is gone, task stays manual");
                return;
            }
            Err(e) => {
                warn!(%task_id, %geofence_id, "cannot load geofence for re-arm: {e}");
                return;
            }
        };
        match self.geofences.save_geofence(&geofence).await {
            Ok(_) => debug!(%task_id, %geofence_id, "geofence re-armed"),
            Err(e) => warn!(%task_id, %geofence_id, "geofence re-arm failed: {e}"),
        }
    }

    /// Ask for `task` to take the activation slot.
    ///
    /// Resolves once the proposal has been started, deferred, or decided by
    /// the user (or the decision timeout).
    ///
    /// # Errors
    ///
    /// Returns an error for a task without an id.
    pub async fn propose(&self, task: Task) -> Result<ProposalOutcome> {
        let task_id = task.require_id()?;
        let _turn = self.proposals.lock().await;

        let Some(active) = self.slot.active_task() else {
            self.activate(task).await;
            return Ok(ProposalOutcome::Started);
        };
        if active.id == Some(task_id) {
            return Ok(ProposalOutcome::AlreadyActive);
        }

        if !priority::preempts(&task, &active, Utc::now()) {
            debug!(%task_id, active = %active.name, "proposal does not outrank active task");
            let snoozed_until = self.pending.add_to_pending(&task, None).await;
            self.notify();
            return Ok(ProposalOutcome::Deferred { snoozed_until });
        }

        self.arbitrate(task, task_id).await
    }

    async fn arbitrate(&self, proposal: Task, proposal_id: TaskId) -> Result<ProposalOutcome> {
        // A manually paused task is captured as-is.
        let (interrupted, elapsed) = match self.slot.interrupt() {
            Some(snapshot) => snapshot,
            None => match self.slot.active_task() {
                Some(task) => (task, self.slot.elapsed()),
                None => {
                    self.activate(proposal).await;
                    return Ok(ProposalOutcome::Started);
                }
            },
        };
        let interrupted_id = interrupted.require_id()?;
        self.paused().insert(
            interrupted_id,
            PausedEntry {
                task: interrupted.clone(),
                elapsed,
                awaiting_decision: true,
            },
        );
        handoff::record_switch(self.kv.as_ref(), interrupted_id, elapsed, proposal_id).await;
        self.notify();

        let (request, waiter) =
            self.switches
                .open(proposal.clone(), Some(interrupted.clone()), self.decision_timeout);
        info!(
            request_id = %request.id,
            proposal = %proposal.name,
            interrupted = %interrupted.name,
            "switch request opened"
        );
        self.show_prompt(&request).await;

        let resolution = self.switches.wait(waiter, self.decision_timeout).await;
        if let Err(e) = self.presenter.cancel(request.prompt_id).await {
            warn!(request_id = %request.id, "cannot cancel switch prompt: {e}");
        }
        handoff::clear_switch(self.kv.as_ref()).await;

        let outcome = match resolution.decision() {
            SwitchDecision::StartNow => {
                if let Some(entry) = self.paused().get_mut(&interrupted_id) {
                    entry.awaiting_decision = false;
                }
                if self.slot_holds(interrupted_id) {
                    // The interrupted run stays in its paused entry only.
                    self.slot.stop();
                }
                self.activate(proposal).await;
                info!(request_id = %request.id, %proposal_id, "switch accepted");
                ProposalOutcome::Switched {
                    request_id: request.id,
                    interrupted: interrupted_id,
                }
            }
            SwitchDecision::Snooze => {
                self.paused().remove(&interrupted_id);
                if self.slot_holds(interrupted_id) {
                    self.slot.resume();
                }
                let snoozed_until = self.pending.add_to_pending(&proposal, None).await;
                let timed_out = resolution == SwitchResolution::TimedOut;
                info!(request_id = %request.id, %proposal_id, timed_out, "switch snoozed");
                ProposalOutcome::Snoozed {
                    request_id: request.id,
                    timed_out,
                    snoozed_until,
                }
            }
        };
        self.notify();
        Ok(outcome)
    }

    async fn show_prompt(&self, request: &SwitchRequest) {
        let payload = match (PromptPayload {
            switch_request_id: request.id,
        })
        .encode()
        {
            Ok(payload) => payload,
            Err(e) => {
                warn!(request_id = %request.id, "cannot encode prompt payload: {e}");
                return;
            }
        };
        let body = match &request.interrupted {
            Some(current) => format!(
                "\"{}\" needs attention. Pause \"{}\" and switch?",
                request.proposal.name, current.name
            ),
            None => format!("\"{}\" needs attention.", request.proposal.name),
        };
        let prompt = PromptRequest {
            id: request.prompt_id,
            title: "Higher-priority task".to_owned(),
            body,
            actions: vec![
                PromptAction {
                    id: ACTION_START_NOW.to_owned(),
                    label: "Start now".to_owned(),
                },
                PromptAction {
                    id: ACTION_SNOOZE.to_owned(),
                    label: "Snooze".to_owned(),
                },
            ],
            payload,
        };
        if let Err(e) = self.presenter.show(prompt).await {
            warn!(request_id = %request.id, "cannot show switch prompt: {e}");
        }
    }

    fn slot_holds(&self, task_id: TaskId) -> bool {
        self.slot
            .active_task()
            .is_some_and(|task| task.id == Some(task_id))
    }

    /// Put `task` into the empty slot, continuing a paused run if it has one.
    async fn activate(&self, task: Task) -> bool {
        let task_id = task.id;
        let previous = task_id.and_then(|id| self.paused().remove(&id));
        let name = task.name.clone();
        let started = match previous {
            Some(entry) => self.slot.restore(task, entry.elapsed),
            None => self.slot.start(task),
        };
        if !started {
            warn!(task = %name, "slot occupied, activation skipped");
            return false;
        }
        if let Some(id) = task_id {
            self.pending.remove(id).await;
        }
        handoff::record_active(self.kv.as_ref(), task_id).await;
        info!(task = %name, "task activated");
        self.notify();
        true
    }

    /// Deliver a switch decision by correlation id.
    pub fn resolve_switch(&self, request_id: Uuid, decision: SwitchDecision) -> bool {
        self.switches.resolve(request_id, decision)
    }

    /// Deliver a switch decision that came back through a prompt.
    ///
    /// # Errors
    ///
    /// Returns an error for a malformed payload or unknown action id.
    pub fn resolve_from_prompt(&self, payload: &str, action_id: &str) -> Result<bool> {
        self.switches.resolve_from_prompt(payload, action_id)
    }

    /// Manually pause the active task.
    pub fn pause(&self) -> bool {
        let changed = self.slot.pause();
        if changed {
            self.notify();
        }
        changed
    }

    /// Resume a manually paused task.
    pub fn resume(&self) -> bool {
        let changed = self.slot.resume();
        if changed {
            self.notify();
        }
        changed
    }

    /// Finish the active task and hand it to history.
    ///
    /// Recurring tasks move to their next occurrence; others are marked
    /// complete. A paused entry for the task is dropped, including one held
    /// by an open switch request. Returns `None` when the slot is empty.
    ///
    /// # Errors
    ///
    /// Returns store failures. The slot is already cleared by then.
    pub async fn stop(&self) -> Result<Option<CompletedRun>> {
        let Some((mut task, elapsed)) = self.slot.stop() else {
            return Ok(None);
        };
        handoff::record_active(self.kv.as_ref(), None).await;
        let paused = task.id.and_then(|id| self.paused().remove(&id));
        if paused.is_some_and(|entry| entry.awaiting_decision) {
            handoff::forget_interrupted(self.kv.as_ref()).await;
        }
        self.notify();
        info!(task = %task.name, elapsed_secs = elapsed.as_secs(), "task stopped");

        self.tasks.record_completion(&task, elapsed).await?;
        let rescheduled = task.advance_occurrence(Utc::now());
        if !rescheduled {
            task.completed = true;
        }
        if task.id.is_some() {
            self.tasks.update_task(&task).await?;
        }
        Ok(Some(CompletedRun {
            task,
            elapsed,
            rescheduled,
        }))
    }

    /// Defer a task explicitly, taking it out of the slot if it is there.
    ///
    /// # Errors
    ///
    /// Returns an error when the task cannot be loaded from the store.
    pub async fn snooze(
        &self,
        task_id: TaskId,
        duration: Option<Duration>,
    ) -> Result<Option<DateTime<Utc>>> {
        let task = if self.slot_holds(task_id) {
            let task = self.slot.stop().map(|(task, _)| task);
            handoff::record_active(self.kv.as_ref(), None).await;
            task
        } else {
            None
        };
        let task = match task {
            Some(task) => Some(task),
            None => self.tasks.get_task_by_id(task_id).await?,
        };
        let Some(task) = task else {
            warn!(%task_id, "cannot snooze unknown task");
            return Ok(None);
        };
        self.paused().remove(&task_id);
        let until = self.pending.add_to_pending(&task, duration).await;
        self.notify();
        Ok(until)
    }

    /// Drop a pending entry (cancelled or completed elsewhere).
    pub async fn cancel_pending(&self, task_id: TaskId) -> bool {
        let removed = self.pending.remove(task_id).await;
        if removed {
            self.notify();
        }
        removed
    }

    /// Forget a paused entry without resuming it.
    pub fn abandon_paused(&self, task_id: TaskId) -> Option<PausedEntry> {
        let entry = self.paused().remove(&task_id);
        if entry.is_some() {
            self.notify();
        }
        entry
    }

    /// Store a per-task snooze preference.
    pub async fn set_snooze_preference(&self, task_id: TaskId, minutes: u32) {
        self.pending.set_snooze_preference(task_id, minutes).await;
    }

    /// Recover state after a restart.
    ///
    /// Reloads pending snoozes, puts back a task left in the slot, then
    /// arbitrates any proposal recorded by a background context. An
    /// unresolved switch request counts as snoozed: its interrupted task is
    /// restored with its captured elapsed time and its proposal goes to the
    /// pending queue.
    ///
    /// # Errors
    ///
    /// Returns storage failures while reading the handoff keys.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.pending.load().await;
        let state = HandoffState::load(self.kv.as_ref()).await?;
        let mut report = ReconcileReport::default();

        if !self.slot.is_active() {
            let candidate = match state.interrupted {
                Some((id, elapsed)) => Some((id, elapsed)),
                None => state.active.map(|id| (id, Duration::ZERO)),
            };
            if let Some((task_id, elapsed)) = candidate {
                report.restored = self.restore_slot(task_id, elapsed).await;
            }
        }
        if let Some(proposal_id) = state.switch_proposal {
            report.snoozed = self.defer_unresolved(proposal_id).await;
        }
        if state.interrupted.is_some() || state.switch_proposal.is_some() {
            handoff::clear_switch(self.kv.as_ref()).await;
        }

        if let Some(task_id) = handoff::take_proposed(self.kv.as_ref()).await? {
            match self.tasks.get_task_by_id(task_id).await {
                Ok(Some(task)) if !task.completed => {
                    let outcome = self.propose(task).await?;
                    report.proposed = Some((task_id, outcome));
                }
                Ok(_) => debug!(%task_id, "background proposal for missing or completed task"),
                Err(e) => warn!(%task_id, "cannot load background proposal: {e}"),
            }
        }
        info!(
            restored = ?report.restored,
            snoozed = ?report.snoozed,
            proposed = ?report.proposed,
            "handoff reconciled"
        );
        Ok(report)
    }

    /// Send the proposal of a switch request cut short by a restart to the
    /// pending queue, as a timeout would have.
    async fn defer_unresolved(&self, task_id: TaskId) -> Option<TaskId> {
        let task = match self.tasks.get_task_by_id(task_id).await {
            Ok(Some(task)) if !task.completed => task,
            Ok(_) => {
                debug!(%task_id, "unresolved switch proposal is missing or completed");
                return None;
            }
            Err(e) => {
                warn!(%task_id, "cannot load unresolved switch proposal: {e}");
                return None;
            }
        };
        if self.slot_holds(task_id) {
            return None;
        }
        self.pending.add_to_pending(&task, None).await?;
        self.notify();
        Some(task_id)
    }

    async fn restore_slot(&self, task_id: TaskId, elapsed: Duration) -> Option<TaskId> {
        let task = match self.tasks.get_task_by_id(task_id).await {
            Ok(Some(task)) if !task.completed => task,
            Ok(_) => {
                handoff::record_active(self.kv.as_ref(), None).await;
                return None;
            }
            Err(e) => {
                warn!(%task_id, "cannot load task to restore: {e}");
                return None;
            }
        };
        if !self.slot.restore(task, elapsed) {
            return None;
        }
        self.pending.remove(task_id).await;
        handoff::record_active(self.kv.as_ref(), Some(task_id)).await;
        self.notify();
        Some(task_id)
    }

    #[must_use]
    pub fn slot(&self) -> &ActivationSlot {
        &self.slot
    }

    #[must_use]
    pub fn pending(&self) -> &PendingQueue {
        &self.pending
    }

    #[must_use]
    pub fn paused_entry(&self, task_id: TaskId) -> Option<PausedEntry> {
        self.paused().get(&task_id).cloned()
    }

    /// Switch requests as they open.
    pub fn subscribe_switch_requests(&self) -> broadcast::Receiver<SwitchRequest> {
        self.switches.subscribe()
    }

    pub fn switch_requests(&self) -> BroadcastStream<SwitchRequest> {
        self.switches.stream()
    }

    /// Bumped whenever slot, pending or paused state changes.
    pub fn subscribe_tasks_changed(&self) -> watch::Receiver<u64> {
        self.tasks_changed.subscribe()
    }

    #[must_use]
    pub fn status(&self) -> ArbiterStatus {
        let mut paused: Vec<TaskId> = self.paused().keys().copied().collect();
        paused.sort();
        ArbiterStatus {
            slot: self.slot.state(),
            active: self.slot.active_task(),
            elapsed_secs: self.slot.elapsed().as_secs_f64(),
            pending: self.pending.snapshot(),
            paused,
            open_switch_requests: self.switches.open_count(),
        }
    }
}
