//! Switch request plumbing.
//!
//! When a proposal outranks the active task, the arbiter opens a
//! [`SwitchRequest`]: it is broadcast to in-process observers (UI dialogs) and
//! surfaced as an external prompt whose payload carries the correlation id.
//! A decision can arrive through either path. Each request resolves exactly
//! once, by the first of an explicit decision or the timeout.

use crate::error::{AttendError, Result};
use crate::task::Task;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, warn};
use uuid::Uuid;

/// Prompt action id for "start the proposed task now".
pub const ACTION_START_NOW: &str = "start_now";
/// Prompt action id for "snooze the proposed task".
pub const ACTION_SNOOZE: &str = "snooze";

const BROADCAST_CAPACITY: usize = 32;

static NEXT_PROMPT_ID: AtomicI32 = AtomicI32::new(1);

/// User decision for a switch request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwitchDecision {
    /// Start the proposal; the interrupted task stays paused.
    StartNow,
    /// Defer the proposal and resume the interrupted task.
    Snooze,
}

impl SwitchDecision {
    /// Parse a prompt action id.
    #[must_use]
    pub fn from_action_id(action_id: &str) -> Option<Self> {
        match action_id {
            ACTION_START_NOW => Some(Self::StartNow),
            ACTION_SNOOZE => Some(Self::Snooze),
            _ => None,
        }
    }

    #[must_use]
    pub fn action_id(self) -> &'static str {
        match self {
            Self::StartNow => ACTION_START_NOW,
            Self::Snooze => ACTION_SNOOZE,
        }
    }
}

/// How a switch request was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchResolution {
    /// An explicit decision arrived in time.
    Decided(SwitchDecision),
    /// No decision arrived; treated as [`SwitchDecision::Snooze`].
    TimedOut,
}

impl SwitchResolution {
    /// The decision to apply.
    #[must_use]
    pub fn decision(self) -> SwitchDecision {
        match self {
            Self::Decided(decision) => decision,
            Self::TimedOut => SwitchDecision::Snooze,
        }
    }
}

/// A pending request for the user to choose between the active task and a
/// higher-priority proposal.
#[derive(Debug, Clone)]
pub struct SwitchRequest {
    /// Correlation id.
    pub id: Uuid,
    /// Presenter-level prompt id.
    pub prompt_id: i32,
    /// Task asking for the slot.
    pub proposal: Task,
    /// Task that was interrupted to ask.
    pub interrupted: Option<Task>,
    pub created_at: DateTime<Utc>,
    /// How long the request stays open.
    pub timeout: Duration,
}

/// Payload attached to the external prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptPayload {
    pub switch_request_id: Uuid,
}

impl PromptPayload {
    /// Encode for a presenter payload string.
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode a presenter payload string.
    pub fn decode(payload: &str) -> Result<Self> {
        serde_json::from_str(payload)
            .map_err(|e| AttendError::Arbitration(format!("malformed prompt payload: {e}")))
    }
}

/// Receiving half of an open switch request.
pub struct PendingSwitch {
    id: Uuid,
    rx: oneshot::Receiver<SwitchDecision>,
}

impl PendingSwitch {
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }
}

/// Registry of open switch requests keyed by correlation id.
pub struct SwitchRegistry {
    open: Mutex<HashMap<Uuid, oneshot::Sender<SwitchDecision>>>,
    requests_tx: broadcast::Sender<SwitchRequest>,
}

impl Default for SwitchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SwitchRegistry {
    #[must_use]
    pub fn new() -> Self {
        let (requests_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            open: Mutex::new(HashMap::new()),
            requests_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, oneshot::Sender<SwitchDecision>>> {
        self.open.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new request under a fresh correlation id and broadcast it.
    pub fn open(
        &self,
        proposal: Task,
        interrupted: Option<Task>,
        timeout: Duration,
    ) -> (SwitchRequest, PendingSwitch) {
        let (tx, rx) = oneshot::channel();
        let request = SwitchRequest {
            id: Uuid::new_v4(),
            prompt_id: NEXT_PROMPT_ID.fetch_add(1, Ordering::Relaxed),
            proposal,
            interrupted,
            created_at: Utc::now(),
            timeout,
        };
        self.lock().insert(request.id, tx);

        // No subscribers is fine: the external prompt still carries the id.
        let _ = self.requests_tx.send(request.clone());
        debug!(request_id = %request.id, "switch request opened");

        let pending = PendingSwitch { id: request.id, rx };
        (request, pending)
    }

    /// Deliver a decision. Returns `false` for unknown or already-resolved ids.
    pub fn resolve(&self, id: Uuid, decision: SwitchDecision) -> bool {
        let Some(tx) = self.lock().remove(&id) else {
            debug!(request_id = %id, "decision for unknown or resolved switch request");
            return false;
        };
        tx.send(decision).is_ok()
    }

    /// Deliver a decision that came back through a prompt payload.
    ///
    /// # Errors
    ///
    /// Returns an error when the payload cannot be decoded or the action id
    /// is not a switch action.
    pub fn resolve_from_prompt(&self, payload: &str, action_id: &str) -> Result<bool> {
        let payload = PromptPayload::decode(payload)?;
        let decision = SwitchDecision::from_action_id(action_id).ok_or_else(|| {
            AttendError::Arbitration(format!("unknown switch action '{action_id}'"))
        })?;
        Ok(self.resolve(payload.switch_request_id, decision))
    }

    /// Wait for the first of a decision or the timeout.
    pub async fn wait(&self, pending: PendingSwitch, timeout: Duration) -> SwitchResolution {
        let PendingSwitch { id, mut rx } = pending;
        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(decision)) => SwitchResolution::Decided(decision),
            Ok(Err(_)) => {
                warn!(request_id = %id, "switch decision channel closed, treating as snooze");
                self.lock().remove(&id);
                SwitchResolution::TimedOut
            }
            Err(_) => {
                // A decision may have raced the timer: if the sender is gone
                // the value is already in the channel.
                if self.lock().remove(&id).is_some() {
                    debug!(request_id = %id, "switch request timed out");
                    SwitchResolution::TimedOut
                } else {
                    match rx.try_recv() {
                        Ok(decision) => SwitchResolution::Decided(decision),
                        Err(_) => SwitchResolution::TimedOut,
                    }
                }
            }
        }
    }

    /// Subscribe to newly opened requests.
    pub fn subscribe(&self) -> broadcast::Receiver<SwitchRequest> {
        self.requests_tx.subscribe()
    }

    /// Newly opened requests as a stream.
    pub fn stream(&self) -> BroadcastStream<SwitchRequest> {
        BroadcastStream::new(self.subscribe())
    }

    /// Number of requests awaiting resolution.
    pub fn open_count(&self) -> usize {
        self.lock().len()
    }
}
