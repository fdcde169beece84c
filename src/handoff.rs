//! Cross-context handoff through durable keys.
//!
//! Trigger handlers (alarm receivers, geofence transitions) may run in a
//! context that shares no memory with the foreground [`crate::Arbiter`].
//! They never touch the slot directly: they record the proposal under
//! [`keys::PROPOSED_TASK_ID`] and the foreground side picks it up in
//! [`crate::Arbiter::reconcile`]. The arbiter in turn mirrors its own state
//! into the active/interrupted keys so a restarted process can recover it.

use crate::error::Result;
use crate::storage::{self, KeyValueStore, keys};
use crate::task::TaskId;
use std::time::Duration;
use tracing::{debug, warn};

/// Record a proposal from a background trigger context.
///
/// A later proposal overwrites an earlier unreconciled one.
pub async fn propose_from_background(kv: &dyn KeyValueStore, task_id: TaskId) -> Result<()> {
    kv.set(keys::PROPOSED_TASK_ID, task_id.to_string()).await?;
    debug!(%task_id, "background proposal recorded");
    Ok(())
}

/// Durable handoff keys as found in storage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandoffState {
    pub active: Option<TaskId>,
    /// Task paused by a switch request that never resolved, with its
    /// captured elapsed time.
    pub interrupted: Option<(TaskId, Duration)>,
    /// Proposal of that unresolved switch request.
    pub switch_proposal: Option<TaskId>,
    pub proposed: Option<TaskId>,
}

impl HandoffState {
    /// Read all handoff keys. Unparseable values count as absent.
    pub async fn load(kv: &dyn KeyValueStore) -> Result<Self> {
        let active = storage::get_parsed(kv, keys::ACTIVE_TASK_ID).await?;
        let proposed = storage::get_parsed(kv, keys::PROPOSED_TASK_ID).await?;
        let switch_proposal = storage::get_parsed(kv, keys::SWITCH_PROPOSAL_ID).await?;
        let interrupted = match storage::get_parsed::<TaskId>(kv, keys::INTERRUPTED_TASK_ID).await? {
            Some(id) => {
                let secs = storage::get_parsed::<f64>(kv, keys::INTERRUPTED_ELAPSED_SECS)
                    .await?
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .unwrap_or(0.0);
                Some((id, Duration::from_secs_f64(secs)))
            }
            None => None,
        };
        Ok(Self {
            active,
            interrupted,
            switch_proposal,
            proposed,
        })
    }
}

/// Remove and return the background proposal, if any.
pub async fn take_proposed(kv: &dyn KeyValueStore) -> Result<Option<TaskId>> {
    let proposed = storage::get_parsed(kv, keys::PROPOSED_TASK_ID).await?;
    if proposed.is_some() {
        kv.remove(keys::PROPOSED_TASK_ID).await?;
    }
    Ok(proposed)
}

/// Mirror the slot occupant. Failures are logged; the next change rewrites
/// the key.
pub(crate) async fn record_active(kv: &dyn KeyValueStore, task_id: Option<TaskId>) {
    let result = match task_id {
        Some(id) => kv.set(keys::ACTIVE_TASK_ID, id.to_string()).await,
        None => kv.remove(keys::ACTIVE_TASK_ID).await,
    };
    if let Err(e) = result {
        warn!("cannot persist active task id: {e}");
    }
}

/// Mirror an open switch request: the task it paused, that task's elapsed
/// time and the proposal waiting on the decision.
pub(crate) async fn record_switch(
    kv: &dyn KeyValueStore,
    interrupted: TaskId,
    elapsed: Duration,
    proposal: TaskId,
) {
    let result: Result<()> = async {
        kv.set(keys::SWITCH_PROPOSAL_ID, proposal.to_string()).await?;
        kv.set(keys::INTERRUPTED_ELAPSED_SECS, elapsed.as_secs_f64().to_string())
            .await?;
        kv.set(keys::INTERRUPTED_TASK_ID, interrupted.to_string()).await
    }
    .await;
    if let Err(e) = result {
        warn!("cannot persist open switch request: {e}");
    }
}

/// Clear the keys of a resolved switch request.
pub(crate) async fn clear_switch(kv: &dyn KeyValueStore) {
    forget_interrupted(kv).await;
    if let Err(e) = kv.remove(keys::SWITCH_PROPOSAL_ID).await {
        warn!("cannot clear switch proposal: {e}");
    }
}

/// Drop the interrupted task of an open switch request, keeping its proposal.
pub(crate) async fn forget_interrupted(kv: &dyn KeyValueStore) {
    let result: Result<()> = async {
        kv.remove(keys::INTERRUPTED_TASK_ID).await?;
        kv.remove(keys::INTERRUPTED_ELAPSED_SECS).await
    }
    .await;
    if let Err(e) = result {
        warn!("cannot clear interrupted task: {e}");
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::storage::MemoryKeyValueStore;

    #[tokio::test]
    async fn background_proposal_is_taken_once() {
        let kv = MemoryKeyValueStore::new();
        propose_from_background(&kv, TaskId(9)).await.unwrap();
        assert_eq!(HandoffState::load(&kv).await.unwrap().proposed, Some(TaskId(9)));

        assert_eq!(take_proposed(&kv).await.unwrap(), Some(TaskId(9)));
        assert_eq!(take_proposed(&kv).await.unwrap(), None);
    }

    #[tokio::test]
    async fn open_switch_round_trips() {
        let kv = MemoryKeyValueStore::new();
        record_switch(&kv, TaskId(3), Duration::from_millis(1500), TaskId(8)).await;
        let state = HandoffState::load(&kv).await.unwrap();
        assert_eq!(state.interrupted, Some((TaskId(3), Duration::from_millis(1500))));
        assert_eq!(state.switch_proposal, Some(TaskId(8)));

        forget_interrupted(&kv).await;
        let state = HandoffState::load(&kv).await.unwrap();
        assert_eq!(state.interrupted, None);
        assert_eq!(state.switch_proposal, Some(TaskId(8)));

        clear_switch(&kv).await;
        assert!(kv.is_empty());
    }

    #[tokio::test]
    async fn garbage_values_count_as_absent() {
        let kv = MemoryKeyValueStore::new();
        kv.set(keys::ACTIVE_TASK_ID, "not-a-number".into()).await.unwrap();
        kv.set(keys::INTERRUPTED_TASK_ID, "4".into()).await.unwrap();
        kv.set(keys::INTERRUPTED_ELAPSED_SECS, "-3".into()).await.unwrap();

        let state = HandoffState::load(&kv).await.unwrap();
        assert_eq!(state.active, None);
        assert_eq!(state.interrupted, Some((TaskId(4), Duration::ZERO)));
    }

    #[tokio::test]
    async fn active_key_follows_slot() {
        let kv = MemoryKeyValueStore::new();
        record_active(&kv, Some(TaskId(1))).await;
        assert_eq!(HandoffState::load(&kv).await.unwrap().active, Some(TaskId(1)));
        record_active(&kv, None).await;
        assert_eq!(HandoffState::load(&kv).await.unwrap(), HandoffState::default());
    }
}
