//! Integration tests for task activation arbitration.
//!
//! Drives the arbiter through its public API with in-memory stores and a
//! channel presenter standing in for the notification layer.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use attend::arbiter::{Arbiter, ProposalOutcome};
use attend::arbitration::{ACTION_SNOOZE, SwitchDecision};
use attend::collaborators::{Collaborators, PromptRequest};
use attend::config::AttendConfig;
use attend::handoff;
use attend::memory::{ChannelPresenter, InMemoryGeofenceStore, InMemoryTaskStore, PresenterCall};
use attend::slot::SlotState;
use attend::storage::{KeyValueStore, MemoryKeyValueStore, keys};
use attend::task::{Priority, Task, TaskId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

struct Setup {
    arbiter: Arc<Arbiter>,
    kv: Arc<MemoryKeyValueStore>,
    prompts: mpsc::UnboundedReceiver<PresenterCall>,
}

fn task(id: i64, priority: u8) -> Task {
    Task::new(format!("task-{id}"), Priority::new(priority).unwrap()).with_id(id)
}

fn seeded_tasks() -> Vec<Task> {
    vec![task(1, 2), task(2, 5), task(3, 1)]
}

fn setup_with(kv: Arc<MemoryKeyValueStore>, timeout: Duration) -> Setup {
    let (presenter, prompts) = ChannelPresenter::new();
    let deps = Collaborators {
        tasks: Arc::new(InMemoryTaskStore::with_tasks(seeded_tasks())),
        geofences: Arc::new(InMemoryGeofenceStore::new()),
        presenter: Arc::new(presenter),
        kv: kv.clone(),
    };
    let arbiter = Arbiter::new(&AttendConfig::default(), deps).with_decision_timeout(timeout);
    Setup {
        arbiter: Arc::new(arbiter),
        kv,
        prompts,
    }
}

fn setup(timeout: Duration) -> Setup {
    setup_with(Arc::new(MemoryKeyValueStore::new()), timeout)
}

async fn next_prompt(rx: &mut mpsc::UnboundedReceiver<PresenterCall>) -> PromptRequest {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(PresenterCall::Show(prompt))) => return prompt,
            Ok(Some(PresenterCall::Cancel(_))) => continue,
            other => panic!("expected a prompt, got {other:?}"),
        }
    }
}

/// A priority-5 proposal against a running priority-2 task opens exactly one
/// switch request; accepting it starts the proposal fresh and keeps the
/// interrupted task's elapsed time frozen in its paused entry.
#[tokio::test]
async fn test_priority_preemption_start_now() {
    let s = setup(Duration::from_secs(5));
    let mut requests = s.arbiter.subscribe_switch_requests();

    s.arbiter.propose(task(1, 2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;

    let arbiter = Arc::clone(&s.arbiter);
    let proposal = tokio::spawn(async move { arbiter.propose(task(2, 5)).await });

    let request = tokio::time::timeout(Duration::from_secs(2), requests.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request.proposal.id, Some(TaskId(2)));
    assert_eq!(request.interrupted.as_ref().unwrap().id, Some(TaskId(1)));
    assert_eq!(
        s.arbiter.slot().state(),
        SlotState::Paused { interrupted: true }
    );
    let frozen = s.arbiter.paused_entry(TaskId(1)).unwrap().elapsed;
    assert!(frozen >= Duration::from_millis(30));

    assert!(s.arbiter.resolve_switch(request.id, SwitchDecision::StartNow));
    let outcome = proposal.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        ProposalOutcome::Switched {
            request_id: request.id,
            interrupted: TaskId(1),
        }
    );

    assert_eq!(s.arbiter.slot().active_task().unwrap().id, Some(TaskId(2)));
    assert!(s.arbiter.slot().elapsed() < frozen + Duration::from_secs(1));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(s.arbiter.paused_entry(TaskId(1)).unwrap().elapsed, frozen);

    assert!(
        matches!(requests.try_recv(), Err(broadcast::error::TryRecvError::Empty)),
        "exactly one switch request"
    );
}

/// A lower-priority proposal never disturbs the running task.
#[tokio::test]
async fn test_non_preemption_defers_proposal() {
    let mut s = setup(Duration::from_secs(5));
    s.arbiter.propose(task(2, 5)).await.unwrap();

    let outcome = s.arbiter.propose(task(3, 1)).await.unwrap();
    assert!(matches!(outcome, ProposalOutcome::Deferred { snoozed_until: Some(_) }));

    assert_eq!(s.arbiter.slot().state(), SlotState::Running);
    assert_eq!(s.arbiter.slot().active_task().unwrap().id, Some(TaskId(2)));
    assert!(s.arbiter.paused_entry(TaskId(2)).is_none());
    assert!(s.prompts.try_recv().is_err(), "no prompt for a losing proposal");

    let remaining = s.arbiter.pending().remaining_time(TaskId(3)).unwrap();
    let default_snooze = AttendConfig::default().arbitration.default_snooze();
    assert!(remaining > Duration::ZERO);
    assert!(remaining <= default_snooze);
}

async fn snoozed_state(s: &mut Setup, explicit: bool) -> ProposalOutcome {
    s.arbiter.propose(task(1, 2)).await.unwrap();
    let arbiter = Arc::clone(&s.arbiter);
    let proposal = tokio::spawn(async move { arbiter.propose(task(2, 5)).await });

    let prompt = next_prompt(&mut s.prompts).await;
    if explicit {
        assert!(
            s.arbiter
                .resolve_from_prompt(&prompt.payload, ACTION_SNOOZE)
                .unwrap()
        );
    }
    proposal.await.unwrap().unwrap()
}

/// Letting a switch request time out leaves the same state as snoozing it.
#[tokio::test]
async fn test_timeout_matches_explicit_snooze() {
    let mut explicit = setup(Duration::from_secs(5));
    let mut silent = setup(Duration::from_millis(50));

    let explicit_outcome = snoozed_state(&mut explicit, true).await;
    let silent_outcome = snoozed_state(&mut silent, false).await;

    assert!(matches!(
        explicit_outcome,
        ProposalOutcome::Snoozed { timed_out: false, .. }
    ));
    assert!(matches!(
        silent_outcome,
        ProposalOutcome::Snoozed { timed_out: true, .. }
    ));

    for s in [&explicit, &silent] {
        assert_eq!(s.arbiter.slot().state(), SlotState::Running);
        assert_eq!(s.arbiter.slot().active_task().unwrap().id, Some(TaskId(1)));
        assert!(s.arbiter.paused_entry(TaskId(1)).is_none());
        assert!(s.arbiter.pending().is_pending(TaskId(2)));
        assert!(!s.arbiter.pending().is_pending(TaskId(1)));
        assert!(s.kv.get(keys::INTERRUPTED_TASK_ID).await.unwrap().is_none());
    }
    let a = explicit.arbiter.pending().remaining_time(TaskId(2)).unwrap();
    let b = silent.arbiter.pending().remaining_time(TaskId(2)).unwrap();
    assert!(a.abs_diff(b) < Duration::from_secs(5));
}

/// A late decision after the timeout is rejected.
#[tokio::test]
async fn test_late_decision_is_ignored() {
    let mut s = setup(Duration::from_millis(30));
    let mut requests = s.arbiter.subscribe_switch_requests();
    snoozed_state(&mut s, false).await;
    let request = requests.recv().await.unwrap();
    assert!(!s.arbiter.resolve_switch(request.id, SwitchDecision::StartNow));
    assert_eq!(s.arbiter.slot().active_task().unwrap().id, Some(TaskId(1)));
}

/// Proposals queue behind an open switch request and are arbitrated in
/// arrival order.
#[tokio::test]
async fn test_proposals_are_serialized() {
    let mut s = setup(Duration::from_secs(5));
    s.arbiter.propose(task(3, 1)).await.unwrap();

    let first = {
        let arbiter = Arc::clone(&s.arbiter);
        tokio::spawn(async move { arbiter.propose(task(1, 2)).await })
    };
    let prompt = next_prompt(&mut s.prompts).await;

    let second = {
        let arbiter = Arc::clone(&s.arbiter);
        tokio::spawn(async move { arbiter.propose(task(2, 5)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!second.is_finished(), "second proposal waits its turn");

    s.arbiter
        .resolve_from_prompt(&prompt.payload, attend::arbitration::ACTION_START_NOW)
        .unwrap();
    assert!(matches!(
        first.await.unwrap().unwrap(),
        ProposalOutcome::Switched { .. }
    ));

    let prompt = next_prompt(&mut s.prompts).await;
    s.arbiter
        .resolve_from_prompt(&prompt.payload, attend::arbitration::ACTION_START_NOW)
        .unwrap();
    assert!(matches!(
        second.await.unwrap().unwrap(),
        ProposalOutcome::Switched {
            interrupted: TaskId(1),
            ..
        }
    ));
    assert_eq!(s.arbiter.slot().active_task().unwrap().id, Some(TaskId(2)));
}

/// A proposal recorded by a background context is arbitrated on reconcile.
#[tokio::test]
async fn test_reconcile_picks_up_background_proposal() {
    let s = setup(Duration::from_secs(5));
    handoff::propose_from_background(s.kv.as_ref(), TaskId(3))
        .await
        .unwrap();

    let report = s.arbiter.reconcile().await.unwrap();
    assert_eq!(report.proposed, Some((TaskId(3), ProposalOutcome::Started)));
    assert!(s.kv.get(keys::PROPOSED_TASK_ID).await.unwrap().is_none());
    assert_eq!(
        s.kv.get(keys::ACTIVE_TASK_ID).await.unwrap().as_deref(),
        Some("3")
    );
}

/// An arbitration cut short by a restart resolves as a snooze: the
/// interrupted task comes back with its captured elapsed time.
#[tokio::test]
async fn test_reconcile_restores_interrupted_task() {
    let kv = Arc::new(MemoryKeyValueStore::new());
    kv.set(keys::ACTIVE_TASK_ID, "1".into()).await.unwrap();
    kv.set(keys::INTERRUPTED_TASK_ID, "1".into()).await.unwrap();
    kv.set(keys::INTERRUPTED_ELAPSED_SECS, "42".into())
        .await
        .unwrap();

    let s = setup_with(kv, Duration::from_secs(5));
    let report = s.arbiter.reconcile().await.unwrap();
    assert_eq!(report.restored, Some(TaskId(1)));
    assert_eq!(s.arbiter.slot().state(), SlotState::Running);
    assert!(s.arbiter.slot().elapsed() >= Duration::from_secs(42));
    assert!(s.kv.get(keys::INTERRUPTED_TASK_ID).await.unwrap().is_none());
}

/// A restart while a switch request is open settles it as a snooze: the
/// interrupted task resumes and the proposal waits in the pending queue.
#[tokio::test]
async fn test_restart_mid_switch_defers_proposal() {
    let kv = Arc::new(MemoryKeyValueStore::new());
    {
        let mut first = setup_with(kv.clone(), Duration::from_secs(30));
        first.arbiter.propose(task(1, 2)).await.unwrap();
        let arbiter = Arc::clone(&first.arbiter);
        let proposal = tokio::spawn(async move { arbiter.propose(task(2, 5)).await });
        next_prompt(&mut first.prompts).await;

        // The process dies before anyone answers.
        proposal.abort();
        assert!(proposal.await.unwrap_err().is_cancelled());
    }

    let s = setup_with(kv, Duration::from_secs(5));
    let report = s.arbiter.reconcile().await.unwrap();
    assert_eq!(report.restored, Some(TaskId(1)));
    assert_eq!(report.snoozed, Some(TaskId(2)));
    assert_eq!(s.arbiter.slot().state(), SlotState::Running);
    assert_eq!(s.arbiter.slot().active_task().unwrap().id, Some(TaskId(1)));
    assert!(s.arbiter.pending().is_pending(TaskId(2)));
    assert!(s.kv.get(keys::SWITCH_PROPOSAL_ID).await.unwrap().is_none());
    assert!(s.kv.get(keys::INTERRUPTED_TASK_ID).await.unwrap().is_none());
}

/// Pending snoozes survive a restart through the shared key-value store.
#[tokio::test]
async fn test_pending_survives_restart() {
    let kv = Arc::new(MemoryKeyValueStore::new());
    {
        let s = setup_with(kv.clone(), Duration::from_secs(5));
        s.arbiter.propose(task(2, 5)).await.unwrap();
        s.arbiter.propose(task(3, 1)).await.unwrap();
        assert!(s.arbiter.pending().is_pending(TaskId(3)));
    }

    let s = setup_with(kv, Duration::from_secs(5));
    let report = s.arbiter.reconcile().await.unwrap();
    assert_eq!(report.restored, Some(TaskId(2)));
    assert!(s.arbiter.pending().is_pending(TaskId(3)));
    assert!(!s.arbiter.pending().is_pending(TaskId(2)));
}
