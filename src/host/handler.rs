//! Host command handler wiring envelopes to the arbiter and offline queue.

use crate::arbiter::Arbiter;
use crate::error::{AttendError, Result};
use crate::host::contract::{
    CommandEnvelope, CommandName, ConnectivityPayload, DecidePayload, EnqueuePayload,
    EventEnvelope, ProposePayload, ResponseEnvelope, SnoozePayload, TaskIdPayload,
};
use crate::memory::PresenterCall;
use crate::queue::OfflineQueue;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Dispatches host commands and publishes host events.
pub struct HostHandler {
    arbiter: Arc<Arbiter>,
    queue: Arc<OfflineQueue>,
    event_tx: broadcast::Sender<EventEnvelope>,
}

impl HostHandler {
    #[must_use]
    pub fn new(arbiter: Arc<Arbiter>, queue: Arc<OfflineQueue>, event_capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(event_capacity.max(1));
        Self {
            arbiter,
            queue,
            event_tx,
        }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EventEnvelope> {
        self.event_tx.subscribe()
    }

    fn emit(event_tx: &broadcast::Sender<EventEnvelope>, event: &str, payload: serde_json::Value) {
        // No subscribers just means no frontend is attached yet.
        let _ = event_tx.send(EventEnvelope::new(event, payload));
    }

    /// Bridge switch requests, prompts and queue events onto the host event
    /// stream. The returned handles end when their sources close.
    pub fn forward_events(
        &self,
        mut prompts: mpsc::UnboundedReceiver<PresenterCall>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(3);

        let tx = self.event_tx.clone();
        let mut switches = self.arbiter.subscribe_switch_requests();
        handles.push(tokio::spawn(async move {
            loop {
                match switches.recv().await {
                    Ok(request) => Self::emit(
                        &tx,
                        "switch.requested",
                        json!({
                            "request_id": request.id,
                            "proposal": request.proposal,
                            "interrupted": request.interrupted,
                            "timeout_secs": request.timeout.as_secs(),
                        }),
                    ),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged = n, "switch request forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let tx = self.event_tx.clone();
        let mut queue_events = self.queue.subscribe_events();
        handles.push(tokio::spawn(async move {
            loop {
                match queue_events.recv().await {
                    Ok(event) => match serde_json::to_value(&event) {
                        Ok(payload) => Self::emit(&tx, "queue.event", payload),
                        Err(e) => warn!("cannot encode queue event: {e}"),
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(lagged = n, "queue event forwarder lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let tx = self.event_tx.clone();
        handles.push(tokio::spawn(async move {
            while let Some(call) = prompts.recv().await {
                match call {
                    PresenterCall::Show(prompt) => match serde_json::to_value(&prompt) {
                        Ok(payload) => Self::emit(&tx, "prompt.show", payload),
                        Err(e) => warn!("cannot encode prompt: {e}"),
                    },
                    PresenterCall::Cancel(id) => Self::emit(&tx, "prompt.cancel", json!({ "id": id })),
                }
            }
        }));

        handles
    }

    /// Handle one command. Failures become error responses.
    pub async fn handle(&self, envelope: CommandEnvelope) -> ResponseEnvelope {
        if let Err(e) = envelope.validate() {
            return ResponseEnvelope::error(envelope.request_id, e.to_string());
        }
        let request_id = envelope.request_id.clone();
        match self.route(envelope).await {
            Ok(payload) => ResponseEnvelope::ok(request_id, payload),
            Err(e) => {
                warn!(%request_id, "host command failed: {e}");
                ResponseEnvelope::error(request_id, e.to_string())
            }
        }
    }

    async fn route(&self, envelope: CommandEnvelope) -> Result<serde_json::Value> {
        match envelope.command {
            CommandName::TaskPropose => {
                let ProposePayload { task } = parse_payload(&envelope)?;
                let task_id = task.require_id()?;
                // Arbitration may wait on the user; answer now and report
                // the outcome as an event.
                let arbiter = Arc::clone(&self.arbiter);
                let tx = self.event_tx.clone();
                tokio::spawn(async move {
                    match arbiter.propose(task).await {
                        Ok(outcome) => Self::emit(
                            &tx,
                            "task.proposal_resolved",
                            json!({ "task_id": task_id, "result": outcome }),
                        ),
                        Err(e) => Self::emit(
                            &tx,
                            "task.proposal_failed",
                            json!({ "task_id": task_id, "error": e.to_string() }),
                        ),
                    }
                });
                Ok(json!({ "accepted": true, "task_id": task_id }))
            }
            CommandName::SwitchDecide => {
                let resolved = match parse_payload::<DecidePayload>(&envelope)? {
                    DecidePayload::ById {
                        request_id,
                        decision,
                    } => self.arbiter.resolve_switch(request_id, decision),
                    DecidePayload::FromPrompt { payload, action_id } => {
                        self.arbiter.resolve_from_prompt(&payload, &action_id)?
                    }
                };
                Ok(json!({ "resolved": resolved }))
            }
            CommandName::SlotPause => Ok(json!({ "changed": self.arbiter.pause() })),
            CommandName::SlotResume => Ok(json!({ "changed": self.arbiter.resume() })),
            CommandName::SlotStop => {
                let stopped = self.arbiter.stop().await?.map(|run| {
                    json!({
                        "task": run.task,
                        "elapsed_secs": run.elapsed.as_secs_f64(),
                        "rescheduled": run.rescheduled,
                    })
                });
                Ok(json!({ "stopped": stopped }))
            }
            CommandName::PendingSnooze => {
                let SnoozePayload { task_id, minutes } = parse_payload(&envelope)?;
                let duration = minutes.map(|m| Duration::from_secs(m.saturating_mul(60)));
                let until = self.arbiter.snooze(task_id, duration).await?;
                Ok(json!({ "snoozed_until": until }))
            }
            CommandName::PendingCancel => {
                let TaskIdPayload { task_id } = parse_payload(&envelope)?;
                Ok(json!({ "removed": self.arbiter.cancel_pending(task_id).await }))
            }
            CommandName::QueueEnqueue => {
                let EnqueuePayload { mutation } = parse_payload(&envelope)?;
                let op_id = self.queue.enqueue(mutation).await;
                Ok(json!({ "op_id": op_id, "queue_size": self.queue.queue_size() }))
            }
            CommandName::QueueConnectivity => {
                let ConnectivityPayload { online } = parse_payload(&envelope)?;
                self.queue.set_online(online).await;
                Ok(json!({ "online": self.queue.is_online() }))
            }
            CommandName::QueueDrain => {
                let report = self.queue.drain().await;
                Ok(serde_json::to_value(report)?)
            }
            CommandName::RuntimeStatus => Ok(json!({
                "arbiter": self.arbiter.status(),
                "queue": {
                    "size": self.queue.queue_size(),
                    "online": self.queue.is_online(),
                    "operations": self.queue.operations(),
                },
            })),
            CommandName::RuntimeStop => {
                info!("runtime.stop received");
                Ok(json!({ "stopping": true }))
            }
        }
    }
}

fn parse_payload<T: DeserializeOwned>(envelope: &CommandEnvelope) -> Result<T> {
    serde_json::from_value(envelope.payload.clone()).map_err(|e| {
        AttendError::Protocol(format!(
            "invalid payload for {}: {e}",
            envelope.command.as_str()
        ))
    })
}
