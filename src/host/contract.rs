//! Versioned host command/event envelopes for native shell integration.

use crate::arbitration::SwitchDecision;
use crate::queue::Mutation;
use crate::task::{Task, TaskId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Contract version for host command/event envelopes.
pub const EVENT_VERSION: u32 = 1;

/// Command set for host integrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "task.propose")]
    TaskPropose,
    #[serde(rename = "switch.decide")]
    SwitchDecide,
    #[serde(rename = "slot.pause")]
    SlotPause,
    #[serde(rename = "slot.resume")]
    SlotResume,
    #[serde(rename = "slot.stop")]
    SlotStop,
    #[serde(rename = "pending.snooze")]
    PendingSnooze,
    #[serde(rename = "pending.cancel")]
    PendingCancel,
    #[serde(rename = "queue.enqueue")]
    QueueEnqueue,
    #[serde(rename = "queue.connectivity")]
    QueueConnectivity,
    #[serde(rename = "queue.drain")]
    QueueDrain,
    #[serde(rename = "runtime.status")]
    RuntimeStatus,
    #[serde(rename = "runtime.stop")]
    RuntimeStop,
}

impl CommandName {
    /// Render command name to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskPropose => "task.propose",
            Self::SwitchDecide => "switch.decide",
            Self::SlotPause => "slot.pause",
            Self::SlotResume => "slot.resume",
            Self::SlotStop => "slot.stop",
            Self::PendingSnooze => "pending.snooze",
            Self::PendingCancel => "pending.cancel",
            Self::QueueEnqueue => "queue.enqueue",
            Self::QueueConnectivity => "queue.connectivity",
            Self::QueueDrain => "queue.drain",
            Self::RuntimeStatus => "runtime.status",
            Self::RuntimeStop => "runtime.stop",
        }
    }
}

/// Payload of `task.propose`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposePayload {
    pub task: Task,
}

/// Payload of `switch.decide`: either a correlation id with a decision, or
/// the prompt payload and action id a presenter handed back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DecidePayload {
    ById {
        request_id: Uuid,
        decision: SwitchDecision,
    },
    FromPrompt {
        payload: String,
        action_id: String,
    },
}

/// Payload of `pending.snooze`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnoozePayload {
    pub task_id: TaskId,
    /// Overrides the default snooze; a stored per-task preference still wins.
    #[serde(default)]
    pub minutes: Option<u64>,
}

/// Payload of commands addressing a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskIdPayload {
    pub task_id: TaskId,
}

/// Payload of `queue.enqueue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueuePayload {
    pub mutation: Mutation,
}

/// Payload of `queue.connectivity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectivityPayload {
    pub online: bool,
}

/// A versioned response envelope from backend host -> frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: String,
    pub ok: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
}

impl ResponseEnvelope {
    /// Build a successful response envelope.
    #[must_use]
    pub fn ok(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload,
            error: None,
        }
    }

    /// Build an error response envelope.
    #[must_use]
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

/// A versioned command envelope from frontend -> backend host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    pub request_id: String,
    pub command: CommandName,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    /// Build a v1 command envelope.
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        command: CommandName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            command,
            payload,
        }
    }

    /// Validate envelope version and required identifiers.
    pub fn validate(&self) -> Result<(), ContractError> {
        if self.v != EVENT_VERSION {
            return Err(ContractError::new(
                ContractErrorKind::UnsupportedVersion,
                format!(
                    "unsupported contract version {}; expected {}",
                    self.v, EVENT_VERSION
                ),
            ));
        }
        if self.request_id.trim().is_empty() {
            return Err(ContractError::new(
                ContractErrorKind::InvalidEnvelope,
                "request_id cannot be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// A versioned event envelope from backend host -> frontend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Build a v1 event envelope with a fresh id.
    #[must_use]
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            event_id: Uuid::new_v4().to_string(),
            event: event.into(),
            payload,
        }
    }
}

/// Contract validation error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContractErrorKind {
    UnsupportedVersion,
    InvalidEnvelope,
}

/// Contract validation error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractError {
    pub kind: ContractErrorKind,
    pub message: String,
}

impl ContractError {
    #[must_use]
    pub fn new(kind: ContractErrorKind, message: String) -> Self {
        Self { kind, message }
    }
}

impl std::fmt::Display for ContractError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ContractError {}
