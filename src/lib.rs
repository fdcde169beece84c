//! Attend: task activation arbitration and offline mutation queueing.
//!
//! Core of a location- and time-based reminder app. It decides which single
//! task owns the user's attention, resolves conflicts when a new trigger
//! competes with the running task, and keeps data mutations made while
//! offline until the backing store can take them.
//!
//! # Architecture
//!
//! - **Priority**: base priority plus temporal urgency as one comparable scalar
//! - **Slot**: at most one running task with its elapsed-time tick
//! - **Arbitration**: correlated switch requests resolved by decision or timeout
//! - **Pending**: snoozed tasks with per-entry expiry, persisted
//! - **Queue**: ordered, deduplicated, retried mutation intents
//! - **Arbiter**: composition root tying the above to the external stores

pub mod arbiter;
pub mod arbitration;
pub mod attend_dirs;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod handoff;
pub mod host;
pub mod memory;
pub mod pending;
pub mod priority;
pub mod queue;
pub mod slot;
pub mod storage;
pub mod task;

pub use arbiter::{Arbiter, ProposalOutcome};
pub use arbitration::{SwitchDecision, SwitchRequest};
pub use collaborators::Collaborators;
pub use config::AttendConfig;
pub use error::{AttendError, Result};
pub use queue::{OfflineQueue, QueueEvent};
pub use task::{Geofence, GeofenceId, Priority, Task, TaskId};
