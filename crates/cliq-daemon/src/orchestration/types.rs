//! Scheduler state, configuration, events, and errors.

use std::time::Duration;

use cliq_core::config::SchedulerSettings;
use cliq_core::{ItemFailure, ItemStatus};
use serde::{Deserialize, Serialize};

use super::graph::{GraphError, Progress};
use super::store::StoreError;

/// Broadcast capacity for scheduler events.
pub const EVENT_BROADCAST_CAPACITY: usize = 256;

/// Lifecycle of one scheduler run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
    Paused,
    Stopping,
    Completed,
    Failed,
}

impl SchedulerState {
    /// `idle`, `completed` or `failed`: a new run may start.
    pub const fn can_start(self) -> bool {
        matches!(self, Self::Idle | Self::Completed | Self::Failed)
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopping => "stopping",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SchedulerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runtime scheduler configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_concurrent_sessions: usize,
    /// Passed through to every dispatch.
    pub item_timeout: Option<Duration>,
    pub max_consecutive_spawn_failures: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&SchedulerSettings::default())
    }
}

impl From<&SchedulerSettings> for SchedulerConfig {
    fn from(settings: &SchedulerSettings) -> Self {
        Self {
            max_concurrent_sessions: settings.max_concurrent_sessions,
            item_timeout: settings.item_timeout_secs.map(Duration::from_secs),
            max_consecutive_spawn_failures: settings.max_consecutive_spawn_failures,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        Self::default()
            .merged(&ConfigUpdate {
                max_concurrent_sessions: Some(self.max_concurrent_sessions),
                item_timeout: Some(self.item_timeout),
                max_consecutive_spawn_failures: Some(self.max_consecutive_spawn_failures),
            })
            .map(|_| ())
    }

    /// Merge `update` into a copy of `self`, rejecting invalid values.
    pub fn merged(&self, update: &ConfigUpdate) -> Result<Self, SchedulerError> {
        let mut next = *self;
        if let Some(max) = update.max_concurrent_sessions {
            if max < 1 {
                return Err(SchedulerError::InvalidConfig {
                    message: format!("max_concurrent_sessions must be at least 1, got {max}"),
                });
            }
            next.max_concurrent_sessions = max;
        }
        if let Some(timeout) = update.item_timeout {
            if timeout.is_some_and(|d| d.is_zero()) {
                return Err(SchedulerError::InvalidConfig {
                    message: "item_timeout must be positive".to_string(),
                });
            }
            next.item_timeout = timeout;
        }
        if let Some(limit) = update.max_consecutive_spawn_failures {
            if limit < 1 {
                return Err(SchedulerError::InvalidConfig {
                    message: "max_consecutive_spawn_failures must be at least 1".to_string(),
                });
            }
            next.max_consecutive_spawn_failures = limit;
        }
        Ok(next)
    }
}

/// Partial configuration update. Unset fields keep their value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigUpdate {
    pub max_concurrent_sessions: Option<usize>,
    /// `Some(None)` removes the per-item timeout.
    pub item_timeout: Option<Option<Duration>>,
    pub max_consecutive_spawn_failures: Option<u32>,
}

impl ConfigUpdate {
    pub const fn concurrency(max: usize) -> Self {
        Self {
            max_concurrent_sessions: Some(max),
            item_timeout: None,
            max_consecutive_spawn_failures: None,
        }
    }

    /// Set the per-item timeout, or clear it with `None`.
    pub const fn timeout(timeout: Option<Duration>) -> Self {
        Self {
            max_concurrent_sessions: None,
            item_timeout: Some(timeout),
            max_consecutive_spawn_failures: None,
        }
    }
}

/// Kind of scheduler-level fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultKind {
    /// Session acquisition kept failing across consecutive items.
    SessionPoolExhausted,
    /// The item store rejected or failed to persist an update.
    StoreUnavailable,
}

/// Infrastructure fault that halted a run. Distinct from item failures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerFault {
    pub kind: FaultKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub item_id: Option<String>,
}

/// Pull snapshot of the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub progress: Progress,
    pub error: Option<SchedulerFault>,
    /// Items currently `executing`.
    pub running: usize,
    pub max_concurrent_sessions: usize,
}

/// Status change of one item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemStatusUpdate {
    pub item_id: String,
    pub status: ItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ItemFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

/// Pushed to every subscriber.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedulerEvent {
    StateChanged {
        state: SchedulerState,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<SchedulerFault>,
    },
    ItemStatus(ItemStatusUpdate),
    SessionBound {
        item_id: String,
        resume_key: String,
        session_key: String,
    },
    Progress(Progress),
}

/// Errors returned by scheduler operations.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Cannot {operation} while {from}")]
    InvalidTransition {
        from: SchedulerState,
        operation: &'static str,
    },

    #[error("Item not found: {item_id}")]
    ItemNotFound { item_id: String },

    #[error("Item {item_id} is {status}")]
    InvalidItemState { item_id: String, status: ItemStatus },

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Scheduler has shut down")]
    Closed,
}
