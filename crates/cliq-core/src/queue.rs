//! Queue item model.
//!
//! A queue is a flat list of [`QueueItem`]s linked by `depends_on` edges.
//! The list is persisted as a JSON array and mutated in place: the only
//! field the scheduler rewrites is `status` (plus the failure details
//! that accompany it).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{Error, Result};

/// Lifecycle status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Ready,
    Executing,
    Completed,
    Failed,
    Blocked,
}

impl ItemStatus {
    /// `completed` or `failed`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Terminal, or `blocked`. Settled items count towards progress.
    pub const fn is_settled(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Blocked)
    }

    /// Whether `self -> next` is a legal edge of the item state machine.
    ///
    /// `failed -> pending` is the external retry reset; every other edge
    /// is driven by the scheduler. Executing items are never blocked.
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Ready)
                | (Self::Ready, Self::Executing)
                | (Self::Executing, Self::Completed | Self::Failed)
                | (Self::Pending | Self::Ready, Self::Blocked)
                | (Self::Blocked, Self::Ready)
                | (Self::Failed, Self::Pending)
        )
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureKind {
    /// The command ran and exited non-zero.
    Execution,
    /// No session could be acquired for the item.
    SessionUnavailable,
    /// The per-item timeout elapsed.
    Timeout,
    /// Found `executing` at startup; the run that owned it is gone.
    Interrupted,
}

impl FailureKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Execution => "execution",
            Self::SessionUnavailable => "session-unavailable",
            Self::Timeout => "timeout",
            Self::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure details recorded on an item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ItemFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

/// A unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub item_id: String,
    pub issue_id: String,
    #[serde(default)]
    pub execution_group: String,
    #[serde(default)]
    pub execution_order: i64,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_status")]
    pub status: ItemStatus,
    /// Command text handed to the session when the item is dispatched.
    #[serde(default)]
    pub payload: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ItemFailure>,
    /// Root failed item that caused this item to be blocked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_by: Option<String>,
}

const fn default_status() -> ItemStatus {
    ItemStatus::Pending
}

impl QueueItem {
    pub fn new(item_id: impl Into<String>, issue_id: impl Into<String>) -> Self {
        Self {
            item_id: item_id.into(),
            issue_id: issue_id.into(),
            execution_group: String::new(),
            execution_order: 0,
            depends_on: Vec::new(),
            status: ItemStatus::Pending,
            payload: String::new(),
            failure: None,
            blocked_by: None,
        }
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.execution_group = group.into();
        self
    }

    #[must_use]
    pub const fn with_order(mut self, order: i64) -> Self {
        self.execution_order = order;
        self
    }

    #[must_use]
    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| (*d).to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Key identifying the logical thread of work this item belongs to.
    ///
    /// Items of the same issue and execution group share a session.
    pub fn resume_key(&self) -> String {
        format!("{}:{}", self.issue_id, self.execution_group)
    }
}

/// The persisted queue: a JSON array of items.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueSnapshot {
    pub items: Vec<QueueItem>,
}

impl QueueSnapshot {
    pub const fn new(items: Vec<QueueItem>) -> Self {
        Self { items }
    }

    /// Load a snapshot, rejecting duplicate item ids.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            Error::Queue(format!("Failed to read queue file {}: {}", path.display(), e))
        })?;
        let snapshot: Self = serde_json::from_str(&content).map_err(|e| {
            Error::Queue(format!("Failed to parse queue file {}: {}", path.display(), e))
        })?;

        let mut seen = std::collections::HashSet::new();
        for item in &snapshot.items {
            if !seen.insert(item.item_id.as_str()) {
                return Err(Error::Queue(format!("Duplicate item id '{}'", item.item_id)));
            }
        }
        Ok(snapshot)
    }

    /// Write the snapshot atomically (temp file in the same directory, then rename).
    pub fn save(&self, path: &Path) -> Result<()> {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let json = serde_json::to_string_pretty(self)?;
        let temp_file = NamedTempFile::new_in(parent)?;
        fs::write(temp_file.path(), json)?;
        temp_file.as_file().sync_all()?;
        temp_file.persist(path).map_err(|e| {
            Error::Queue(format!("Failed to replace queue file {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), items = self.items.len(), "Queue snapshot written");
        Ok(())
    }

    pub fn get(&self, item_id: &str) -> Option<&QueueItem> {
        self.items.iter().find(|i| i.item_id == item_id)
    }

    /// Count of items per status, in declaration order of [`ItemStatus`].
    pub fn counts(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for item in &self.items {
            counts.add(item.status);
        }
        counts
    }
}

/// Per-status item counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub ready: usize,
    pub executing: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
}

impl StatusCounts {
    pub const fn add(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Pending => self.pending += 1,
            ItemStatus::Ready => self.ready += 1,
            ItemStatus::Executing => self.executing += 1,
            ItemStatus::Completed => self.completed += 1,
            ItemStatus::Failed => self.failed += 1,
            ItemStatus::Blocked => self.blocked += 1,
        }
    }

    pub const fn total(&self) -> usize {
        self.pending + self.ready + self.executing + self.completed + self.failed + self.blocked
    }

    pub const fn settled(&self) -> usize {
        self.completed + self.failed + self.blocked
    }
}
