//! Session types shared by hosts, the pool, and the scheduler.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

/// Lifecycle status of an interactive session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Running a dispatched command.
    Active,
    /// Alive, waiting for work.
    Idle,
    Paused,
    /// The underlying process is gone or unusable.
    Error,
    /// Being reattached after a restart.
    Resuming,
}

impl SessionStatus {
    /// Whether a session in this status can still accept work.
    pub const fn is_usable(self) -> bool {
        !matches!(self, Self::Error)
    }
}

/// One chunk of session output with its absolute position in the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub index: u64,
    pub data: Vec<u8>,
}

/// How a dispatched command ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitReason {
    /// The command finished and reported its exit code.
    Exited,
    /// The per-item timeout elapsed first.
    Timeout,
    /// The session died before the command reported back.
    SessionLost,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Exited => "exited",
            Self::Timeout => "timeout",
            Self::SessionLost => "session-lost",
        })
    }
}

/// Event on an execution subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionEvent {
    Output(OutputChunk),
    Exit { code: i32, reason: ExitReason },
}

/// Subscription to one dispatched command.
///
/// Yields output chunks in order, then exactly one `Exit`.
#[derive(Debug)]
pub struct Execution {
    pub session_key: String,
    pub events: mpsc::Receiver<ExecutionEvent>,
}

/// Options passed through to a dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchOptions {
    pub timeout: Option<Duration>,
}

/// Errors from a session host.
#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("Failed to spawn session for {resume_key}: {reason}")]
    SpawnFailed { resume_key: String, reason: String },

    #[error("Session not found: {session_key}")]
    SessionNotFound { session_key: String },

    #[error("Session terminated: {session_key}")]
    SessionTerminated { session_key: String },

    #[error("Session I/O error: {0}")]
    Io(#[from] std::io::Error),
}
