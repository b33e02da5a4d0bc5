//! The process-owning collaborator behind every session.

use std::future::Future;

use super::types::{DispatchOptions, Execution, HostError, SessionStatus};

/// Spawns and owns interactive sessions.
///
/// The scheduler and the session pool only ever refer to sessions by key;
/// buffers and processes stay with the host.
pub trait SessionHost: Send + Sync + 'static {
    /// Return a live session for `resume_key`, spawning one if needed.
    fn spawn_or_reuse_session(
        &self,
        resume_key: &str,
    ) -> impl Future<Output = Result<String, HostError>> + Send;

    /// Run `payload` in the session and subscribe to its output and exit.
    fn dispatch(
        &self,
        session_key: &str,
        payload: &str,
        options: DispatchOptions,
    ) -> impl Future<Output = Result<Execution, HostError>> + Send;

    /// Fire-and-forget resize. Repeated sizes are harmless; the last one wins.
    fn resize(&self, session_key: &str, cols: u16, rows: u16);

    /// Scrollback for replay to a newly attached observer.
    fn fetch_buffer(
        &self,
        session_key: &str,
    ) -> impl Future<Output = Result<Vec<u8>, HostError>> + Send;

    /// Current lifecycle status, or `None` if the host no longer knows the key.
    fn session_status(
        &self,
        session_key: &str,
    ) -> impl Future<Output = Option<SessionStatus>> + Send;
}
