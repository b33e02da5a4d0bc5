//! PTY-backed session host.
//!
//! Each session is a long-lived interactive shell on a pseudo-terminal. A
//! dedicated reader thread records everything the shell prints into the
//! session's [`OutputBuffer`] and fans it out to live subscribers. Input goes
//! through an [`InputBatcher`], so dispatched commands and observer
//! keystrokes share one ordered write path.
//!
//! A dispatch writes the payload followed by a `printf` that reports `$?`
//! behind a per-dispatch token. The token only appears joined by `:` in the
//! printf output, never in the echoed command line, so the exit code can be
//! read back from the output stream.

use std::collections::HashMap;
use std::io::Read;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use cliq_core::config::SessionSettings;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{OwnedMutexGuard, broadcast, mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::buffer::{OutputBuffer, OutputCursor, Replay};
use super::host::SessionHost;
use super::input::InputBatcher;
use super::types::{
    DispatchOptions, Execution, ExecutionEvent, ExitReason, HostError, OutputChunk, SessionStatus,
};

const SENTINEL: &str = "__CLIQ_DONE__";
const READ_CHUNK_BYTES: usize = 4096;
const READER_THREAD_STACK_BYTES: usize = 64 * 1024;
const OUTPUT_BROADCAST_CAPACITY: usize = 512;
const EXECUTION_CHANNEL_CAPACITY: usize = 64;
const OPEN_PTY_ATTEMPTS: u32 = 5;

/// Settings for sessions spawned by [`PtySessionHost`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtySettings {
    pub shell: String,
    pub cwd: Option<PathBuf>,
    pub scrollback_limit: usize,
    pub input_flush_interval: Duration,
    pub cols: u16,
    pub rows: u16,
}

impl From<&SessionSettings> for PtySettings {
    fn from(settings: &SessionSettings) -> Self {
        Self {
            shell: settings.shell.clone(),
            cwd: None,
            scrollback_limit: settings.scrollback_limit,
            input_flush_interval: Duration::from_millis(settings.input_flush_interval_ms),
            cols: settings.cols,
            rows: settings.rows,
        }
    }
}

/// A live observer attachment: retained scrollback plus the live tail.
///
/// Output pushed after the replay was taken arrives on `live`; feed both
/// through one [`OutputCursor`] to drop any overlap.
#[derive(Debug)]
pub struct Attachment {
    pub replay: Replay,
    pub live: broadcast::Receiver<OutputChunk>,
}

struct PtySession {
    key: String,
    resume_key: String,
    status: Mutex<SessionStatus>,
    buffer: Mutex<OutputBuffer>,
    output: broadcast::Sender<OutputChunk>,
    exited: watch::Sender<bool>,
    input: InputBatcher,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    size: Mutex<(u16, u16)>,
    /// Held for the length of a dispatch so commands never interleave.
    turn: Arc<tokio::sync::Mutex<()>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PtySession {
    fn status(&self) -> SessionStatus {
        *lock(&self.status)
    }

    fn set_status(&self, status: SessionStatus) {
        let mut current = lock(&self.status);
        // A dead session stays dead.
        if *current != SessionStatus::Error {
            *current = status;
        }
    }

    fn record_output(&self, data: Vec<u8>) {
        let mut buffer = lock(&self.buffer);
        let chunk = buffer.push(data);
        let _ = self.output.send(chunk);
    }

    fn mark_exited(&self) {
        *lock(&self.status) = SessionStatus::Error;
        self.exited.send_replace(true);
    }

    fn attach(&self) -> Attachment {
        let buffer = lock(&self.buffer);
        let mut cursor = OutputCursor::default();
        Attachment {
            replay: buffer.since(&mut cursor),
            live: self.output.subscribe(),
        }
    }

    fn kill(&self) {
        if let Err(e) = lock(&self.killer).kill() {
            debug!(session_key = %self.key, error = %e, "Kill failed, session already gone");
        }
    }
}

/// [`SessionHost`] that runs every session in its own PTY shell.
pub struct PtySessionHost {
    settings: PtySettings,
    sessions: Mutex<HashMap<String, Arc<PtySession>>>,
    /// resume key -> session key
    resume_index: Mutex<HashMap<String, String>>,
}

impl PtySessionHost {
    pub fn new(settings: PtySettings) -> Self {
        Self {
            settings,
            sessions: Mutex::new(HashMap::new()),
            resume_index: Mutex::new(HashMap::new()),
        }
    }

    fn session(&self, session_key: &str) -> Result<Arc<PtySession>, HostError> {
        lock(&self.sessions)
            .get(session_key)
            .cloned()
            .ok_or_else(|| HostError::SessionNotFound {
                session_key: session_key.to_string(),
            })
    }

    /// Subscribe an observer to a session: replay, then live output.
    pub fn attach(&self, session_key: &str) -> Result<Attachment, HostError> {
        Ok(self.session(session_key)?.attach())
    }

    /// Queue raw observer input for a session.
    pub fn send_input(&self, session_key: &str, data: &[u8]) -> Result<(), HostError> {
        let session = self.session(session_key)?;
        if session.input.send(data.to_vec()) {
            Ok(())
        } else {
            Err(HostError::SessionTerminated {
                session_key: session_key.to_string(),
            })
        }
    }

    /// Kill every session process.
    pub fn shutdown(&self) {
        let sessions: Vec<Arc<PtySession>> = lock(&self.sessions).drain().map(|(_, s)| s).collect();
        lock(&self.resume_index).clear();
        for session in sessions {
            info!(session_key = %session.key, resume_key = %session.resume_key, "Closing session");
            session.kill();
        }
    }

    async fn spawn_session(&self, resume_key: &str) -> Result<Arc<PtySession>, HostError> {
        let settings = self.settings.clone();
        let spawn_failed = |reason: String| HostError::SpawnFailed {
            resume_key: resume_key.to_string(),
            reason,
        };

        let opened = tokio::task::spawn_blocking(move || open_shell(&settings))
            .await
            .map_err(|e| spawn_failed(e.to_string()))?
            .map_err(spawn_failed)?;

        let session_key = Uuid::new_v4().to_string();
        let (output, _) = broadcast::channel(OUTPUT_BROADCAST_CAPACITY);
        let (exited, _) = watch::channel(false);
        let session = Arc::new(PtySession {
            key: session_key.clone(),
            resume_key: resume_key.to_string(),
            status: Mutex::new(SessionStatus::Idle),
            buffer: Mutex::new(OutputBuffer::new(self.settings.scrollback_limit)),
            output,
            exited,
            input: InputBatcher::spawn(opened.writer, self.settings.input_flush_interval),
            master: Mutex::new(opened.master),
            killer: Mutex::new(opened.killer),
            size: Mutex::new((self.settings.cols, self.settings.rows)),
            turn: Arc::new(tokio::sync::Mutex::new(())),
        });

        let io_session = Arc::clone(&session);
        let mut reader = opened.reader;
        let mut child = opened.child;
        let spawned = thread::Builder::new()
            .name(format!("cliq-io-{session_key}"))
            .stack_size(READER_THREAD_STACK_BYTES)
            .spawn(move || {
                let mut buf = vec![0u8; READ_CHUNK_BYTES];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => io_session.record_output(buf[..n].to_vec()),
                    }
                }
                match child.wait() {
                    Ok(status) => info!(
                        session_key = %io_session.key,
                        exit_code = status.exit_code(),
                        "Session shell exited"
                    ),
                    Err(e) => warn!(session_key = %io_session.key, error = %e, "Failed to reap session shell"),
                }
                io_session.mark_exited();
            });
        if let Err(e) = spawned {
            session.kill();
            return Err(e.into());
        }

        info!(resume_key, session_key = %session_key, shell = %self.settings.shell, "Session spawned");
        Ok(session)
    }
}

impl Drop for PtySessionHost {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct OpenedShell {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
    killer: Box<dyn ChildKiller + Send + Sync>,
    reader: Box<dyn Read + Send>,
    writer: Box<dyn std::io::Write + Send>,
}

fn open_shell(settings: &PtySettings) -> Result<OpenedShell, String> {
    let pty_system = native_pty_system();
    let size = PtySize {
        rows: settings.rows,
        cols: settings.cols,
        pixel_width: 0,
        pixel_height: 0,
    };

    let mut pair = None;
    let mut last_err = None;
    for attempt in 0..OPEN_PTY_ATTEMPTS {
        match pty_system.openpty(size) {
            Ok(opened) => {
                pair = Some(opened);
                break;
            }
            Err(e) => {
                last_err = Some(e);
                if attempt + 1 < OPEN_PTY_ATTEMPTS {
                    thread::sleep(Duration::from_millis(20));
                }
            }
        }
    }
    let Some(pair) = pair else {
        return Err(format!(
            "failed to open PTY: {}",
            last_err.map_or_else(|| "unknown error".to_string(), |e| e.to_string())
        ));
    };
    if let Some(e) = last_err {
        debug!(error = %e, "PTY open succeeded after transient errors");
    }

    let mut cmd = CommandBuilder::new(&settings.shell);
    if let Some(cwd) = &settings.cwd {
        cmd.cwd(cwd);
    }
    cmd.env("TERM", "xterm-256color");

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| format!("failed to spawn {}: {e}", settings.shell))?;
    let killer = child.clone_killer();
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| format!("failed to clone PTY reader: {e}"))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| format!("failed to take PTY writer: {e}"))?;

    Ok(OpenedShell {
        master: pair.master,
        child,
        killer,
        reader,
        writer,
    })
}

impl SessionHost for PtySessionHost {
    async fn spawn_or_reuse_session(&self, resume_key: &str) -> Result<String, HostError> {
        let existing = lock(&self.resume_index).get(resume_key).cloned();
        if let Some(key) = existing
            && let Ok(session) = self.session(&key)
        {
            if session.status().is_usable() {
                return Ok(key);
            }
            lock(&self.sessions).remove(&key);
        }

        let session = self.spawn_session(resume_key).await?;
        let key = session.key.clone();
        lock(&self.sessions).insert(key.clone(), session);
        lock(&self.resume_index).insert(resume_key.to_string(), key.clone());
        Ok(key)
    }

    async fn dispatch(
        &self,
        session_key: &str,
        payload: &str,
        options: DispatchOptions,
    ) -> Result<Execution, HostError> {
        let session = self.session(session_key)?;
        if !session.status().is_usable() {
            return Err(HostError::SessionTerminated {
                session_key: session_key.to_string(),
            });
        }

        let turn = Arc::clone(&session.turn).lock_owned().await;
        let (tx, rx) = mpsc::channel(EXECUTION_CHANNEL_CAPACITY);
        tokio::spawn(run_dispatch(
            session,
            payload.to_string(),
            options,
            turn,
            tx,
        ));
        Ok(Execution {
            session_key: session_key.to_string(),
            events: rx,
        })
    }

    fn resize(&self, session_key: &str, cols: u16, rows: u16) {
        let Ok(session) = self.session(session_key) else {
            return;
        };
        let mut size = lock(&session.size);
        if *size == (cols, rows) {
            return;
        }
        let result = lock(&session.master).resize(PtySize {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        });
        match result {
            Ok(()) => {
                *size = (cols, rows);
                debug!(session_key, cols, rows, "Session resized");
            }
            Err(e) => warn!(session_key, error = %e, "Resize failed"),
        }
    }

    async fn fetch_buffer(&self, session_key: &str) -> Result<Vec<u8>, HostError> {
        let session = self.session(session_key)?;
        let contents = lock(&session.buffer).contents();
        Ok(contents)
    }

    async fn session_status(&self, session_key: &str) -> Option<SessionStatus> {
        self.session(session_key).ok().map(|s| s.status())
    }
}

/// Write one command, stream its output, and report how it ended.
async fn run_dispatch(
    session: Arc<PtySession>,
    payload: String,
    options: DispatchOptions,
    _turn: OwnedMutexGuard<()>,
    tx: mpsc::Sender<ExecutionEvent>,
) {
    let token = Uuid::new_v4().simple().to_string();
    let mut live = session.output.subscribe();
    let mut exited = session.exited.subscribe();
    let mut scanner = SentinelScanner::new(&token);

    session.set_status(SessionStatus::Active);
    let command = format!("{payload}\nprintf '\\n%s:%s:%d\\n' {SENTINEL} {token} $?\n");
    if !session.input.send(command) {
        session.mark_exited();
        let _ = tx
            .send(ExecutionEvent::Exit {
                code: -1,
                reason: ExitReason::SessionLost,
            })
            .await;
        return;
    }

    let wait = async {
        loop {
            tokio::select! {
                chunk = live.recv() => match chunk {
                    Ok(chunk) => {
                        let code = scanner.feed(&chunk.data);
                        let _ = tx.send(ExecutionEvent::Output(chunk)).await;
                        if let Some(code) = code {
                            return (code, ExitReason::Exited);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(session_key = %session.key, skipped, "Dispatch lagged behind session output");
                    }
                    Err(broadcast::error::RecvError::Closed) => return (-1, ExitReason::SessionLost),
                },
                () = shell_exited(&mut exited) => {
                    // Drain what the reader pushed before the shell went away.
                    while let Ok(chunk) = live.try_recv() {
                        let code = scanner.feed(&chunk.data);
                        let _ = tx.send(ExecutionEvent::Output(chunk)).await;
                        if let Some(code) = code {
                            return (code, ExitReason::Exited);
                        }
                    }
                    return (-1, ExitReason::SessionLost);
                }
            }
        }
    };

    let (code, reason) = match options.timeout {
        Some(limit) => match tokio::time::timeout(limit, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(session_key = %session.key, timeout = ?limit, "Dispatch timed out, interrupting");
                session.input.send(vec![0x03]);
                (-1, ExitReason::Timeout)
            }
        },
        None => wait.await,
    };

    if reason != ExitReason::SessionLost {
        session.set_status(SessionStatus::Idle);
    }
    debug!(session_key = %session.key, code, %reason, "Dispatch finished");
    let _ = tx.send(ExecutionEvent::Exit { code, reason }).await;
}

async fn shell_exited(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|done| *done).await;
}

/// Finds `__CLIQ_DONE__:<token>:<code>` in a byte stream split at arbitrary points.
#[derive(Debug)]
struct SentinelScanner {
    marker: Vec<u8>,
    window: Vec<u8>,
}

impl SentinelScanner {
    fn new(token: &str) -> Self {
        Self {
            marker: format!("{SENTINEL}:{token}:").into_bytes(),
            window: Vec::new(),
        }
    }

    /// Feed output; returns the exit code once a complete marker line is seen.
    fn feed(&mut self, data: &[u8]) -> Option<i32> {
        self.window.extend_from_slice(data);
        if let Some(start) = find(&self.window, &self.marker) {
            let rest = &self.window[start + self.marker.len()..];
            let end = rest.iter().position(|b| *b == b'\r' || *b == b'\n')?;
            let code = std::str::from_utf8(&rest[..end])
                .ok()
                .and_then(|s| s.trim().parse().ok())
                .unwrap_or(-1);
            self.window.clear();
            return Some(code);
        }
        // Keep just enough to match a marker split across chunks.
        let keep = self.marker.len().saturating_sub(1);
        if self.window.len() > keep {
            self.window.drain(..self.window.len() - keep);
        }
        None
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
