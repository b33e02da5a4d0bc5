//! Scripted session host for scheduler and pool tests.
//!
//! Dispatches are keyed by payload: each payload can be told how to exit,
//! held on a gate until released, or made to poison its session. Every spawn
//! and dispatch is recorded, and the host tracks how many executions were in
//! flight at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch};

use super::host::SessionHost;
use super::types::{
    DispatchOptions, Execution, ExecutionEvent, ExitReason, HostError, OutputChunk, SessionStatus,
};

/// How a scripted dispatch ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Exit(i32),
    Timeout,
    SessionLost,
}

/// Holds a dispatch until opened.
#[derive(Debug, Clone)]
pub struct Gate {
    tx: Arc<watch::Sender<bool>>,
}

impl Gate {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn open(&self) {
        self.tx.send_replace(true);
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }
}

#[derive(Default)]
struct State {
    next_session: usize,
    sessions: HashMap<String, SessionStatus>,
    spawns: Vec<(String, String)>,
    dispatches: Vec<(String, String)>,
    outcomes: HashMap<String, Outcome>,
    gates: HashMap<String, Gate>,
    poison: HashSet<String>,
    spawn_failures: VecDeque<String>,
    fail_all_spawns: bool,
    resizes: Vec<(String, u16, u16)>,
    buffers: HashMap<String, Vec<u8>>,
    chunks: HashMap<String, u64>,
}

/// In-memory [`SessionHost`] driven by a script.
#[derive(Clone, Default)]
pub struct ScriptedHost {
    state: Arc<Mutex<State>>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    spawn_delay: Option<Duration>,
}

impl ScriptedHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every spawn, to model a slow process start.
    #[must_use]
    pub const fn with_spawn_delay(mut self, delay: Duration) -> Self {
        self.spawn_delay = Some(delay);
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Script how the dispatch of `payload` ends. Unscripted payloads exit 0.
    pub fn set_outcome(&self, payload: &str, outcome: Outcome) {
        self.lock().outcomes.insert(payload.to_string(), outcome);
    }

    /// Hold dispatches of `payload` until the returned gate is opened.
    pub fn hold(&self, payload: &str) -> Gate {
        let gate = Gate::new();
        self.lock().gates.insert(payload.to_string(), gate.clone());
        gate
    }

    /// Put the session into `error` once `payload` finishes.
    pub fn poison_session_after(&self, payload: &str) {
        self.lock().poison.insert(payload.to_string());
    }

    /// Fail the next spawn for `resume_key`.
    pub fn fail_next_spawn(&self, resume_key: &str) {
        self.lock().spawn_failures.push_back(resume_key.to_string());
    }

    pub fn fail_all_spawns(&self, fail: bool) {
        self.lock().fail_all_spawns = fail;
    }

    pub fn set_session_status(&self, session_key: &str, status: SessionStatus) {
        self.lock().sessions.insert(session_key.to_string(), status);
    }

    /// `(resume_key, session_key)` for every successful spawn.
    pub fn spawns(&self) -> Vec<(String, String)> {
        self.lock().spawns.clone()
    }

    /// `(session_key, payload)` in dispatch order.
    pub fn dispatches(&self) -> Vec<(String, String)> {
        self.lock().dispatches.clone()
    }

    pub fn dispatched_payloads(&self) -> Vec<String> {
        self.lock()
            .dispatches
            .iter()
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn resizes(&self) -> Vec<(String, u16, u16)> {
        self.lock().resizes.clone()
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// Highest number of executions in flight at once.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

impl SessionHost for ScriptedHost {
    async fn spawn_or_reuse_session(&self, resume_key: &str) -> Result<String, HostError> {
        if let Some(delay) = self.spawn_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        let scripted = state.spawn_failures.iter().position(|k| k == resume_key);
        if let Some(pos) = scripted {
            state.spawn_failures.remove(pos);
        }
        if state.fail_all_spawns || scripted.is_some() {
            return Err(HostError::SpawnFailed {
                resume_key: resume_key.to_string(),
                reason: "scripted spawn failure".to_string(),
            });
        }
        state.next_session += 1;
        let session_key = format!("s{}", state.next_session);
        state
            .sessions
            .insert(session_key.clone(), SessionStatus::Idle);
        state
            .spawns
            .push((resume_key.to_string(), session_key.clone()));
        drop(state);
        Ok(session_key)
    }

    async fn dispatch(
        &self,
        session_key: &str,
        payload: &str,
        _options: DispatchOptions,
    ) -> Result<Execution, HostError> {
        let (outcome, gate, poison) = {
            let mut state = self.lock();
            match state.sessions.get(session_key) {
                None => {
                    return Err(HostError::SessionNotFound {
                        session_key: session_key.to_string(),
                    });
                }
                Some(SessionStatus::Error) => {
                    return Err(HostError::SessionTerminated {
                        session_key: session_key.to_string(),
                    });
                }
                Some(_) => {}
            }
            state
                .sessions
                .insert(session_key.to_string(), SessionStatus::Active);
            state
                .dispatches
                .push((session_key.to_string(), payload.to_string()));
            (
                state
                    .outcomes
                    .get(payload)
                    .copied()
                    .unwrap_or(Outcome::Exit(0)),
                state.gates.get(payload).cloned(),
                state.poison.contains(payload),
            )
        };

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        let (tx, rx) = mpsc::channel(16);
        let host = self.clone();
        let key = session_key.to_string();
        let output = format!("{payload}\n").into_bytes();
        tokio::spawn(async move {
            if let Some(gate) = gate {
                gate.wait().await;
            }
            let index = {
                let mut state = host.lock();
                state
                    .buffers
                    .entry(key.clone())
                    .or_default()
                    .extend_from_slice(&output);
                let next = state.chunks.entry(key.clone()).or_default();
                let index = *next;
                *next += 1;
                index
            };
            let _ = tx
                .send(ExecutionEvent::Output(OutputChunk {
                    index,
                    data: output,
                }))
                .await;

            {
                let mut state = host.lock();
                let status = if poison || outcome == Outcome::SessionLost {
                    SessionStatus::Error
                } else {
                    SessionStatus::Idle
                };
                state.sessions.insert(key, status);
            }
            host.running.fetch_sub(1, Ordering::SeqCst);

            let exit = match outcome {
                Outcome::Exit(code) => ExecutionEvent::Exit {
                    code,
                    reason: ExitReason::Exited,
                },
                Outcome::Timeout => ExecutionEvent::Exit {
                    code: -1,
                    reason: ExitReason::Timeout,
                },
                Outcome::SessionLost => ExecutionEvent::Exit {
                    code: -1,
                    reason: ExitReason::SessionLost,
                },
            };
            let _ = tx.send(exit).await;
        });

        Ok(Execution {
            session_key: session_key.to_string(),
            events: rx,
        })
    }

    fn resize(&self, session_key: &str, cols: u16, rows: u16) {
        self.lock()
            .resizes
            .push((session_key.to_string(), cols, rows));
    }

    async fn fetch_buffer(&self, session_key: &str) -> Result<Vec<u8>, HostError> {
        let state = self.lock();
        if !state.sessions.contains_key(session_key) {
            return Err(HostError::SessionNotFound {
                session_key: session_key.to_string(),
            });
        }
        Ok(state.buffers.get(session_key).cloned().unwrap_or_default())
    }

    async fn session_status(&self, session_key: &str) -> Option<SessionStatus> {
        self.lock().sessions.get(session_key).copied()
    }
}
