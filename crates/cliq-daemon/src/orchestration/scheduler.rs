//! Queue scheduler: a single control loop over the item store.
//!
//! The loop runs as one task that owns all scheduling state. Controller
//! calls and execution reports arrive as messages; after draining every
//! message that is already queued, the loop runs at most one admission
//! cycle. Admitted items execute on their own tasks: they acquire a session
//! through the [`SessionPool`], dispatch the payload, wait for the exit, and
//! report back. Session acquisition never runs inside the loop, so a slow
//! spawn cannot stall admission of other items.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use cliq_core::{FailureKind, ItemFailure, ItemStatus, QueueItem};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, trace, warn};

use super::graph::{Progress, QueueGraph};
use super::pool::{SessionBinding, SessionPool};
use super::store::{ItemStore, ItemUpdate, StoreError};
use super::types::{
    ConfigUpdate, EVENT_BROADCAST_CAPACITY, FaultKind, ItemStatusUpdate, SchedulerConfig,
    SchedulerError, SchedulerEvent, SchedulerFault, SchedulerState, SchedulerStatus,
};
use crate::session::{
    DispatchOptions, ExecutionEvent, ExitReason, HostError, OutputCursor, SessionHost,
};

/// Capacity of the controller command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

type Reply = oneshot::Sender<Result<(), SchedulerError>>;

enum Command {
    Start { reply: Reply },
    Pause { reply: Reply },
    Resume { reply: Reply },
    Stop { reply: Reply },
    UpdateConfig { update: ConfigUpdate, reply: Reply },
    RetryItem { item_id: String, reply: Reply },
}

/// Final result of one execution task.
#[derive(Debug)]
enum ItemOutcome {
    Completed,
    Failed(ItemFailure),
}

/// Reports from execution tasks.
enum Report {
    SessionBound {
        item_id: String,
        resume_key: String,
        session_key: String,
    },
    Finished {
        item_id: String,
        outcome: ItemOutcome,
    },
}

/// Cloneable handle to a running scheduler loop.
pub struct SchedulerHandle<H> {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SchedulerStatus>,
    events: broadcast::Sender<SchedulerEvent>,
    store: Arc<dyn ItemStore>,
    pool: Arc<SessionPool<H>>,
}

impl<H> Clone for SchedulerHandle<H> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            status: self.status.clone(),
            events: self.events.clone(),
            store: Arc::clone(&self.store),
            pool: Arc::clone(&self.pool),
        }
    }
}

/// Entry point: builds and spawns the scheduler loop.
pub struct Scheduler;

impl Scheduler {
    /// Validate the graph and config, fail items orphaned in `executing` by
    /// an earlier run, and spawn the control loop in the `idle` state.
    pub fn spawn<H: SessionHost>(
        store: Arc<dyn ItemStore>,
        pool: Arc<SessionPool<H>>,
        config: SchedulerConfig,
    ) -> Result<SchedulerHandle<H>, SchedulerError> {
        config.validate()?;
        QueueGraph::new(&store.snapshot()).validate()?;

        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(EVENT_BROADCAST_CAPACITY);

        let mut actor = Actor {
            store: Arc::clone(&store),
            pool: Arc::clone(&pool),
            config,
            state: SchedulerState::Idle,
            error: None,
            in_flight: HashSet::new(),
            arrival: HashMap::new(),
            next_arrival: 0,
            consecutive_spawn_failures: 0,
            events: events_tx.clone(),
            status: None,
            reports: reports_tx,
            last_progress: None,
        };
        actor.recover_orphans()?;

        let (status_tx, status_rx) = watch::channel(actor.snapshot_status());
        actor.status = Some(status_tx);
        tokio::spawn(actor.run(commands_rx, reports_rx));

        Ok(SchedulerHandle {
            commands: commands_tx,
            status: status_rx,
            events: events_tx,
            store,
            pool,
        })
    }
}

impl<H: SessionHost> SchedulerHandle<H> {
    async fn call(&self, build: impl FnOnce(Reply) -> Command) -> Result<(), SchedulerError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| SchedulerError::Closed)?;
        rx.await.map_err(|_| SchedulerError::Closed)?
    }

    /// Begin a run. Valid from `idle`, `completed` and `failed`.
    pub async fn start(&self) -> Result<(), SchedulerError> {
        self.call(|reply| Command::Start { reply }).await
    }

    /// Stop admitting new items. In-flight items run to completion.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.call(|reply| Command::Pause { reply }).await
    }

    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.call(|reply| Command::Resume { reply }).await
    }

    /// Finish the run once in-flight items drain. Nothing new is admitted.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        self.call(|reply| Command::Stop { reply }).await
    }

    /// Merge a partial config. Invalid values are rejected without effect.
    pub async fn update_config(&self, update: ConfigUpdate) -> Result<(), SchedulerError> {
        self.call(|reply| Command::UpdateConfig { update, reply })
            .await
    }

    /// Reset a `failed` item to `pending` so it can be admitted again.
    pub async fn retry_item(&self, item_id: &str) -> Result<(), SchedulerError> {
        let item_id = item_id.to_string();
        self.call(|reply| Command::RetryItem { item_id, reply })
            .await
    }

    pub fn status(&self) -> SchedulerStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.events.subscribe()
    }

    /// Status updates for one item, starting from the next change.
    pub fn item_status_stream(
        &self,
        item_id: &str,
    ) -> impl Stream<Item = ItemStatusUpdate> + Send + 'static {
        let item_id = item_id.to_string();
        BroadcastStream::new(self.events.subscribe()).filter_map(move |event| match event {
            Ok(SchedulerEvent::ItemStatus(update)) if update.item_id == item_id => Some(update),
            _ => None,
        })
    }

    pub fn items(&self) -> Vec<QueueItem> {
        self.store.snapshot()
    }

    pub fn item(&self, item_id: &str) -> Option<QueueItem> {
        self.store.get(item_id)
    }

    /// Current resume-key bindings.
    pub async fn session_pool(&self) -> std::collections::BTreeMap<String, SessionBinding> {
        self.pool.bindings().await
    }

    pub const fn pool(&self) -> &Arc<SessionPool<H>> {
        &self.pool
    }

    /// Wait until the run reaches `completed` or `failed`.
    pub async fn wait_finished(&self) -> Result<SchedulerStatus, SchedulerError> {
        let mut rx = self.status.clone();
        let status = rx
            .wait_for(|s| s.state.is_terminal())
            .await
            .map_err(|_| SchedulerError::Closed)?;
        Ok(status.clone())
    }
}

struct Actor<H> {
    store: Arc<dyn ItemStore>,
    pool: Arc<SessionPool<H>>,
    config: SchedulerConfig,
    state: SchedulerState,
    error: Option<SchedulerFault>,
    /// Items admitted by this loop whose execution has not reported back.
    in_flight: HashSet<String>,
    /// Order in which items entered `ready`, for tie-breaks.
    arrival: HashMap<String, u64>,
    next_arrival: u64,
    consecutive_spawn_failures: u32,
    events: broadcast::Sender<SchedulerEvent>,
    status: Option<watch::Sender<SchedulerStatus>>,
    reports: mpsc::UnboundedSender<Report>,
    last_progress: Option<Progress>,
}

impl<H: SessionHost> Actor<H> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<Command>,
        mut reports: mpsc::UnboundedReceiver<Report>,
    ) {
        let mut commands_open = true;
        loop {
            if !commands_open && self.in_flight.is_empty() {
                break;
            }

            let mut evaluate = tokio::select! {
                cmd = commands.recv(), if commands_open => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        commands_open = false;
                        continue;
                    }
                },
                Some(report) = reports.recv() => self.handle_report(report),
            };

            // Drain the batch, then run one admission cycle for all of it.
            while let Ok(report) = reports.try_recv() {
                evaluate |= self.handle_report(report);
            }
            while let Ok(cmd) = commands.try_recv() {
                evaluate |= self.handle_command(cmd);
            }

            if evaluate {
                self.admission_cycle();
            }
            self.maybe_finish();
            self.publish();
        }
        debug!("Scheduler loop exited");
    }

    fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::Start { reply } => {
                let result = if self.state.can_start() {
                    self.error = None;
                    self.consecutive_spawn_failures = 0;
                    self.set_state(SchedulerState::Running);
                    Ok(())
                } else {
                    Err(self.invalid("start"))
                };
                respond(reply, result)
            }
            Command::Pause { reply } => {
                let result = if self.state == SchedulerState::Running {
                    self.set_state(SchedulerState::Paused);
                    Ok(())
                } else {
                    Err(self.invalid("pause"))
                };
                let _ = reply.send(result);
                false
            }
            Command::Resume { reply } => {
                let result = if self.state == SchedulerState::Paused {
                    self.set_state(SchedulerState::Running);
                    Ok(())
                } else {
                    Err(self.invalid("resume"))
                };
                respond(reply, result)
            }
            Command::Stop { reply } => {
                let result = if matches!(
                    self.state,
                    SchedulerState::Running | SchedulerState::Paused
                ) {
                    self.set_state(SchedulerState::Stopping);
                    Ok(())
                } else {
                    Err(self.invalid("stop"))
                };
                let _ = reply.send(result);
                false
            }
            Command::UpdateConfig { update, reply } => match self.config.merged(&update) {
                Ok(next) => {
                    let grew = next.max_concurrent_sessions > self.config.max_concurrent_sessions;
                    info!(
                        max_concurrent_sessions = next.max_concurrent_sessions,
                        "Scheduler config updated"
                    );
                    self.config = next;
                    let _ = reply.send(Ok(()));
                    grew
                }
                Err(e) => {
                    warn!(error = %e, "Rejected config update");
                    let _ = reply.send(Err(e));
                    false
                }
            },
            Command::RetryItem { item_id, reply } => {
                let result = self.retry(&item_id);
                respond(reply, result)
            }
        }
    }

    fn handle_report(&mut self, report: Report) -> bool {
        match report {
            Report::SessionBound {
                item_id,
                resume_key,
                session_key,
            } => {
                self.consecutive_spawn_failures = 0;
                self.emit(SchedulerEvent::SessionBound {
                    item_id,
                    resume_key,
                    session_key,
                });
                false
            }
            Report::Finished { item_id, outcome } => {
                self.in_flight.remove(&item_id);
                let update = match outcome {
                    ItemOutcome::Completed => {
                        info!(item_id = %item_id, "Item completed");
                        ItemUpdate::status(ItemStatus::Completed)
                    }
                    ItemOutcome::Failed(failure) => {
                        warn!(item_id = %item_id, kind = %failure.kind, message = %failure.message, "Item failed");
                        if failure.kind == FailureKind::SessionUnavailable {
                            self.consecutive_spawn_failures += 1;
                        }
                        ItemUpdate::failed(failure)
                    }
                };
                self.transition(&item_id, ItemStatus::Executing, update);
                self.propagate();
                self.promote_ready();

                if self.consecutive_spawn_failures >= self.config.max_consecutive_spawn_failures
                    && !self.state.is_terminal()
                {
                    self.fault(
                        FaultKind::SessionPoolExhausted,
                        format!(
                            "{} consecutive items could not acquire a session",
                            self.consecutive_spawn_failures
                        ),
                        Some(item_id),
                    );
                }
                true
            }
        }
    }

    fn retry(&mut self, item_id: &str) -> Result<(), SchedulerError> {
        let item = self
            .store
            .get(item_id)
            .ok_or_else(|| SchedulerError::ItemNotFound {
                item_id: item_id.to_string(),
            })?;
        if item.status != ItemStatus::Failed {
            return Err(SchedulerError::InvalidItemState {
                item_id: item_id.to_string(),
                status: item.status,
            });
        }
        if !self.store.compare_and_set(
            item_id,
            ItemStatus::Failed,
            ItemUpdate::status(ItemStatus::Pending),
        )? {
            return Err(SchedulerError::InvalidItemState {
                item_id: item_id.to_string(),
                status: self.store.get(item_id).map_or(item.status, |i| i.status),
            });
        }
        info!(item_id, "Item reset for retry");
        self.arrival.remove(item_id);
        self.emit_item(item_id);
        self.propagate();
        Ok(())
    }

    /// One admission cycle. Only admits while `running`.
    fn admission_cycle(&mut self) {
        if self.state != SchedulerState::Running {
            return;
        }
        self.propagate();
        self.promote_ready();
        if self.state != SchedulerState::Running {
            return;
        }

        let items = self.store.snapshot();
        let mut current = items
            .iter()
            .filter(|i| i.status == ItemStatus::Executing)
            .count();
        let max = self.config.max_concurrent_sessions;
        if current >= max {
            debug!(current, max, "Concurrency budget exhausted");
            return;
        }

        let mut candidates: Vec<&QueueItem> = items
            .iter()
            .filter(|i| i.status == ItemStatus::Ready)
            .collect();
        for item in &candidates {
            if !self.arrival.contains_key(&item.item_id) {
                self.arrival.insert(item.item_id.clone(), self.next_arrival);
                self.next_arrival += 1;
            }
        }
        candidates.sort_by_key(|i| {
            (
                i.execution_order,
                self.arrival.get(&i.item_id).copied().unwrap_or(u64::MAX),
            )
        });

        for item in candidates {
            if current >= max || self.state != SchedulerState::Running {
                break;
            }
            if !self.transition(
                &item.item_id,
                ItemStatus::Ready,
                ItemUpdate::status(ItemStatus::Executing),
            ) {
                continue;
            }
            current += 1;
            self.arrival.remove(&item.item_id);
            debug!(item_id = %item.item_id, order = item.execution_order, current, max, "Item admitted");
            self.dispatch(item.clone());
        }
    }

    fn dispatch(&mut self, item: QueueItem) {
        self.in_flight.insert(item.item_id.clone());
        let reporter = Reporter {
            tx: self.reports.clone(),
            item_id: item.item_id.clone(),
            done: false,
        };
        let options = DispatchOptions {
            timeout: self.config.item_timeout,
        };
        tokio::spawn(execute(Arc::clone(&self.pool), item, options, reporter));
    }

    /// Move pending items whose dependencies have completed to `ready`,
    /// stamping arrival order. Runs while paused too, so completions seen
    /// during a pause keep their order for `resume()`.
    fn promote_ready(&mut self) {
        if !matches!(self.state, SchedulerState::Running | SchedulerState::Paused) {
            return;
        }
        let items = self.store.snapshot();
        let promoted: Vec<String> = QueueGraph::new(&items)
            .ready_items()
            .into_iter()
            .map(|i| i.item_id.clone())
            .collect();
        for item_id in promoted {
            if self.transition(&item_id, ItemStatus::Pending, ItemUpdate::status(ItemStatus::Ready))
            {
                self.mark_arrival(&item_id);
            }
        }
    }

    fn mark_arrival(&mut self, item_id: &str) {
        self.arrival.insert(item_id.to_string(), self.next_arrival);
        self.next_arrival += 1;
    }

    /// Apply blocking and recovery until the graph is stable.
    fn propagate(&mut self) {
        loop {
            let items = self.store.snapshot();
            let propagation = QueueGraph::new(&items).propagate_blocked();
            if propagation.is_empty() {
                return;
            }
            let mut changed = false;
            for (item_id, root) in propagation.block {
                let Some(current) = items.iter().find(|i| i.item_id == item_id) else {
                    continue;
                };
                if self.transition(&item_id, current.status, ItemUpdate::blocked(root)) {
                    self.arrival.remove(&item_id);
                    changed = true;
                }
            }
            for item_id in propagation.recover {
                if self.transition(&item_id, ItemStatus::Blocked, ItemUpdate::status(ItemStatus::Ready))
                {
                    info!(item_id = %item_id, "Blocked item recovered");
                    self.mark_arrival(&item_id);
                    changed = true;
                }
            }
            if !changed {
                return;
            }
        }
    }

    /// CAS one item and announce it. Store errors halt the run.
    fn transition(&mut self, item_id: &str, expected: ItemStatus, update: ItemUpdate) -> bool {
        match self.store.compare_and_set(item_id, expected, update) {
            Ok(true) => {
                self.emit_item(item_id);
                true
            }
            Ok(false) => false,
            Err(e) => {
                self.store_fault(item_id, &e);
                false
            }
        }
    }

    fn store_fault(&mut self, item_id: &str, e: &StoreError) {
        if self.error.is_none() {
            self.fault(
                FaultKind::StoreUnavailable,
                e.to_string(),
                Some(item_id.to_string()),
            );
        }
    }

    fn fault(&mut self, kind: FaultKind, message: String, item_id: Option<String>) {
        error!(kind = ?kind, message = %message, item_id = ?item_id, "Scheduler fault");
        self.error = Some(SchedulerFault {
            kind,
            message,
            item_id,
        });
        self.set_state(SchedulerState::Failed);
    }

    /// Finish a run whose items have all settled, or a stop whose in-flight
    /// items have drained.
    fn maybe_finish(&mut self) {
        if !self.in_flight.is_empty() {
            return;
        }
        let items = self.store.snapshot();
        let done = match self.state {
            SchedulerState::Running => QueueGraph::new(&items).progress().is_done(),
            SchedulerState::Stopping => true,
            _ => false,
        };
        if !done {
            return;
        }
        let any_failed = items.iter().any(|i| i.status == ItemStatus::Failed);
        self.set_state(if any_failed {
            SchedulerState::Failed
        } else {
            SchedulerState::Completed
        });
    }

    fn recover_orphans(&mut self) -> Result<(), SchedulerError> {
        let orphans: Vec<String> = self
            .store
            .snapshot()
            .into_iter()
            .filter(|i| i.status == ItemStatus::Executing)
            .map(|i| i.item_id)
            .collect();
        for item_id in orphans {
            warn!(item_id = %item_id, "Failing item interrupted by an earlier run");
            self.store.compare_and_set(
                &item_id,
                ItemStatus::Executing,
                ItemUpdate::failed(ItemFailure::new(
                    FailureKind::Interrupted,
                    "item was executing when the previous run ended",
                )),
            )?;
        }
        self.propagate();
        Ok(())
    }

    fn set_state(&mut self, state: SchedulerState) {
        if self.state == state {
            return;
        }
        info!(from = %self.state, to = %state, "Scheduler state changed");
        self.state = state;
        self.emit(SchedulerEvent::StateChanged {
            state,
            error: self.error.clone(),
        });
        // Callers awaiting a control reply must observe the new state.
        self.publish();
    }

    fn invalid(&self, operation: &'static str) -> SchedulerError {
        SchedulerError::InvalidTransition {
            from: self.state,
            operation,
        }
    }

    fn emit(&self, event: SchedulerEvent) {
        let _ = self.events.send(event);
    }

    fn emit_item(&self, item_id: &str) {
        if let Some(item) = self.store.get(item_id) {
            trace!(item_id, status = %item.status, "Item status changed");
            self.emit(SchedulerEvent::ItemStatus(ItemStatusUpdate {
                item_id: item.item_id,
                status: item.status,
                failure: item.failure,
                blocked_by: item.blocked_by,
            }));
        }
    }

    fn snapshot_status(&self) -> SchedulerStatus {
        let items = self.store.snapshot();
        SchedulerStatus {
            state: self.state,
            progress: QueueGraph::new(&items).progress(),
            error: self.error.clone(),
            running: items
                .iter()
                .filter(|i| i.status == ItemStatus::Executing)
                .count(),
            max_concurrent_sessions: self.config.max_concurrent_sessions,
        }
    }

    fn publish(&mut self) {
        let status = self.snapshot_status();
        if self.last_progress != Some(status.progress) {
            self.last_progress = Some(status.progress);
            self.emit(SchedulerEvent::Progress(status.progress));
        }
        if let Some(tx) = &self.status {
            tx.send_if_modified(|current| {
                if *current == status {
                    false
                } else {
                    *current = status;
                    true
                }
            });
        }
    }
}

/// Send a command reply; `true` when it succeeded and admission should run.
fn respond(reply: Reply, result: Result<(), SchedulerError>) -> bool {
    let ok = result.is_ok();
    let _ = reply.send(result);
    ok
}

/// Reports an execution's result exactly once, even if the task unwinds.
struct Reporter {
    tx: mpsc::UnboundedSender<Report>,
    item_id: String,
    done: bool,
}

impl Reporter {
    fn bound(&self, resume_key: &str, session_key: &str) {
        let _ = self.tx.send(Report::SessionBound {
            item_id: self.item_id.clone(),
            resume_key: resume_key.to_string(),
            session_key: session_key.to_string(),
        });
    }

    fn finish(mut self, outcome: ItemOutcome) {
        self.done = true;
        let _ = self.tx.send(Report::Finished {
            item_id: self.item_id.clone(),
            outcome,
        });
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.tx.send(Report::Finished {
                item_id: self.item_id.clone(),
                outcome: ItemOutcome::Failed(ItemFailure::new(
                    FailureKind::Interrupted,
                    "execution task ended without reporting",
                )),
            });
        }
    }
}

/// Acquire a session, run the item, and report how it ended.
async fn execute<H: SessionHost>(
    pool: Arc<SessionPool<H>>,
    item: QueueItem,
    options: DispatchOptions,
    reporter: Reporter,
) {
    let resume_key = item.resume_key();
    let item_id = item.item_id.as_str();

    let session_key = match pool.acquire(&resume_key).await {
        Ok(key) => key,
        Err(e) => {
            reporter.finish(ItemOutcome::Failed(ItemFailure::new(
                FailureKind::SessionUnavailable,
                e.to_string(),
            )));
            return;
        }
    };
    reporter.bound(&resume_key, &session_key);

    let mut execution = match pool
        .host()
        .dispatch(&session_key, &item.payload, options)
        .await
    {
        Ok(execution) => execution,
        Err(e) => {
            if matches!(
                e,
                HostError::SessionTerminated { .. } | HostError::SessionNotFound { .. }
            ) {
                pool.evict(&resume_key).await;
            }
            reporter.finish(ItemOutcome::Failed(ItemFailure::new(
                FailureKind::SessionUnavailable,
                e.to_string(),
            )));
            return;
        }
    };

    let mut cursor = OutputCursor::default();
    let mut exit = None;
    while let Some(event) = execution.events.recv().await {
        match event {
            ExecutionEvent::Output(chunk) => {
                if cursor.advance(&chunk) {
                    trace!(item_id, session_key = %session_key, bytes = chunk.data.len(), "Session output");
                }
            }
            ExecutionEvent::Exit { code, reason } => {
                exit = Some((code, reason));
                break;
            }
        }
    }

    let outcome = match exit {
        Some((0, ExitReason::Exited)) => ItemOutcome::Completed,
        Some((code, ExitReason::Exited)) => ItemOutcome::Failed(ItemFailure::new(
            FailureKind::Execution,
            format!("command exited with code {code}"),
        )),
        Some((_, ExitReason::Timeout)) => ItemOutcome::Failed(ItemFailure::new(
            FailureKind::Timeout,
            "command did not finish before the item timeout",
        )),
        Some((_, ExitReason::SessionLost)) | None => {
            pool.evict(&resume_key).await;
            ItemOutcome::Failed(ItemFailure::new(
                FailureKind::Execution,
                "session terminated before the command finished",
            ))
        }
    };
    pool.release(&resume_key).await;
    reporter.finish(outcome);
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::orchestration::store::SnapshotStore;
    use crate::session::testing::{Outcome, ScriptedHost};
    use cliq_core::QueueSnapshot;
    use std::time::Duration;

    fn item(id: &str, order: i64, deps: &[&str]) -> QueueItem {
        QueueItem::new(id, format!("issue-{id}"))
            .with_order(order)
            .with_deps(deps)
            .with_payload(id)
    }

    fn setup(
        items: Vec<QueueItem>,
        max: usize,
    ) -> (Arc<ScriptedHost>, SchedulerHandle<ScriptedHost>) {
        let host = Arc::new(ScriptedHost::new());
        let pool = Arc::new(SessionPool::new(Arc::clone(&host)));
        let store: Arc<dyn ItemStore> = Arc::new(SnapshotStore::new(QueueSnapshot::new(items)));
        let config = SchedulerConfig {
            max_concurrent_sessions: max,
            ..SchedulerConfig::default()
        };
        let handle = Scheduler::spawn(store, pool, config).unwrap();
        (host, handle)
    }

    async fn finished(handle: &SchedulerHandle<ScriptedHost>) -> SchedulerStatus {
        tokio::time::timeout(Duration::from_secs(5), handle.wait_finished())
            .await
            .expect("run should finish")
            .unwrap()
    }

    async fn wait_status(handle: &SchedulerHandle<ScriptedHost>, item_id: &str, status: ItemStatus) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while handle.item(item_id).map(|i| i.status) != Some(status) {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("item should reach status");
    }

    #[tokio::test]
    async fn starts_idle() {
        let (_host, handle) = setup(vec![item("a", 0, &[])], 1);
        assert_eq!(handle.status().state, SchedulerState::Idle);
        assert_eq!(handle.item("a").unwrap().status, ItemStatus::Pending);
    }

    #[tokio::test]
    async fn empty_queue_completes_immediately() {
        let (_host, handle) = setup(vec![], 1);
        handle.start().await.unwrap();
        let status = finished(&handle).await;
        assert_eq!(status.state, SchedulerState::Completed);
        assert!(status.progress.is_done());
    }

    #[tokio::test]
    async fn rejects_invalid_graph() {
        let host = Arc::new(ScriptedHost::new());
        let pool = Arc::new(SessionPool::new(host));
        let store: Arc<dyn ItemStore> = Arc::new(SnapshotStore::new(QueueSnapshot::new(vec![
            item("a", 0, &["b"]),
            item("b", 0, &["a"]),
        ])));
        let err = Scheduler::spawn(store, pool, SchedulerConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, SchedulerError::Graph(_)));
    }

    #[tokio::test]
    async fn invalid_operations_are_rejected() {
        let (_host, handle) = setup(vec![item("a", 0, &[])], 1);
        assert!(matches!(
            handle.pause().await,
            Err(SchedulerError::InvalidTransition { operation: "pause", .. })
        ));
        assert!(handle.resume().await.is_err());
        assert!(handle.stop().await.is_err());
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (host, handle) = setup(vec![item("a", 0, &[])], 1);
        let gate = host.hold("a");
        handle.start().await.unwrap();
        assert!(matches!(
            handle.start().await,
            Err(SchedulerError::InvalidTransition { from: SchedulerState::Running, .. })
        ));
        gate.open();
        finished(&handle).await;
    }

    #[tokio::test]
    async fn config_update_validated_synchronously() {
        let (_host, handle) = setup(vec![], 1);
        let err = handle
            .update_config(ConfigUpdate::concurrency(0))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidConfig { .. }));
        assert_eq!(handle.status().max_concurrent_sessions, 1);
    }

    #[tokio::test]
    async fn orphaned_executing_items_fail_as_interrupted() {
        let mut orphan = item("a", 0, &[]);
        orphan.status = ItemStatus::Executing;
        let (_host, handle) = setup(vec![orphan, item("b", 0, &["a"])], 1);

        let a = handle.item("a").unwrap();
        assert_eq!(a.status, ItemStatus::Failed);
        assert_eq!(a.failure.unwrap().kind, FailureKind::Interrupted);
        assert_eq!(handle.item("b").unwrap().status, ItemStatus::Blocked);
    }

    #[tokio::test]
    async fn timeout_is_an_item_failure() {
        let (host, handle) = setup(vec![item("a", 0, &[]), item("b", 1, &[])], 1);
        host.set_outcome("a", Outcome::Timeout);
        handle.start().await.unwrap();
        let status = finished(&handle).await;

        assert_eq!(status.state, SchedulerState::Failed);
        assert!(status.error.is_none());
        assert_eq!(
            handle.item("a").unwrap().failure.unwrap().kind,
            FailureKind::Timeout
        );
        assert_eq!(handle.item("b").unwrap().status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn session_unavailable_marks_item_and_frees_slot() {
        let (host, handle) = setup(vec![item("a", 0, &[]), item("b", 1, &[])], 1);
        host.fail_next_spawn("issue-a:");
        handle.start().await.unwrap();
        finished(&handle).await;

        let a = handle.item("a").unwrap();
        assert_eq!(a.status, ItemStatus::Failed);
        assert_eq!(a.failure.unwrap().kind, FailureKind::SessionUnavailable);
        assert_eq!(handle.item("b").unwrap().status, ItemStatus::Completed);
        assert!(handle.session_pool().await.get("issue-a:").is_none());
    }

    #[tokio::test]
    async fn repeated_spawn_failures_fault_the_scheduler() {
        let items = (0..5).map(|i| item(&format!("i{i}"), i, &[])).collect();
        let (host, handle) = setup(items, 1);
        host.fail_all_spawns(true);
        handle.start().await.unwrap();
        let status = finished(&handle).await;

        assert_eq!(status.state, SchedulerState::Failed);
        let fault = status.error.unwrap();
        assert_eq!(fault.kind, FaultKind::SessionPoolExhausted);
        // Remaining items are left alone for inspection.
        let counts = QueueSnapshot::new(handle.items()).counts();
        assert_eq!(counts.failed, 3);
        assert_eq!(counts.failed + counts.ready + counts.pending, 5);

        // An explicit start clears the fault and resumes the queue.
        host.fail_all_spawns(false);
        handle.start().await.unwrap();
        let status = finished(&handle).await;
        assert!(status.error.is_none());
        assert_eq!(QueueSnapshot::new(handle.items()).counts().completed, 2);
    }

    #[tokio::test]
    async fn retry_recovers_blocked_dependents() {
        let (host, handle) = setup(vec![item("a", 0, &[]), item("b", 1, &["a"])], 1);
        host.set_outcome("a", Outcome::Exit(3));
        handle.start().await.unwrap();
        finished(&handle).await;
        assert_eq!(handle.item("b").unwrap().status, ItemStatus::Blocked);
        assert_eq!(handle.item("b").unwrap().blocked_by.as_deref(), Some("a"));

        host.set_outcome("a", Outcome::Exit(0));
        handle.retry_item("a").await.unwrap();
        assert_eq!(handle.item("a").unwrap().status, ItemStatus::Pending);
        assert_eq!(handle.item("b").unwrap().status, ItemStatus::Blocked);

        handle.start().await.unwrap();
        let status = finished(&handle).await;
        assert_eq!(status.state, SchedulerState::Completed);
        assert_eq!(handle.item("b").unwrap().status, ItemStatus::Completed);
    }

    #[tokio::test]
    async fn retry_requires_failed_item() {
        let (_host, handle) = setup(vec![item("a", 0, &[])], 1);
        assert!(matches!(
            handle.retry_item("a").await,
            Err(SchedulerError::InvalidItemState { .. })
        ));
        assert!(matches!(
            handle.retry_item("nope").await,
            Err(SchedulerError::ItemNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn stop_finishes_after_in_flight_drains() {
        let (host, handle) = setup(vec![item("a", 0, &[]), item("b", 1, &[])], 1);
        let gate = host.hold("a");
        handle.start().await.unwrap();
        wait_status(&handle, "a", ItemStatus::Executing).await;

        handle.stop().await.unwrap();
        assert_eq!(handle.status().state, SchedulerState::Stopping);
        assert!(handle.start().await.is_err());

        gate.open();
        let status = finished(&handle).await;
        assert_eq!(status.state, SchedulerState::Completed);
        assert_eq!(handle.item("a").unwrap().status, ItemStatus::Completed);
        assert_eq!(handle.item("b").unwrap().status, ItemStatus::Ready);
    }

    #[tokio::test]
    async fn item_status_stream_follows_one_item() {
        let (_host, handle) = setup(vec![item("a", 0, &[]), item("b", 1, &[])], 1);
        let stream = handle.item_status_stream("b");
        tokio::pin!(stream);
        handle.start().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(Some(update)) =
            tokio::time::timeout(Duration::from_secs(5), stream.next()).await
        {
            assert_eq!(update.item_id, "b");
            seen.push(update.status);
            if update.status == ItemStatus::Completed {
                break;
            }
        }
        assert_eq!(
            seen,
            vec![ItemStatus::Ready, ItemStatus::Executing, ItemStatus::Completed]
        );
    }

    #[tokio::test]
    async fn events_announce_state_and_binding() {
        let (_host, handle) = setup(vec![item("a", 0, &[])], 1);
        let mut rx = handle.subscribe();
        handle.start().await.unwrap();
        finished(&handle).await;

        let mut saw_running = false;
        let mut saw_bound = false;
        let mut saw_done = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SchedulerEvent::StateChanged { state: SchedulerState::Running, .. } => {
                    saw_running = true;
                }
                SchedulerEvent::SessionBound { item_id, .. } => saw_bound = item_id == "a",
                SchedulerEvent::Progress(p) => saw_done |= p.is_done(),
                _ => {}
            }
        }
        assert!(saw_running && saw_bound && saw_done);
    }
}
