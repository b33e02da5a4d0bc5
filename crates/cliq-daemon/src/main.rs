//! Cliq
//!
//! Runs a queue file of dependent commands inside long-lived shell sessions,
//! or checks a queue file without running it.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use cliq_core::QueueSnapshot;
use cliq_core::config::load_config;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use cliq_daemon::orchestration::{
    ItemStore, QueueGraph, Scheduler, SchedulerConfig, SchedulerEvent, SchedulerHandle,
    SchedulerState, SchedulerStatus, SessionPool, SnapshotStore,
};
use cliq_daemon::session::{PtySessionHost, PtySettings};

#[derive(Parser, Debug)]
#[command(name = "cliq")]
#[command(version, about = "Dependency-ordered command queue over shell sessions")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every item in a queue file.
    Run(RunArgs),
    /// Validate a queue file and show what would run first.
    Check {
        /// Queue file (JSON array of items)
        #[arg(long, env = "CLIQ_QUEUE")]
        queue: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Queue file (JSON array of items). Status changes are written back to it.
    #[arg(long, env = "CLIQ_QUEUE")]
    queue: PathBuf,

    /// Maximum number of items executing at once
    #[arg(long)]
    max_concurrent: Option<usize>,

    /// Per-item timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Shell to run sessions in
    #[arg(long)]
    shell: Option<String>,

    /// Project directory: sessions start here and `.cliq/settings.json` is read from it
    #[arg(long, env = "CLIQ_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "CLIQ_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON.
    #[arg(long, env = "CLIQ_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => run(args).await,
        Command::Check { queue } => check(&queue),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let log_filter = format!("cliq_daemon={0},cliq_core={0}", args.log_level);
    cliq_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let project_dir = match args.project_dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };
    let mut config = load_config(Some(&project_dir))?;
    if let Some(max) = args.max_concurrent {
        config.scheduler.max_concurrent_sessions = max;
    }
    if let Some(secs) = args.timeout {
        config.scheduler.item_timeout_secs = Some(secs);
    }
    if let Some(shell) = args.shell {
        config.session.shell = shell;
    }
    let problems = config.validate();
    if !problems.is_empty() {
        anyhow::bail!("Invalid configuration: {}", problems.join("; "));
    }

    let snapshot = QueueSnapshot::load(&args.queue)
        .with_context(|| format!("Failed to load queue {}", args.queue.display()))?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        queue = %args.queue.display(),
        items = snapshot.items.len(),
        max_concurrent_sessions = config.scheduler.max_concurrent_sessions,
        shell = %config.session.shell,
        "Starting cliq"
    );

    let store: Arc<dyn ItemStore> =
        Arc::new(SnapshotStore::new(snapshot).with_persistence(args.queue.clone()));
    let mut settings = PtySettings::from(&config.session);
    settings.cwd = Some(project_dir);
    let host = Arc::new(PtySessionHost::new(settings));
    let pool = Arc::new(SessionPool::new(Arc::clone(&host)));
    let scheduler = Scheduler::spawn(
        store,
        pool,
        SchedulerConfig::from(&config.scheduler),
    )?;

    let log_task = tokio::spawn(log_events(scheduler.subscribe()));
    scheduler.start().await?;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    let status = tokio::select! {
        status = scheduler.wait_finished() => status?,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, draining in-flight items");
            stop_and_wait(&scheduler).await?
        }
        _ = sigterm_future => {
            info!("Received SIGTERM, draining in-flight items");
            stop_and_wait(&scheduler).await?
        }
    };

    host.shutdown();
    log_task.abort();

    let counts = QueueSnapshot::new(scheduler.items()).counts();
    info!(
        state = %status.state,
        completed = counts.completed,
        failed = counts.failed,
        blocked = counts.blocked,
        remaining = counts.pending + counts.ready,
        "Queue run finished"
    );
    if let Some(fault) = &status.error {
        anyhow::bail!("Scheduler halted: {}", fault.message);
    }
    if status.state == SchedulerState::Failed {
        anyhow::bail!("{} item(s) failed", counts.failed);
    }
    Ok(())
}

async fn stop_and_wait(
    scheduler: &SchedulerHandle<PtySessionHost>,
) -> anyhow::Result<SchedulerStatus> {
    if let Err(e) = scheduler.stop().await {
        warn!(error = %e, "Stop rejected");
    }
    // A second signal while draining exits immediately.
    tokio::select! {
        status = scheduler.wait_finished() => Ok(status?),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted while draining");
            Ok(scheduler.status())
        }
    }
}

async fn log_events(mut rx: broadcast::Receiver<SchedulerEvent>) {
    loop {
        match rx.recv().await {
            Ok(SchedulerEvent::ItemStatus(update)) => match &update.failure {
                Some(failure) => warn!(
                    item_id = %update.item_id,
                    status = %update.status,
                    kind = %failure.kind,
                    message = %failure.message,
                    "Item status"
                ),
                None => info!(
                    item_id = %update.item_id,
                    status = %update.status,
                    blocked_by = ?update.blocked_by,
                    "Item status"
                ),
            },
            Ok(SchedulerEvent::SessionBound {
                item_id,
                resume_key,
                session_key,
            }) => info!(
                item_id = %item_id,
                resume_key = %resume_key,
                session_key = %session_key,
                "Session bound"
            ),
            Ok(SchedulerEvent::Progress(progress)) => info!(
                settled = progress.settled,
                total = progress.total,
                percent = progress.percent,
                "Progress"
            ),
            Ok(SchedulerEvent::StateChanged { state, error: Some(fault) }) => {
                error!(state = %state, kind = ?fault.kind, message = %fault.message, "Scheduler state");
            }
            Ok(SchedulerEvent::StateChanged { .. }) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[allow(clippy::print_stdout)]
fn check(queue: &Path) -> anyhow::Result<()> {
    let snapshot = QueueSnapshot::load(queue)
        .with_context(|| format!("Failed to load queue {}", queue.display()))?;
    let graph = QueueGraph::new(&snapshot.items);
    graph.validate()?;

    let counts = snapshot.counts();
    let progress = graph.progress();
    println!(
        "{} items: {} pending, {} ready, {} executing, {} completed, {} failed, {} blocked ({:.0}% settled)",
        counts.total(),
        counts.pending,
        counts.ready,
        counts.executing,
        counts.completed,
        counts.failed,
        counts.blocked,
        progress.percent,
    );
    for (group, items) in graph.groups() {
        let label = if group.is_empty() { "(none)" } else { group };
        println!("group {label}: {}", items.join(", "));
    }
    let ready = graph.ready_items();
    if ready.is_empty() {
        println!("nothing ready to run");
    }
    for item in ready {
        println!(
            "ready: {} (order {}, resume key {})",
            item.item_id,
            item.execution_order,
            item.resume_key()
        );
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parses_run_flags() {
        let cli = Cli::try_parse_from([
            "cliq",
            "run",
            "--queue",
            "q.json",
            "--max-concurrent",
            "4",
            "--timeout",
            "30",
        ])
        .unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.queue, PathBuf::from("q.json"));
        assert_eq!(args.max_concurrent, Some(4));
        assert_eq!(args.timeout, Some(30));
    }

    #[test]
    fn check_accepts_valid_queue() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(
            &path,
            r#"[{"item_id":"a","issue_id":"i"},{"item_id":"b","issue_id":"i","depends_on":["a"]}]"#,
        )
        .unwrap();
        check(&path).unwrap();
    }

    #[test]
    fn check_rejects_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(
            &path,
            r#"[{"item_id":"a","issue_id":"i","depends_on":["b"]},{"item_id":"b","issue_id":"i","depends_on":["a"]}]"#,
        )
        .unwrap();
        assert!(check(&path).is_err());
    }
}
