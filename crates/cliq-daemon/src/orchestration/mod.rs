//! Queue orchestration: dependency graph, item store, session pool, and scheduler.
//!
//! - [`QueueGraph`]: validation, ready frontier, and blocked-item propagation.
//! - [`ItemStore`]: per-item compare-and-set over queue item status.
//! - [`SessionPool`]: resume-key to session bindings over a session host.
//! - [`Scheduler`]: the control loop that admits ready items under the
//!   concurrency budget and records their outcomes.

pub mod graph;
pub mod pool;
pub mod scheduler;
pub mod store;
pub mod types;

pub use graph::{GraphError, Progress, Propagation, QueueGraph};
pub use pool::{SessionBinding, SessionPool};
pub use scheduler::{Scheduler, SchedulerHandle};
pub use store::{ItemStore, ItemUpdate, SnapshotStore, StoreError};
pub use types::{
    ConfigUpdate, FaultKind, ItemStatusUpdate, SchedulerConfig, SchedulerError, SchedulerEvent,
    SchedulerFault, SchedulerState, SchedulerStatus,
};
