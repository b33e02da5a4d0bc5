//! `cliq` Core Library
//!
//! Shared functionality for `cliq` components:
//! - Queue item model and snapshot persistence
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod error;
pub mod queue;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
pub use queue::{FailureKind, ItemFailure, ItemStatus, QueueItem, QueueSnapshot};
