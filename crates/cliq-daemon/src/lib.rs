//! Cliq daemon library
//!
//! Runs a dependency-ordered queue of commands inside long-lived
//! interactive sessions:
//! - Dependency graph, item store, and scheduler control loop
//! - Session pool keyed by resume key
//! - PTY session host with scrollback and batched input

pub mod orchestration;
pub mod session;
