//! Interactive sessions: the host boundary, output scrollback, and input batching.
//!
//! The scheduler only talks to a [`SessionHost`]. [`PtySessionHost`] is the
//! real implementation; [`testing::ScriptedHost`] drives tests.

mod buffer;
mod host;
mod input;
mod pty;
pub mod testing;
mod types;

pub use buffer::{OutputBuffer, OutputCursor, Replay};
pub use host::SessionHost;
pub use input::{InputBatcher, InputSink};
pub use pty::{Attachment, PtySessionHost, PtySettings};
pub use types::{
    DispatchOptions, Execution, ExecutionEvent, ExitReason, HostError, OutputChunk, SessionStatus,
};
