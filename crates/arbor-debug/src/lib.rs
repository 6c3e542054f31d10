//! `arbor-debug` - debugger core for tree-interpreted guest languages.
//!
//! The host runtime notifies the debugger's listener nodes at instrumented
//! syntax-tree points. Sessions decide whether the current thread suspends
//! (breakpoints, stepping, explicit suspension requests) and hand the client
//! a [`SuspendedEvent`] on the suspended thread.

#![forbid(unsafe_code)]
#![allow(clippy::module_name_repetitions)]

/// Breakpoints and their builders.
pub mod breakpoint;
/// Debugger configuration.
pub mod config;
/// Debugger instance and global breakpoints.
pub mod debugger;
/// Errors and interrupt signals.
pub mod error;
/// Suspended events.
pub mod event;
/// Suspension filters.
pub mod filter;
/// Stack frames of suspended threads.
pub mod frame;
/// In-memory host and toy guest language for tests.
pub mod harness;
/// Host runtime contracts.
pub mod host;
/// Debugger sessions.
pub mod session;
/// Source sections and element tags.
pub mod source;
mod stable;
/// Step configuration.
pub mod stepping;
/// Guest values.
pub mod value;

pub use breakpoint::{Breakpoint, BreakpointKind};
pub use config::DebuggerConfig;
pub use debugger::{BreakpointEvent, Debugger, DebuggerBuilder};
pub use error::{DebugError, GuestError, Interrupt, KillSignal, UnwindSignal};
pub use event::SuspendedEvent;
pub use filter::SuspensionFilter;
pub use frame::DebugStackFrame;
pub use session::DebuggerSession;
pub use source::{SourceElement, SourceSection, SuspendAnchor};
pub use stepping::StepConfig;
pub use value::{GuestException, Value};
