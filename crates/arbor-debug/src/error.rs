//! Debugger errors and interrupt signals.

use std::fmt;

use smol_str::SmolStr;
use thiserror::Error;

use crate::value::Value;

/// Usage errors reported synchronously to the debugging client.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DebugError {
    /// The session was closed.
    #[error("session closed")]
    SessionClosed,

    /// The breakpoint was disposed and can no longer be changed or installed.
    #[error("breakpoint disposed")]
    BreakpointDisposed,

    /// Mutation attempted through the read-only view of a global breakpoint.
    #[error("breakpoint is read-only in this session")]
    ReadOnlyBreakpoint,

    /// The breakpoint already belongs to another debugger or scope.
    #[error("breakpoint already installed")]
    AlreadyInstalled,

    /// The suspended event was accessed after its callback returned.
    #[error("not in a suspended state")]
    EventDisposed,

    /// A thread-confined accessor was used from a foreign thread.
    #[error("illegal thread access")]
    IllegalThreadAccess,

    /// A step was prepared after continue or kill had already been prepared.
    #[error("cannot prepare '{0}' after a terminal action")]
    StepAfterTerminal(SmolStr),

    /// Invalid argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(SmolStr),

    /// Invalid state for the requested operation.
    #[error("invalid state: {0}")]
    InvalidState(SmolStr),

    /// Guest evaluation failed.
    #[error("evaluation failed: {0}")]
    Evaluation(GuestError),

    /// Configuration error.
    #[error("invalid config '{0}'")]
    InvalidConfig(SmolStr),
}

impl DebugError {
    pub(crate) fn invalid_argument(message: impl Into<SmolStr>) -> Self {
        Self::InvalidArgument(message.into())
    }

    pub(crate) fn invalid_state(message: impl Into<SmolStr>) -> Self {
        Self::InvalidState(message.into())
    }
}

/// Failure raised by the guest language while parsing or evaluating code.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct GuestError {
    message: SmolStr,
    value: Option<Value>,
}

impl GuestError {
    #[must_use]
    pub fn new(message: impl Into<SmolStr>) -> Self {
        Self {
            message: message.into(),
            value: None,
        }
    }

    /// Guest error carrying the thrown guest value.
    #[must_use]
    pub fn with_value(message: impl Into<SmolStr>, value: Value) -> Self {
        Self {
            message: message.into(),
            value: Some(value),
        }
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }
}

/// Abrupt termination of the current guest call requested by the debugger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KillSignal {
    pub(crate) location: Option<SmolStr>,
}

impl KillSignal {
    pub const MESSAGE: &'static str = "Execution cancelled by a debugging session.";

    /// Description of the point where the kill was raised.
    #[must_use]
    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }
}

impl fmt::Display for KillSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(Self::MESSAGE)
    }
}

/// Unwind of guest frames up to a target frame which is then re-entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnwindSignal {
    pub(crate) depth: u32,
}

impl UnwindSignal {
    /// Index of the frame to re-enter, counted from the top frame.
    #[must_use]
    pub fn depth(self) -> u32 {
        self.depth
    }
}

/// Non-recoverable unwind signals raised from dispatch.
///
/// Hosts propagate an `Interrupt` through every guest frame. It is never
/// converted into a guest exception, so guest `catch` handlers never see it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Interrupt {
    /// Terminate the current top-level guest call.
    #[error("{0}")]
    Kill(KillSignal),
    /// Unwind to a frame and re-enter it.
    #[error("unwind to frame {}", .0.depth)]
    Unwind(UnwindSignal),
}

impl Interrupt {
    #[must_use]
    pub fn is_kill(&self) -> bool {
        matches!(self, Interrupt::Kill(_))
    }
}
