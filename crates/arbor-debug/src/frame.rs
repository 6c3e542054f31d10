//! Stack frames of a suspended thread.

use std::fmt;
use std::sync::Arc;

use smol_str::SmolStr;

use crate::error::{DebugError, GuestError, KillSignal};
use crate::event::SuspendedEvent;
use crate::host::HostFrame;
use crate::session::SuspensionGuard;
use crate::source::SourceSection;
use crate::value::Value;

/// A guest frame, valid while its suspended event is.
#[derive(Clone)]
pub struct DebugStackFrame {
    event: SuspendedEvent,
    frame: Arc<dyn HostFrame>,
    depth: u32,
}

impl DebugStackFrame {
    pub(crate) fn new(event: SuspendedEvent, frame: Arc<dyn HostFrame>, depth: u32) -> Self {
        Self {
            event,
            frame,
            depth,
        }
    }

    pub(crate) fn event(&self) -> &SuspendedEvent {
        &self.event
    }

    /// Position on the stack; 0 is the top frame.
    #[must_use]
    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn name(&self) -> Result<Option<SmolStr>, DebugError> {
        self.event.check_access()?;
        Ok(self.frame.name())
    }

    pub fn source_section(&self) -> Result<Option<SourceSection>, DebugError> {
        self.event.check_access()?;
        Ok(self.frame.source_section())
    }

    pub fn is_internal(&self) -> Result<bool, DebugError> {
        self.event.check_access()?;
        Ok(self.frame.is_internal())
    }

    /// Read a local variable of the frame.
    pub fn local(&self, name: &str) -> Result<Option<Value>, DebugError> {
        self.event.check_access()?;
        Ok(self.frame.read_local(name))
    }

    /// Evaluate guest code in the lexical scope of this frame.
    ///
    /// Breakpoints and steps do not suspend while the code runs.
    pub fn eval(&self, code: &str) -> Result<Value, DebugError> {
        self.event.check_access()?;
        if self.event.is_kill_prepared() {
            return Err(DebugError::Evaluation(GuestError::new(KillSignal::MESSAGE)));
        }
        let session = self.event.session();
        let Some(evaluator) = session.shared().debugger().evaluator() else {
            return Err(DebugError::invalid_state("no language evaluator"));
        };
        let expression = evaluator.parse(None, code).map_err(DebugError::Evaluation)?;
        let sessions = [session.shared().clone()];
        let _guard = SuspensionGuard::new(&sessions, std::thread::current().id());
        expression
            .evaluate(self.frame.as_ref())
            .map_err(DebugError::Evaluation)
    }
}

impl fmt::Debug for DebugStackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugStackFrame")
            .field("name", &self.frame.name())
            .field("depth", &self.depth)
            .finish()
    }
}
