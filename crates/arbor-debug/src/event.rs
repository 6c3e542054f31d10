//! The suspended-event handle given to session callbacks.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::ThreadId;

use parking_lot::Mutex;
use smol_str::SmolStr;

use crate::breakpoint::Breakpoint;
use crate::error::{DebugError, GuestError};
use crate::frame::DebugStackFrame;
use crate::host::{EventContext, HostFrame, NodeId};
use crate::session::DebuggerSession;
use crate::source::{SourceElement, SourceSection, SuspendAnchor, Tags};
use crate::stepping::{strategy, StepConfig, SteppingStrategy};
use crate::value::{GuestException, Value};

/// Copy of the suspended point that outlives the host notification.
#[derive(Debug, Clone)]
pub(crate) struct CapturedContext {
    node: NodeId,
    tags: Tags,
    section: Option<SourceSection>,
    internal: bool,
    language: Option<SmolStr>,
    initialized: bool,
}

impl CapturedContext {
    fn capture(context: &dyn EventContext) -> Self {
        Self {
            node: context.node_id(),
            tags: context.tags(),
            section: context.source_section().cloned(),
            internal: context.is_internal(),
            language: context.language().map(SmolStr::new),
            initialized: context.is_language_context_initialized(),
        }
    }
}

impl EventContext for CapturedContext {
    fn node_id(&self) -> NodeId {
        self.node
    }

    fn tags(&self) -> Tags {
        self.tags
    }

    fn source_section(&self) -> Option<&SourceSection> {
        self.section.as_ref()
    }

    fn is_internal(&self) -> bool {
        self.internal
    }

    fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    fn is_language_context_initialized(&self) -> bool {
        self.initialized
    }
}

pub(crate) struct EventData<'a> {
    pub(crate) session: DebuggerSession,
    pub(crate) thread: ThreadId,
    pub(crate) context: &'a dyn EventContext,
    pub(crate) anchor: SuspendAnchor,
    pub(crate) frames: Vec<Arc<dyn HostFrame>>,
    pub(crate) breakpoints: Vec<Breakpoint>,
    pub(crate) failures: Vec<(Breakpoint, GuestError)>,
    pub(crate) return_value: Option<Value>,
    pub(crate) exception: Option<Arc<GuestException>>,
}

#[derive(Default)]
struct Prepared {
    next: Option<SteppingStrategy>,
    return_value: Option<Value>,
    replaced: bool,
}

/// What the client decided during the suspension.
pub(crate) struct Outcome {
    pub(crate) next: Option<SteppingStrategy>,
    /// Replacement return value, if the client set one.
    pub(crate) return_value: Option<Value>,
}

struct Inner {
    session: DebuggerSession,
    thread: ThreadId,
    context: CapturedContext,
    anchor: SuspendAnchor,
    frames: Vec<Arc<dyn HostFrame>>,
    breakpoints: Vec<Breakpoint>,
    failures: Vec<(Breakpoint, GuestError)>,
    exception: Option<Arc<GuestException>>,
    disposed: AtomicBool,
    prepared: Mutex<Prepared>,
}

/// A guest thread suspended in a session.
///
/// The event is valid only while the session callback runs. Inspection is
/// confined to the suspended thread; `prepare_*` may be called from any
/// thread until the callback returns.
#[derive(Clone)]
pub struct SuspendedEvent {
    inner: Arc<Inner>,
}

impl SuspendedEvent {
    pub(crate) fn new(data: EventData<'_>) -> Self {
        Self {
            inner: Arc::new(Inner {
                session: data.session,
                thread: data.thread,
                context: CapturedContext::capture(data.context),
                anchor: data.anchor,
                frames: data.frames,
                breakpoints: data.breakpoints,
                failures: data.failures,
                exception: data.exception,
                disposed: AtomicBool::new(false),
                prepared: Mutex::new(Prepared {
                    return_value: data.return_value,
                    ..Prepared::default()
                }),
            }),
        }
    }

    pub(crate) fn breakpoint_count(&self) -> usize {
        self.inner.breakpoints.len()
    }

    /// Invalidate the event and hand back the client's decisions.
    pub(crate) fn dispose(&self) -> Outcome {
        self.inner.disposed.store(true, Ordering::Release);
        let mut prepared = self.inner.prepared.lock();
        let replaced = std::mem::take(&mut prepared.replaced);
        let value = prepared.return_value.take();
        Outcome {
            next: prepared.next.take(),
            return_value: if replaced { value } else { None },
        }
    }

    pub(crate) fn ptr_eq(&self, other: &SuspendedEvent) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check_valid(&self) -> Result<(), DebugError> {
        if self.is_disposed() {
            return Err(DebugError::EventDisposed);
        }
        Ok(())
    }

    pub(crate) fn check_access(&self) -> Result<(), DebugError> {
        self.check_valid()?;
        if std::thread::current().id() != self.inner.thread {
            return Err(DebugError::IllegalThreadAccess);
        }
        Ok(())
    }

    #[must_use]
    pub fn session(&self) -> &DebuggerSession {
        &self.inner.session
    }

    /// The suspended guest thread.
    #[must_use]
    pub fn thread(&self) -> ThreadId {
        self.inner.thread
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn suspend_anchor(&self) -> SuspendAnchor {
        self.inner.anchor
    }

    /// Breakpoints that fired at this point: session breakpoints first in
    /// install order, then global ones.
    #[must_use]
    pub fn breakpoints(&self) -> &[Breakpoint] {
        &self.inner.breakpoints
    }

    pub fn source_section(&self) -> Result<Option<SourceSection>, DebugError> {
        self.check_access()?;
        Ok(self.inner.context.section.clone())
    }

    /// Whether the suspended point is of `element`.
    pub fn has_source_element(&self, element: SourceElement) -> Result<bool, DebugError> {
        self.check_access()?;
        Ok(self.inner.context.has_tag(element.tag()))
    }

    /// Value the suspended node returned; only available after it.
    pub fn return_value(&self) -> Result<Option<Value>, DebugError> {
        self.check_access()?;
        if self.inner.anchor == SuspendAnchor::Before {
            return Ok(None);
        }
        Ok(self.inner.prepared.lock().return_value.clone())
    }

    /// Replace the value the suspended node returns.
    pub fn set_return_value(&self, value: Value) -> Result<(), DebugError> {
        self.check_access()?;
        if self.inner.anchor == SuspendAnchor::Before {
            return Err(DebugError::invalid_state(
                "return value can only be set after a node returned",
            ));
        }
        let mut prepared = self.inner.prepared.lock();
        prepared.return_value = Some(value);
        prepared.replaced = true;
        Ok(())
    }

    /// Exception the suspended node threw, for exception breakpoint hits.
    pub fn exception(&self) -> Result<Option<Arc<GuestException>>, DebugError> {
        self.check_access()?;
        Ok(self.inner.exception.clone())
    }

    /// Failure of the condition of `breakpoint`, which fires when its
    /// condition can not be evaluated.
    pub fn breakpoint_condition_exception(
        &self,
        breakpoint: &Breakpoint,
    ) -> Result<Option<GuestError>, DebugError> {
        self.check_access()?;
        Ok(self
            .inner
            .failures
            .iter()
            .find(|(failed, _)| failed == breakpoint)
            .map(|(_, error)| error.clone()))
    }

    /// Guest frames from the top down. Internal frames are hidden unless the
    /// session's stepping filter includes internal code.
    pub fn stack_frames(&self) -> Result<Vec<DebugStackFrame>, DebugError> {
        self.check_access()?;
        let include_internal = self.inner.session.stepping_filter().is_internal_included();
        Ok(self
            .inner
            .frames
            .iter()
            .enumerate()
            .filter(|(_, frame)| include_internal || !frame.is_internal())
            .map(|(depth, frame)| DebugStackFrame::new(self.clone(), frame.clone(), depth as u32))
            .collect())
    }

    pub fn top_stack_frame(&self) -> Result<DebugStackFrame, DebugError> {
        self.stack_frames()?
            .into_iter()
            .next()
            .ok_or_else(|| DebugError::invalid_state("no guest frame on the stack"))
    }

    fn prepare(&self, next: SteppingStrategy) -> Result<(), DebugError> {
        self.check_valid()?;
        let mut prepared = self.inner.prepared.lock();
        // `dispose` raises the flag before taking the lock.
        self.check_valid()?;
        strategy::prepare(&mut prepared.next, next)
    }

    /// Resume normally once the callback returns.
    pub fn prepare_continue(&self) -> Result<(), DebugError> {
        self.prepare(SteppingStrategy::proceed())
    }

    /// Step into calls, stopping at the next element.
    pub fn prepare_step_into(&self, config: StepConfig) -> Result<(), DebugError> {
        config.validate_for(self.inner.session.source_elements())?;
        self.prepare(SteppingStrategy::step_into(config))
    }

    /// Step to the next element in the current frame, skipping calls.
    pub fn prepare_step_over(&self, config: StepConfig) -> Result<(), DebugError> {
        config.validate_for(self.inner.session.source_elements())?;
        self.prepare(SteppingStrategy::step_over(config))
    }

    /// Run until the current frame returns.
    pub fn prepare_step_out(&self, config: StepConfig) -> Result<(), DebugError> {
        config.validate_for(self.inner.session.source_elements())?;
        self.prepare(SteppingStrategy::step_out(config))
    }

    /// Unwind the stack up to `frame` and re-enter it.
    pub fn prepare_unwind_frame(&self, frame: &DebugStackFrame) -> Result<(), DebugError> {
        if !frame.event().ptr_eq(self) {
            return Err(DebugError::invalid_argument(
                "frame belongs to a different suspension",
            ));
        }
        self.prepare(SteppingStrategy::unwind(frame.depth()))
    }

    /// Terminate the current guest call once the callback returns.
    pub fn prepare_kill(&self) -> Result<(), DebugError> {
        self.prepare(SteppingStrategy::kill())
    }

    pub(crate) fn is_kill_prepared(&self) -> bool {
        self.inner
            .prepared
            .lock()
            .next
            .as_ref()
            .is_some_and(SteppingStrategy::is_kill)
    }
}

impl fmt::Debug for SuspendedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspendedEvent")
            .field("session", &self.inner.session.id())
            .field("section", &self.inner.context.section)
            .field("anchor", &self.inner.anchor)
            .field("breakpoints", &self.inner.breakpoints.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl fmt::Display for SuspendedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Suspended(")?;
        match &self.inner.context.section {
            Some(section) => write!(f, "at {section}")?,
            None => write!(f, "at node {}", self.inner.context.node.0)?,
        }
        write!(f, ", {:?}", self.inner.anchor)?;
        if !self.inner.breakpoints.is_empty() {
            let ids: Vec<String> = self
                .inner
                .breakpoints
                .iter()
                .map(|breakpoint| format!("#{}", breakpoint.id()))
                .collect();
            write!(f, ", breakpoints=[{}]", ids.join(", "))?;
        }
        f.write_str(")")
    }
}
