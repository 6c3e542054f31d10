//! Contracts between the debugger and the host runtime.
//!
//! The host instrumentation framework owns the syntax trees and calls the
//! debugger's listeners at instrumented points. The guest language supplies
//! expression evaluation. Everything here is implemented outside the crate
//! (the `harness` module carries an in-memory reference host).

use std::fmt;
use std::sync::Arc;

use smol_str::SmolStr;

use crate::error::{GuestError, Interrupt};
use crate::source::{LoadedSource, SourceSection, Tags};
use crate::value::{GuestException, Value};

/// Identity of an instrumented syntax-tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u64);

/// Handle to a listener attachment made through an [`Instrumenter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BindingId(pub u64);

/// The instrumented point currently executing.
pub trait EventContext: Send + Sync {
    fn node_id(&self) -> NodeId;

    fn tags(&self) -> Tags;

    fn has_tag(&self, tag: Tags) -> bool {
        self.tags().intersects(tag)
    }

    fn source_section(&self) -> Option<&SourceSection>;

    /// Internal code is hidden from stepping unless a session includes it.
    fn is_internal(&self) -> bool {
        false
    }

    fn language(&self) -> Option<&str> {
        None
    }

    fn is_language_context_initialized(&self) -> bool {
        true
    }
}

/// Predicate deciding whether a try block handles an exception.
pub type CatchPredicate = Arc<dyn Fn(&GuestException) -> bool + Send + Sync>;

/// A try block structurally enclosing the current position of a frame.
#[derive(Clone)]
pub struct TryBlock {
    pub section: Option<SourceSection>,
    /// Guest-level `catches` test. A try block without one catches everything.
    pub catches: Option<CatchPredicate>,
}

impl TryBlock {
    #[must_use]
    pub fn catch_all(section: Option<SourceSection>) -> Self {
        Self {
            section,
            catches: None,
        }
    }

    #[must_use]
    pub fn catching(section: Option<SourceSection>, catches: CatchPredicate) -> Self {
        Self {
            section,
            catches: Some(catches),
        }
    }
}

impl fmt::Debug for TryBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TryBlock")
            .field("section", &self.section)
            .field("filtered", &self.catches.is_some())
            .finish()
    }
}

/// A materialized guest call frame.
pub trait HostFrame: Send + Sync {
    fn name(&self) -> Option<SmolStr>;

    /// Section currently executing in this frame.
    fn source_section(&self) -> Option<SourceSection>;

    fn read_local(&self, name: &str) -> Option<Value>;

    fn is_internal(&self) -> bool {
        false
    }

    /// Try blocks enclosing the frame's current position, innermost first.
    fn enclosing_try_blocks(&self) -> Vec<TryBlock> {
        Vec::new()
    }
}

/// The guest call stack of the current thread.
pub trait CallStack: Send + Sync {
    /// Frames ordered from the top (current) frame down to the outermost.
    fn frames(&self) -> Vec<Arc<dyn HostFrame>>;
}

/// Everything a listener receives about the current point.
#[derive(Clone, Copy)]
pub struct ExecutionPoint<'a> {
    pub context: &'a dyn EventContext,
    pub stack: &'a dyn CallStack,
}

impl<'a> ExecutionPoint<'a> {
    #[must_use]
    pub fn new(context: &'a dyn EventContext, stack: &'a dyn CallStack) -> Self {
        Self { context, stack }
    }

    pub(crate) fn top_frame(&self) -> Option<Arc<dyn HostFrame>> {
        self.stack.frames().into_iter().next()
    }

    pub(crate) fn describe(&self) -> String {
        match self.context.source_section() {
            Some(section) => section.to_string(),
            None => format!("node {}", self.context.node_id().0),
        }
    }
}

/// What the host does once an unwinding frame was notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindAction {
    /// Keep unwinding.
    Continue,
    /// Stop unwinding and re-enter this frame.
    Reenter,
}

/// Listener invoked by the host at instrumented points.
///
/// `on_enter` is dispatched in binding lookup order, return events in the
/// reverse order. An `Err(Interrupt)` must propagate through every guest
/// frame without reaching guest exception handlers.
pub trait ExecutionEventListener: Send + Sync {
    fn on_enter(&self, point: ExecutionPoint<'_>) -> Result<(), Interrupt>;

    /// Returns a replacement return value, if any.
    fn on_return_value(
        &self,
        point: ExecutionPoint<'_>,
        value: &Value,
    ) -> Result<Option<Value>, Interrupt>;

    fn on_return_exceptional(
        &self,
        point: ExecutionPoint<'_>,
        exception: &Arc<GuestException>,
    ) -> Result<(), Interrupt>;

    fn on_unwind(&self, _point: ExecutionPoint<'_>) -> Result<UnwindAction, Interrupt> {
        Ok(UnwindAction::Continue)
    }
}

/// Listener notified whenever the host loads a source.
pub trait SourceListener: Send + Sync {
    fn on_source_loaded(&self, source: &LoadedSource);
}

/// Selects the points an execution listener is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    pub tags: Tags,
    pub section: Option<SourceSection>,
    pub include_internal: bool,
}

impl EventFilter {
    #[must_use]
    pub fn tags(tags: Tags) -> Self {
        Self {
            tags,
            section: None,
            include_internal: false,
        }
    }

    #[must_use]
    pub fn at_section(section: SourceSection, tags: Tags) -> Self {
        Self {
            tags,
            section: Some(section),
            include_internal: false,
        }
    }

    #[must_use]
    pub fn include_internal(mut self, include: bool) -> Self {
        self.include_internal = include;
        self
    }

    #[must_use]
    pub fn includes(&self, context: &dyn EventContext) -> bool {
        if !context.tags().intersects(self.tags) {
            return false;
        }
        if context.is_internal() && !self.include_internal {
            return false;
        }
        match &self.section {
            Some(section) => context.source_section() == Some(section),
            None => true,
        }
    }
}

/// The host instrumentation framework.
pub trait Instrumenter: Send + Sync {
    fn attach_execution_listener(
        &self,
        filter: EventFilter,
        listener: Arc<dyn ExecutionEventListener>,
    ) -> BindingId;

    /// Attach a load listener; with `notify_loaded` already loaded sources
    /// are replayed before this returns.
    fn attach_source_listener(
        &self,
        listener: Arc<dyn SourceListener>,
        notify_loaded: bool,
    ) -> BindingId;

    fn detach(&self, binding: BindingId);

    /// Bindings among `candidates` attached at `context`, in the order the
    /// host dispatches `on_enter` to them.
    fn lookup(&self, context: &dyn EventContext, candidates: &[BindingId]) -> Vec<BindingId>;
}

/// A parsed guest expression.
pub trait CompiledExpression: Send + Sync {
    fn evaluate(&self, frame: &dyn HostFrame) -> Result<Value, GuestError>;
}

/// The guest-language evaluation service.
pub trait LanguageEvaluator: Send + Sync {
    /// Parse `code` in the lexical context of `context`.
    fn parse(
        &self,
        context: Option<&dyn EventContext>,
        code: &str,
    ) -> Result<Arc<dyn CompiledExpression>, GuestError>;
}
