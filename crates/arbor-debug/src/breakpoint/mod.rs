//! Breakpoints: location, exception and halt-instruction rules.
//!
//! A [`Breakpoint`] is a cheap handle over shared state. One host binding is
//! attached per breakpoint while at least one session has it installed, and
//! the attached [`node::BreakpointNode`] notifies every such session.

mod builder;
mod condition;
mod exception;
pub(crate) mod node;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::ThreadId;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smol_str::SmolStr;
use tracing::{debug, trace};

use crate::debugger::DebuggerShared;
use crate::error::{DebugError, GuestError};
use crate::host::{BindingId, EventFilter, ExecutionPoint, Instrumenter, NodeId};
use crate::session::{Phase, SessionShared};
use crate::source::{resolve_location, LoadedSource, SourceElement, SourceSection, SuspendAnchor, Tags};
use crate::value::GuestException;

pub use builder::{BreakpointBuilder, ExceptionBreakpointBuilder, ResolveListener};
use condition::Condition;
use exception::ExceptionFilter;
use node::{BreakpointNode, SourceResolver};

/// Breakpoint category; sessions can deactivate each kind separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BreakpointKind {
    /// Guest `debugger` statements.
    HaltInstruction,
    SourceLocation,
    Exception,
}

impl BreakpointKind {
    pub const ALL: [BreakpointKind; 3] = [
        BreakpointKind::HaltInstruction,
        BreakpointKind::SourceLocation,
        BreakpointKind::Exception,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            BreakpointKind::HaltInstruction => 0,
            BreakpointKind::SourceLocation => 1,
            BreakpointKind::Exception => 2,
        }
    }
}

#[derive(Debug)]
enum Locator {
    Line {
        uri: SmolStr,
        line: u32,
        column: Option<u32>,
    },
    Section(SourceSection),
    Exception(ExceptionFilter),
    AlwaysHalt,
}

#[derive(Default)]
struct InstallState {
    debugger: Option<Weak<DebuggerShared>>,
    instrumenter: Option<Arc<dyn Instrumenter>>,
    sessions: Vec<Weak<SessionShared>>,
    attached: bool,
    generation: u64,
    source_binding: Option<BindingId>,
    execution_binding: Option<BindingId>,
    resolved_section: Option<SourceSection>,
}

pub(crate) struct BreakpointShared {
    id: u64,
    kind: BreakpointKind,
    locator: Locator,
    anchor: SuspendAnchor,
    elements: Vec<SourceElement>,
    one_shot: bool,
    resolve_listener: Option<ResolveListener>,
    enabled: AtomicBool,
    resolved: AtomicBool,
    disposed: AtomicBool,
    global: AtomicBool,
    hit_count: AtomicU32,
    ignore_count: AtomicU32,
    condition: Condition,
    state: Mutex<InstallState>,
    visits: Mutex<FxHashMap<ThreadId, Visit>>,
}

static NEXT_BREAKPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a breakpoint.
///
/// Handles compare by identity. Global breakpoints are handed to sessions as
/// read-only views which reject every mutation.
#[derive(Clone)]
pub struct Breakpoint {
    shared: Arc<BreakpointShared>,
    read_only: bool,
}

impl Breakpoint {
    /// Start a line breakpoint in the source identified by `uri`.
    #[must_use]
    pub fn builder(uri: impl Into<SmolStr>) -> BreakpointBuilder {
        BreakpointBuilder::new(uri.into())
    }

    /// Start a breakpoint bound to exactly `section`.
    #[must_use]
    pub fn builder_for_section(section: SourceSection) -> BreakpointBuilder {
        BreakpointBuilder::new(section.uri.clone()).section_is(section)
    }

    /// Start an exception breakpoint matching caught and/or uncaught throws.
    #[must_use]
    pub fn exception_builder(caught: bool, uncaught: bool) -> ExceptionBreakpointBuilder {
        ExceptionBreakpointBuilder::new(caught, uncaught)
    }

    pub(crate) fn always_halt() -> Self {
        Self::create(
            BreakpointKind::HaltInstruction,
            Locator::AlwaysHalt,
            Settings::default(),
        )
    }

    fn create(kind: BreakpointKind, locator: Locator, settings: Settings) -> Self {
        let shared = BreakpointShared {
            id: NEXT_BREAKPOINT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            locator,
            anchor: settings.anchor,
            elements: settings.elements,
            one_shot: settings.one_shot,
            resolve_listener: settings.resolve_listener,
            enabled: AtomicBool::new(true),
            resolved: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            global: AtomicBool::new(false),
            hit_count: AtomicU32::new(0),
            ignore_count: AtomicU32::new(settings.ignore_count),
            condition: Condition::new(settings.condition),
            state: Mutex::new(InstallState::default()),
            visits: Mutex::new(FxHashMap::default()),
        };
        Self {
            shared: Arc::new(shared),
            read_only: false,
        }
    }

    pub(crate) fn from_shared(shared: Arc<BreakpointShared>) -> Self {
        Self {
            shared,
            read_only: false,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<BreakpointShared> {
        &self.shared
    }

    pub(crate) fn read_only_view(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            read_only: true,
        }
    }

    fn check_writable(&self) -> Result<(), DebugError> {
        if self.read_only {
            return Err(DebugError::ReadOnlyBreakpoint);
        }
        if self.shared.is_disposed() {
            return Err(DebugError::BreakpointDisposed);
        }
        Ok(())
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[must_use]
    pub fn kind(&self) -> BreakpointKind {
        self.shared.kind
    }

    #[must_use]
    pub fn suspend_anchor(&self) -> SuspendAnchor {
        self.shared.anchor
    }

    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Whether the breakpoint is installed on the debugger for all sessions.
    #[must_use]
    pub fn is_global(&self) -> bool {
        self.shared.global.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.shared.is_enabled()
    }

    pub fn set_enabled(&self, enabled: bool) -> Result<(), DebugError> {
        self.check_writable()?;
        if self.shared.enabled.swap(enabled, Ordering::AcqRel) != enabled {
            debug!(breakpoint = self.shared.id, enabled, "breakpoint toggled");
        }
        Ok(())
    }

    /// Whether the location was found in a loaded source.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        self.shared.resolved.load(Ordering::Acquire)
    }

    /// The instrumentable section the location resolved to.
    #[must_use]
    pub fn resolved_section(&self) -> Option<SourceSection> {
        self.shared.state.lock().resolved_section.clone()
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    #[must_use]
    pub fn is_one_shot(&self) -> bool {
        self.shared.one_shot
    }

    /// Number of hits that passed the condition, ignored ones included.
    #[must_use]
    pub fn hit_count(&self) -> u32 {
        self.shared.hit_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn ignore_count(&self) -> u32 {
        self.shared.ignore_count.load(Ordering::Acquire)
    }

    pub fn set_ignore_count(&self, ignore_count: u32) -> Result<(), DebugError> {
        self.check_writable()?;
        self.shared.ignore_count.store(ignore_count, Ordering::Release);
        Ok(())
    }

    #[must_use]
    pub fn condition(&self) -> Option<SmolStr> {
        self.shared.condition.text()
    }

    /// Replace the condition; `None` or an empty string removes it.
    pub fn set_condition(&self, condition: Option<&str>) -> Result<(), DebugError> {
        self.check_writable()?;
        let condition = condition.filter(|text| !text.trim().is_empty());
        self.shared.condition.set(condition.map(SmolStr::new));
        debug!(breakpoint = self.shared.id, condition = ?condition, "condition changed");
        Ok(())
    }

    /// Human-readable location of the breakpoint.
    #[must_use]
    pub fn location_description(&self) -> String {
        match &self.shared.locator {
            Locator::Line { uri, line, column } => match column {
                Some(column) => format!("{uri}:{line}:{column}"),
                None => format!("{uri}:{line}"),
            },
            Locator::Section(section) => section.to_string(),
            Locator::Exception(filter) => filter.to_string(),
            Locator::AlwaysHalt => "halt instruction".to_string(),
        }
    }

    /// Dispose permanently, detaching the breakpoint from every session.
    pub fn dispose(&self) -> Result<(), DebugError> {
        if self.read_only {
            return Err(DebugError::ReadOnlyBreakpoint);
        }
        self.shared.dispose();
        Ok(())
    }
}

impl PartialEq for Breakpoint {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for Breakpoint {}

impl fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breakpoint")
            .field("id", &self.shared.id)
            .field("kind", &self.shared.kind)
            .field("location", &self.location_description())
            .field("read_only", &self.read_only)
            .finish()
    }
}

impl fmt::Display for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.is_disposed() {
            "disposed"
        } else if self.is_enabled() {
            "enabled"
        } else {
            "disabled"
        };
        write!(
            f,
            "Breakpoint#{} {} ({state}, hits={}",
            self.shared.id,
            self.location_description(),
            self.hit_count()
        )?;
        if self.ignore_count() > 0 {
            write!(f, ", ignore={}", self.ignore_count())?;
        }
        if let Some(condition) = self.condition() {
            write!(f, ", condition=\"{condition}\"")?;
        }
        if self.shared.one_shot {
            f.write_str(", one-shot")?;
        }
        f.write_str(")")
    }
}

/// Mutable builder fields shared by every breakpoint kind.
pub(crate) struct Settings {
    anchor: SuspendAnchor,
    elements: Vec<SourceElement>,
    one_shot: bool,
    ignore_count: u32,
    condition: Option<SmolStr>,
    resolve_listener: Option<ResolveListener>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            anchor: SuspendAnchor::Before,
            elements: vec![SourceElement::Statement],
            one_shot: false,
            ignore_count: 0,
            condition: None,
            resolve_listener: None,
        }
    }
}

/// Result of asking a breakpoint whether it fires at a point.
#[derive(Clone)]
pub(crate) enum Hit {
    Miss,
    Fired(Option<GuestError>),
}

/// Hit decided for the point a thread is visiting, shared by every session
/// observing the breakpoint there.
struct Visit {
    node: NodeId,
    phase: Phase,
    hit: Hit,
}

impl BreakpointShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn kind(&self) -> BreakpointKind {
        self.kind
    }

    pub(crate) fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire) && !self.is_disposed()
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub(crate) fn is_global(&self) -> bool {
        self.global.load(Ordering::Acquire)
    }

    pub(crate) fn is_always_halt(&self) -> bool {
        matches!(self.locator, Locator::AlwaysHalt)
    }

    pub(crate) fn execution_binding(&self) -> Option<BindingId> {
        self.state.lock().execution_binding
    }

    /// Whether the breakpoint reacts to dispatches of this phase.
    pub(crate) fn handles(&self, phase: Phase) -> bool {
        match (&self.locator, phase) {
            (Locator::Exception(_), Phase::Exceptional) => true,
            (Locator::Exception(_), _) | (_, Phase::Exceptional) => false,
            (_, phase) => phase.anchor() == self.anchor,
        }
    }

    /// Live sessions this breakpoint is installed in.
    pub(crate) fn sessions(&self) -> Vec<Arc<SessionShared>> {
        self.state
            .lock()
            .sessions
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn debugger(&self) -> Option<Arc<DebuggerShared>> {
        self.state.lock().debugger.as_ref().and_then(Weak::upgrade)
    }

    /// Check enablement, exception, condition and counters for one visit.
    fn evaluate_visit(
        &self,
        point: ExecutionPoint<'_>,
        exception: Option<&Arc<GuestException>>,
        sessions: &[Arc<SessionShared>],
    ) -> Hit {
        if !self.is_enabled() || !self.matches_exception(point, exception) {
            return Hit::Miss;
        }
        let (fire, failure) = self.should_break(point, sessions);
        if !fire || !self.register_hit() {
            return Hit::Miss;
        }
        Hit::Fired(failure)
    }

    /// Hit for a visit evaluated by another node's dispatch. The outcome is
    /// kept until the breakpoint's own node is notified at the same point,
    /// so every session sees one evaluation per visit.
    pub(crate) fn notify_indirect_hit(
        &self,
        session: &Arc<SessionShared>,
        point: ExecutionPoint<'_>,
        phase: Phase,
        exception: Option<&Arc<GuestException>>,
    ) -> Hit {
        let thread = std::thread::current().id();
        let node = point.context.node_id();
        if let Some(visit) = self.visits.lock().get(&thread) {
            if visit.node == node && visit.phase == phase {
                return visit.hit.clone();
            }
        }
        let hit = self.evaluate_visit(point, exception, std::slice::from_ref(session));
        self.visits.lock().insert(
            thread,
            Visit {
                node,
                phase,
                hit: hit.clone(),
            },
        );
        hit
    }

    /// Take the outcome another node evaluated for this visit, if any.
    fn take_visit(&self, thread: ThreadId, node: NodeId, phase: Phase) -> Option<Hit> {
        let visit = self.visits.lock().remove(&thread)?;
        (visit.node == node && visit.phase == phase).then_some(visit.hit)
    }

    /// Drop the outcome of a visit the host will not finish notifying.
    pub(crate) fn forget_visit(&self, thread: ThreadId) {
        self.visits.lock().remove(&thread);
    }

    fn matches_exception(
        &self,
        point: ExecutionPoint<'_>,
        exception: Option<&Arc<GuestException>>,
    ) -> bool {
        match (&self.locator, exception) {
            (Locator::Exception(filter), Some(exception)) => filter.matches(point, exception),
            (Locator::Exception(_), None) => false,
            _ => true,
        }
    }

    /// Evaluate the condition once for all `sessions` observing the node.
    fn should_break(
        &self,
        point: ExecutionPoint<'_>,
        sessions: &[Arc<SessionShared>],
    ) -> (bool, Option<GuestError>) {
        if !self.condition.is_set() {
            return (true, None);
        }
        let evaluator = self.debugger().and_then(|debugger| debugger.evaluator());
        self.condition.evaluate(self.id, point, evaluator, sessions)
    }

    /// Count a hit that passed the condition; false while it is ignored.
    fn register_hit(&self) -> bool {
        let hits = self.hit_count.fetch_add(1, Ordering::AcqRel).saturating_add(1);
        let ignore_count = self.ignore_count.load(Ordering::Acquire);
        if hits <= ignore_count {
            trace!(breakpoint = self.id, hits, ignore_count, "hit ignored");
            return false;
        }
        if self.one_shot
            && self
                .enabled
                .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
        {
            return false;
        }
        true
    }

    /// Add `session` to the observers; returns false if it already was one.
    pub(crate) fn install_in_session(
        self: &Arc<Self>,
        session: &Arc<SessionShared>,
        as_global: bool,
    ) -> Result<bool, DebugError> {
        let needs_attach = {
            let mut state = self.state.lock();
            if self.is_disposed() {
                return Err(DebugError::BreakpointDisposed);
            }
            if !as_global && self.is_global() {
                return Err(DebugError::AlreadyInstalled);
            }
            let debugger = session.debugger();
            match &state.debugger {
                Some(owner) if !Weak::ptr_eq(owner, &Arc::downgrade(debugger)) => {
                    return Err(DebugError::AlreadyInstalled);
                }
                Some(_) => {}
                None => {
                    state.debugger = Some(Arc::downgrade(debugger));
                    state.instrumenter = Some(debugger.instrumenter().clone());
                }
            }
            state.sessions.retain(|weak| weak.strong_count() > 0);
            if state
                .sessions
                .iter()
                .any(|weak| std::ptr::eq(weak.as_ptr(), Arc::as_ptr(session)))
            {
                return Ok(false);
            }
            state.sessions.push(Arc::downgrade(session));
            !state.attached
        };
        debug!(breakpoint = self.id, session = session.id(), "breakpoint installed");
        if needs_attach {
            self.attach();
        }
        Ok(true)
    }

    /// Mark the breakpoint global for `debugger`.
    pub(crate) fn install_globally(
        &self,
        debugger: &Arc<DebuggerShared>,
    ) -> Result<(), DebugError> {
        let mut state = self.state.lock();
        if self.is_disposed() {
            return Err(DebugError::BreakpointDisposed);
        }
        if self.is_global() || state.sessions.iter().any(|weak| weak.strong_count() > 0) {
            return Err(DebugError::AlreadyInstalled);
        }
        if let Some(owner) = &state.debugger {
            if !Weak::ptr_eq(owner, &Arc::downgrade(debugger)) {
                return Err(DebugError::AlreadyInstalled);
            }
        }
        state.debugger = Some(Arc::downgrade(debugger));
        state.instrumenter = Some(debugger.instrumenter().clone());
        self.global.store(true, Ordering::Release);
        Ok(())
    }

    /// Remove `session` from the observers; detaches the host binding once
    /// no session is left. Returns whether any session remains.
    pub(crate) fn remove_session(&self, session: &SessionShared) -> bool {
        let (remaining, detach) = {
            let mut state = self.state.lock();
            state.sessions.retain(|weak| {
                weak.strong_count() > 0 && !std::ptr::eq(weak.as_ptr(), session)
            });
            let remaining = !state.sessions.is_empty();
            let detach = if remaining { None } else { Self::take_bindings(&mut state) };
            (remaining, detach)
        };
        if let Some((instrumenter, bindings)) = detach {
            for binding in bindings {
                instrumenter.detach(binding);
            }
            self.visits.lock().clear();
        }
        remaining
    }

    pub(crate) fn dispose(self: &Arc<Self>) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.enabled.store(false, Ordering::Release);
        let (sessions, debugger, detach) = {
            let mut state = self.state.lock();
            let sessions: Vec<_> = state.sessions.drain(..).filter_map(|weak| weak.upgrade()).collect();
            let debugger = state.debugger.as_ref().and_then(Weak::upgrade);
            (sessions, debugger, Self::take_bindings(&mut state))
        };
        if let Some((instrumenter, bindings)) = detach {
            for binding in bindings {
                instrumenter.detach(binding);
            }
        }
        self.visits.lock().clear();
        for session in &sessions {
            session.forget_breakpoint(self.id);
        }
        if self.is_global() {
            if let Some(debugger) = debugger {
                debugger.forget_breakpoint(&Breakpoint::from_shared(self.clone()));
            }
        }
        debug!(breakpoint = self.id, "breakpoint disposed");
    }

    fn take_bindings(
        state: &mut InstallState,
    ) -> Option<(Arc<dyn Instrumenter>, Vec<BindingId>)> {
        if !state.attached {
            return None;
        }
        state.attached = false;
        let instrumenter = state.instrumenter.clone()?;
        let bindings = state
            .source_binding
            .take()
            .into_iter()
            .chain(state.execution_binding.take())
            .collect();
        Some((instrumenter, bindings))
    }

    fn element_tags(&self) -> Tags {
        SourceElement::tags_of(&self.elements)
    }

    /// Attach the host bindings the locator needs.
    fn attach(self: &Arc<Self>) {
        let (generation, instrumenter, attached_now) = {
            let mut state = self.state.lock();
            if state.attached {
                return;
            }
            let Some(instrumenter) = state.instrumenter.clone() else {
                return;
            };
            state.attached = true;
            state.generation += 1;
            if let Locator::Section(section) = &self.locator {
                state
                    .resolved_section
                    .get_or_insert_with(|| section.clone());
            }
            let filter = match (&self.locator, state.resolved_section.clone()) {
                (_, Some(section)) => Some(EventFilter::at_section(section, self.element_tags())),
                (Locator::Line { .. } | Locator::Section(_), None) => None,
                (Locator::Exception(exceptions), None) => Some(
                    EventFilter::tags(Tags::STATEMENT | Tags::ROOT).include_internal(
                        exceptions.suspension_filter().is_internal_included(),
                    ),
                ),
                (Locator::AlwaysHalt, None) => Some(EventFilter::tags(Tags::ALWAYS_HALT)),
            };
            let attached_now = filter.is_some();
            if let Some(filter) = filter {
                self.attach_execution(&mut state, &instrumenter, filter);
            }
            (state.generation, instrumenter, attached_now)
        };
        if attached_now {
            if matches!(self.locator, Locator::Line { .. } | Locator::Section(_)) {
                self.mark_resolved();
            }
            return;
        }
        let resolver = Arc::new(SourceResolver::new(Arc::downgrade(self), generation));
        let binding = instrumenter.attach_source_listener(resolver, true);
        let mut state = self.state.lock();
        if state.attached && state.generation == generation {
            state.source_binding = Some(binding);
        } else {
            drop(state);
            instrumenter.detach(binding);
        }
    }

    fn attach_execution(
        self: &Arc<Self>,
        state: &mut InstallState,
        instrumenter: &Arc<dyn Instrumenter>,
        filter: EventFilter,
    ) {
        let node = Arc::new(BreakpointNode::new(self.clone()));
        let binding = instrumenter.attach_execution_listener(filter, node.clone());
        node.bind(binding);
        state.execution_binding = Some(binding);
        trace!(breakpoint = self.id, binding = binding.0, "execution binding attached");
    }

    /// Resolve a line location against a newly loaded source.
    pub(crate) fn on_source_loaded(self: &Arc<Self>, generation: u64, source: &LoadedSource) {
        let Locator::Line { uri, line, column } = &self.locator else {
            return;
        };
        if source.uri != *uri {
            return;
        }
        let Some(section) = resolve_location(source, self.element_tags(), *line, *column) else {
            trace!(breakpoint = self.id, uri = %uri, line, "no instrumentable location on line");
            return;
        };
        {
            let mut state = self.state.lock();
            if !state.attached || state.generation != generation || state.execution_binding.is_some() {
                return;
            }
            let Some(instrumenter) = state.instrumenter.clone() else {
                return;
            };
            state.resolved_section = Some(section.clone());
            let filter = EventFilter::at_section(section.clone(), self.element_tags());
            self.attach_execution(&mut state, &instrumenter, filter);
        }
        debug!(breakpoint = self.id, section = %section, "breakpoint resolved");
        self.mark_resolved();
    }

    fn mark_resolved(self: &Arc<Self>) {
        if self.resolved.swap(true, Ordering::AcqRel) {
            return;
        }
        let section = self.state.lock().resolved_section.clone();
        if let (Some(listener), Some(section)) = (&self.resolve_listener, section) {
            listener(&Breakpoint::from_shared(self.clone()), &section);
        }
    }
}

impl fmt::Debug for BreakpointShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakpointShared")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("locator", &self.locator)
            .finish_non_exhaustive()
    }
}
