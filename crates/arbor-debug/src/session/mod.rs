//! Debugger sessions.
//!
//! A session owns the per-thread stepping strategies and decides, at every
//! instrumented point its nodes are notified of, whether to suspend and call
//! back the client. See [`dispatch`] for the merging protocol.

mod dispatch;
mod nodes;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::ThreadId;

use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, trace};

use crate::breakpoint::{Breakpoint, BreakpointKind};
use crate::debugger::{Debugger, DebuggerShared};
use crate::error::{DebugError, Interrupt};
use crate::event::SuspendedEvent;
use crate::filter::SuspensionFilter;
use crate::host::{BindingId, EventContext, EventFilter, ExecutionPoint, NodeId};
use crate::source::{SourceElement, SuspendAnchor, Tags};
use crate::stable::StableBoolean;
use crate::stepping::SteppingStrategy;

pub(crate) use dispatch::{Dispatch, Phase};
use nodes::{RootDepthNode, SteppingNode};

/// Client callback invoked on the guest thread for every suspension.
pub type SuspendCallback = Arc<dyn Fn(&SuspendedEvent) + Send + Sync>;

/// Handle to a debugger session.
#[derive(Clone)]
pub struct DebuggerSession {
    shared: Arc<SessionShared>,
}

/// Bindings of nodes marked as handled by another node's dispatch at the
/// same point on one thread.
#[derive(Debug)]
struct DuplicateMarks {
    node: NodeId,
    phase: Phase,
    bindings: Vec<BindingId>,
}

pub(crate) struct SessionShared {
    id: u64,
    debugger: Arc<DebuggerShared>,
    callback: SuspendCallback,
    elements: Vec<SourceElement>,
    element_tags: Tags,
    stepping_filter: RwLock<SuspensionFilter>,
    breakpoints: Mutex<IndexMap<u64, Breakpoint>>,
    breakpoints_active: [StableBoolean; 3],
    strategies: RwLock<FxHashMap<ThreadId, Arc<Mutex<SteppingStrategy>>>>,
    suspended: RwLock<FxHashMap<ThreadId, SuspendedEvent>>,
    suspension_disabled: Mutex<FxHashMap<ThreadId, usize>>,
    duplicates: Mutex<FxHashMap<ThreadId, DuplicateMarks>>,
    pending_duplicates: AtomicUsize,
    suspend_next: StableBoolean,
    suspend_all: StableBoolean,
    stepping: StableBoolean,
    closed: StableBoolean,
    lock: Mutex<()>,
    bindings: Mutex<Vec<BindingId>>,
    stepping_binding: OnceLock<BindingId>,
}

impl DebuggerSession {
    pub(crate) fn start(
        id: u64,
        debugger: Arc<DebuggerShared>,
        callback: SuspendCallback,
        elements: Vec<SourceElement>,
    ) -> Self {
        let config = debugger.config();
        let shared = Arc::new(SessionShared {
            id,
            callback,
            element_tags: SourceElement::tags_of(&elements),
            elements,
            stepping_filter: RwLock::new(config.suspension_filter.clone()),
            breakpoints: Mutex::new(IndexMap::new()),
            breakpoints_active: BreakpointKind::ALL
                .map(|kind| StableBoolean::new(config.breakpoints_active(kind))),
            strategies: RwLock::new(FxHashMap::default()),
            suspended: RwLock::new(FxHashMap::default()),
            suspension_disabled: Mutex::new(FxHashMap::default()),
            duplicates: Mutex::new(FxHashMap::default()),
            pending_duplicates: AtomicUsize::new(0),
            suspend_next: StableBoolean::new(false),
            suspend_all: StableBoolean::new(false),
            stepping: StableBoolean::new(false),
            closed: StableBoolean::new(false),
            lock: Mutex::new(()),
            bindings: Mutex::new(Vec::new()),
            stepping_binding: OnceLock::new(),
            debugger,
        });
        shared.attach_nodes();
        debug!(session = id, elements = ?shared.elements, "session started");
        Self { shared }
    }

    pub(crate) fn from_shared(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<SessionShared> {
        &self.shared
    }

    #[must_use]
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    #[must_use]
    pub fn debugger(&self) -> Debugger {
        Debugger::from_shared(self.shared.debugger.clone())
    }

    /// Source elements this session steps over.
    #[must_use]
    pub fn source_elements(&self) -> &[SourceElement] {
        &self.shared.elements
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.get()
    }

    fn check_open(&self) -> Result<(), DebugError> {
        if self.is_closed() {
            return Err(DebugError::SessionClosed);
        }
        Ok(())
    }

    /// Install a breakpoint in this session only.
    pub fn install(&self, breakpoint: &Breakpoint) -> Result<Breakpoint, DebugError> {
        self.check_open()?;
        if breakpoint.is_read_only() {
            return Err(DebugError::ReadOnlyBreakpoint);
        }
        if breakpoint.shared().install_in_session(&self.shared, false)? {
            self.shared
                .breakpoints
                .lock()
                .insert(breakpoint.id(), breakpoint.clone());
        }
        Ok(breakpoint.clone())
    }

    /// Session breakpoints in install order, followed by read-only views of
    /// the debugger's global breakpoints.
    #[must_use]
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        let mut breakpoints: Vec<Breakpoint> =
            self.shared.breakpoints.lock().values().cloned().collect();
        breakpoints.extend(
            self.shared
                .debugger
                .global_breakpoints()
                .iter()
                .map(Breakpoint::read_only_view),
        );
        breakpoints
    }

    #[must_use]
    pub fn is_breakpoints_active(&self, kind: BreakpointKind) -> bool {
        self.shared.is_breakpoints_active(kind)
    }

    pub fn set_breakpoints_active(&self, kind: BreakpointKind, active: bool) {
        if self.shared.breakpoints_active[kind.index()].set(active) {
            debug!(session = self.shared.id, ?kind, active, "breakpoints toggled");
        }
    }

    /// Toggle every breakpoint kind at once.
    pub fn set_all_breakpoints_active(&self, active: bool) {
        for kind in BreakpointKind::ALL {
            self.set_breakpoints_active(kind, active);
        }
    }

    #[must_use]
    pub fn stepping_filter(&self) -> SuspensionFilter {
        self.shared.stepping_filter.read().clone()
    }

    pub fn set_stepping_filter(&self, filter: SuspensionFilter) {
        *self.shared.stepping_filter.write() = filter;
    }

    /// Suspend the next thread that reaches an instrumented point.
    pub fn suspend_next_execution(&self) -> Result<(), DebugError> {
        self.check_open()?;
        self.shared.suspend_next.set(true);
        self.shared.update_stepping();
        Ok(())
    }

    /// Suspend `thread` at its next instrumented point.
    pub fn suspend(&self, thread: ThreadId) -> Result<(), DebugError> {
        self.check_open()?;
        let _guard = self.shared.lock.lock();
        self.shared
            .set_strategy(thread, SteppingStrategy::always_halt(), true);
        Ok(())
    }

    /// Suspend every thread, including ones that start executing later.
    pub fn suspend_all(&self) -> Result<(), DebugError> {
        self.check_open()?;
        let _guard = self.shared.lock.lock();
        self.shared.suspend_all.set(true);
        let threads: Vec<ThreadId> = self.shared.strategies.read().keys().copied().collect();
        for thread in threads {
            self.shared
                .set_strategy(thread, SteppingStrategy::always_halt(), false);
        }
        self.shared.update_stepping();
        Ok(())
    }

    /// Cancel a pending suspension of `thread`.
    pub fn resume(&self, thread: ThreadId) -> Result<(), DebugError> {
        self.check_open()?;
        let _guard = self.shared.lock.lock();
        self.shared
            .set_strategy(thread, SteppingStrategy::proceed(), true);
        Ok(())
    }

    /// Cancel all pending suspensions and stepping.
    pub fn resume_all(&self) -> Result<(), DebugError> {
        self.check_open()?;
        let _guard = self.shared.lock.lock();
        self.shared.suspend_next.set(false);
        self.shared.suspend_all.set(false);
        let threads: Vec<ThreadId> = self.shared.strategies.read().keys().copied().collect();
        for thread in threads {
            self.shared
                .set_strategy(thread, SteppingStrategy::proceed(), false);
        }
        self.shared.update_stepping();
        Ok(())
    }

    /// Suspend the current thread right here, outside any breakpoint or
    /// step. Returns false when the session is closed or the thread is
    /// suspended already.
    pub fn suspend_here(&self, point: ExecutionPoint<'_>) -> Result<bool, Interrupt> {
        self.shared.suspend_here(point)
    }

    /// Close the session: uninstall its breakpoints and stop stepping.
    pub fn close(&self) -> Result<(), DebugError> {
        if self.shared.closed.set(true) {
            self.shared.debugger.remove_session(&self.shared);
            self.shared.release();
            debug!(session = self.shared.id, "session closed");
            Ok(())
        } else {
            Err(DebugError::SessionClosed)
        }
    }
}

impl PartialEq for DebuggerSession {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for DebuggerSession {}

impl fmt::Debug for DebuggerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebuggerSession")
            .field("id", &self.shared.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl fmt::Display for DebuggerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session#{}", self.shared.id)?;
        if self.is_closed() {
            f.write_str(" (closed)")?;
        }
        Ok(())
    }
}

/// Disables suspension on one thread in a set of sessions while alive.
pub(crate) struct SuspensionGuard<'a> {
    sessions: &'a [Arc<SessionShared>],
    thread: ThreadId,
}

impl<'a> SuspensionGuard<'a> {
    pub(crate) fn new(sessions: &'a [Arc<SessionShared>], thread: ThreadId) -> Self {
        for session in sessions {
            *session
                .suspension_disabled
                .lock()
                .entry(thread)
                .or_insert(0) += 1;
        }
        Self { sessions, thread }
    }
}

impl Drop for SuspensionGuard<'_> {
    fn drop(&mut self) {
        for session in self.sessions {
            let mut disabled = session.suspension_disabled.lock();
            if let Some(count) = disabled.get_mut(&self.thread) {
                *count -= 1;
                if *count == 0 {
                    disabled.remove(&self.thread);
                }
            }
        }
    }
}

impl SessionShared {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn debugger(&self) -> &Arc<DebuggerShared> {
        &self.debugger
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    pub(crate) fn is_stepping(&self) -> bool {
        self.stepping.get()
    }

    pub(crate) fn element_tags(&self) -> Tags {
        self.element_tags
    }

    pub(crate) fn is_breakpoints_active(&self, kind: BreakpointKind) -> bool {
        self.breakpoints_active[kind.index()].get()
    }

    fn attach_nodes(self: &Arc<Self>) {
        let instrumenter = self.debugger.instrumenter().clone();
        let depth = instrumenter.attach_execution_listener(
            EventFilter::tags(Tags::ROOT).include_internal(true),
            Arc::new(RootDepthNode::new(Arc::downgrade(self))),
        );
        let node = Arc::new(SteppingNode::new(Arc::downgrade(self)));
        let stepping = instrumenter.attach_execution_listener(
            EventFilter::tags(self.element_tags | Tags::CALL).include_internal(true),
            node.clone(),
        );
        node.bind(stepping);
        let _ = self.stepping_binding.set(stepping);
        self.bindings.lock().extend([depth, stepping]);
    }

    pub(crate) fn stepping_binding(&self) -> Option<BindingId> {
        self.stepping_binding.get().copied()
    }

    pub(crate) fn is_suspended_on(&self, thread: ThreadId) -> bool {
        self.suspended.read().contains_key(&thread)
    }

    pub(crate) fn is_suspension_disabled(&self, thread: ThreadId) -> bool {
        self.suspension_disabled.lock().contains_key(&thread)
    }

    /// Whether a breakpoint hit of `kind` on `thread` may be reported here.
    pub(crate) fn accepts_hit(&self, thread: ThreadId, kind: BreakpointKind) -> bool {
        !self.is_closed()
            && self.is_breakpoints_active(kind)
            && !self.is_suspended_on(thread)
            && !self.is_suspension_disabled(thread)
    }

    /// Consume a duplicate mark left for `binding` by another node's dispatch.
    pub(crate) fn consume_duplicate(
        &self,
        thread: ThreadId,
        binding: BindingId,
        node: NodeId,
        phase: Phase,
    ) -> bool {
        if self.pending_duplicates.load(Ordering::Acquire) == 0 {
            return false;
        }
        let mut duplicates = self.duplicates.lock();
        let Some(marks) = duplicates.get_mut(&thread) else {
            return false;
        };
        if marks.node != node || marks.phase != phase {
            return false;
        }
        let Some(index) = marks.bindings.iter().position(|marked| *marked == binding) else {
            return false;
        };
        marks.bindings.swap_remove(index);
        if marks.bindings.is_empty() {
            duplicates.remove(&thread);
            self.pending_duplicates.fetch_sub(1, Ordering::AcqRel);
        }
        trace!(session = self.id, binding = binding.0, "duplicate notification consumed");
        true
    }

    /// Drop every mark of `thread`.
    pub(crate) fn clear_duplicates(&self, thread: ThreadId) {
        let mut duplicates = self.duplicates.lock();
        if duplicates.remove(&thread).is_some() {
            self.pending_duplicates.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Replace the marks of `thread` with `bindings` at `node`.
    fn mark_duplicates(&self, thread: ThreadId, node: NodeId, phase: Phase, bindings: &[BindingId]) {
        let mut duplicates = self.duplicates.lock();
        let had_marks = duplicates.remove(&thread).is_some();
        let has_marks = !bindings.is_empty();
        if has_marks {
            duplicates.insert(
                thread,
                DuplicateMarks {
                    node,
                    phase,
                    bindings: bindings.to_vec(),
                },
            );
        }
        match (had_marks, has_marks) {
            (false, true) => {
                self.pending_duplicates.fetch_add(1, Ordering::AcqRel);
            }
            (true, false) => {
                self.pending_duplicates.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {}
        }
    }

    pub(crate) fn strategy_slot(&self, thread: ThreadId) -> Option<Arc<Mutex<SteppingStrategy>>> {
        self.strategies.read().get(&thread).cloned()
    }

    /// Run `f` on the thread's current strategy, if it has one.
    pub(crate) fn with_strategy<R>(
        &self,
        thread: ThreadId,
        f: impl FnOnce(&mut SteppingStrategy) -> R,
    ) -> Option<R> {
        let slot = self.strategy_slot(thread)?;
        let mut strategy = slot.lock();
        Some(f(&mut strategy))
    }

    /// Whether the stepping node should dispatch at this point.
    pub(crate) fn wants_step(
        &self,
        thread: ThreadId,
        context: &dyn EventContext,
        anchor: SuspendAnchor,
    ) -> bool {
        self.suspend_next.get()
            || self.suspend_all.get()
            || self
                .with_strategy(thread, |strategy| strategy.is_active(context, anchor))
                .unwrap_or(false)
    }

    fn set_strategy(&self, thread: ThreadId, strategy: SteppingStrategy, update: bool) {
        trace!(session = self.id, thread = ?thread, %strategy, "strategy installed");
        self.strategies
            .write()
            .insert(thread, Arc::new(Mutex::new(strategy)));
        if update {
            self.update_stepping();
        }
    }

    fn update_stepping(&self) {
        let needed = self.suspend_next.get()
            || self.suspend_all.get()
            || self
                .strategies
                .read()
                .values()
                .any(|strategy| !strategy.lock().is_done());
        if self.stepping.set(needed) {
            debug!(session = self.id, stepping = needed, "stepping toggled");
        }
    }

    pub(crate) fn forget_breakpoint(&self, id: u64) {
        self.breakpoints.lock().shift_remove(&id);
    }

    /// Detach the session's nodes and breakpoints.
    fn release(&self) {
        let instrumenter = self.debugger.instrumenter().clone();
        for binding in self.bindings.lock().drain(..) {
            instrumenter.detach(binding);
        }
        let local: Vec<Breakpoint> = self.breakpoints.lock().drain(..).map(|(_, bp)| bp).collect();
        for breakpoint in local {
            if !breakpoint.shared().remove_session(self) {
                breakpoint.shared().dispose();
            }
        }
        for breakpoint in self.debugger.global_breakpoints() {
            breakpoint.shared().remove_session(self);
        }
        self.debugger.always_halt().shared().remove_session(self);
        self.strategies.write().clear();
        self.suspend_next.set(false);
        self.suspend_all.set(false);
        self.stepping.set(false);
    }
}

impl Drop for SessionShared {
    fn drop(&mut self) {
        if self.closed.set(true) {
            self.release();
        }
    }
}
