//! Suspension decisions.
//!
//! Several of a session's nodes (the stepping node, breakpoint nodes, the
//! always-halt node) may be attached at the same point. The first one the
//! host notifies in its dispatch order handles the point for all of them:
//! it asks the host which of the session's bindings are attached there,
//! evaluates the others' breakpoints on their behalf and leaves a duplicate
//! mark so they skip their own notification. The client then sees a single
//! suspension listing every breakpoint that fired.

use std::sync::Arc;
use std::thread::ThreadId;

use tracing::{debug, trace, warn};

use crate::breakpoint::{Breakpoint, Hit};
use crate::error::{GuestError, Interrupt, KillSignal, UnwindSignal};
use crate::event::{EventData, SuspendedEvent};
use crate::host::{BindingId, EventContext, ExecutionPoint};
use crate::source::SuspendAnchor;
use crate::stepping::SteppingStrategy;
use crate::value::{GuestException, Value};

use super::{DebuggerSession, SessionShared};

/// Which listener notification a dispatch comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Phase {
    Enter,
    Return,
    Exceptional,
}

impl Phase {
    pub(crate) fn anchor(self) -> SuspendAnchor {
        match self {
            Phase::Enter => SuspendAnchor::Before,
            Phase::Return | Phase::Exceptional => SuspendAnchor::After,
        }
    }
}

/// One node notification offered to a session.
pub(crate) struct Dispatch<'a> {
    /// Binding of the notifying node.
    pub(crate) source: Option<BindingId>,
    pub(crate) point: ExecutionPoint<'a>,
    pub(crate) phase: Phase,
    pub(crate) return_value: Option<&'a Value>,
    pub(crate) exception: Option<&'a Arc<GuestException>>,
    /// Breakpoint the notifying node already evaluated as hit.
    pub(crate) fired: Option<(Breakpoint, Option<GuestError>)>,
}

/// A session binding that may be attached at a point.
enum Candidate {
    Stepping,
    Breakpoint(Breakpoint),
}

impl SessionShared {
    /// Session bindings in canonical order: stepping, session breakpoints in
    /// install order, global breakpoints, the halt-instruction breakpoint.
    fn candidates(&self) -> Vec<(BindingId, Candidate)> {
        let mut candidates = Vec::new();
        if let Some(binding) = self.stepping_binding() {
            candidates.push((binding, Candidate::Stepping));
        }
        let local: Vec<Breakpoint> = self.breakpoints.lock().values().cloned().collect();
        let global = self.debugger.global_breakpoints();
        let always_halt = self.debugger.always_halt().clone();
        for breakpoint in local.into_iter().chain(global).chain([always_halt]) {
            if let Some(binding) = breakpoint.shared().execution_binding() {
                candidates.push((binding, Candidate::Breakpoint(breakpoint)));
            }
        }
        candidates
    }

    /// Mark the candidates the host notifies after the source at this point
    /// (before it, for return events) and return their indices.
    fn collect_duplicates(
        &self,
        thread: ThreadId,
        dispatch: &Dispatch<'_>,
        candidates: &[(BindingId, Candidate)],
    ) -> Vec<usize> {
        let Some(source) = dispatch.source else {
            return Vec::new();
        };
        let context = dispatch.point.context;
        let ids: Vec<BindingId> = candidates.iter().map(|(binding, _)| *binding).collect();
        let attached = self.debugger.instrumenter().lookup(context, &ids);
        let Some(position) = attached.iter().position(|binding| *binding == source) else {
            warn!(
                session = self.id,
                binding = source.0,
                "notifying binding is not attached at its own point"
            );
            return Vec::new();
        };
        let others = match dispatch.phase {
            Phase::Enter => &attached[position + 1..],
            Phase::Return | Phase::Exceptional => &attached[..position],
        };
        self.mark_duplicates(thread, context.node_id(), dispatch.phase, others);
        others
            .iter()
            .filter_map(|binding| ids.iter().position(|id| id == binding))
            .collect()
    }

    /// Current strategy slot of `thread`, creating one on first sight.
    fn strategy_for(&self, thread: ThreadId) -> Arc<parking_lot::Mutex<SteppingStrategy>> {
        if self.suspend_next.get() {
            let _guard = self.lock.lock();
            if self.suspend_next.get() {
                self.suspend_next.set(false);
                self.set_strategy(thread, SteppingStrategy::always_halt(), false);
            }
        }
        if let Some(slot) = self.strategy_slot(thread) {
            return slot;
        }
        let _guard = self.lock.lock();
        let strategy = if self.suspend_all.get() {
            SteppingStrategy::always_halt()
        } else {
            SteppingStrategy::proceed()
        };
        self.strategies
            .write()
            .entry(thread)
            .or_insert_with(|| Arc::new(parking_lot::Mutex::new(strategy)))
            .clone()
    }

    fn view_of(&self, breakpoint: &Breakpoint) -> Breakpoint {
        let shared = breakpoint.shared();
        if shared.is_global() || shared.is_always_halt() {
            breakpoint.read_only_view()
        } else {
            Breakpoint::from_shared(shared.clone())
        }
    }

    /// Decide whether the notification suspends the current thread and run
    /// the client callback if it does. Returns the replacement return value
    /// the client set, or the interrupt it prepared.
    pub(crate) fn dispatch(
        self: &Arc<Self>,
        dispatch: Dispatch<'_>,
    ) -> Result<Option<Value>, Interrupt> {
        if self.is_closed() {
            return Ok(None);
        }
        let thread = std::thread::current().id();
        if self.is_suspension_disabled(thread) {
            trace!(session = self.id, "suspension disabled on thread");
            return Ok(None);
        }
        if self.is_suspended_on(thread) {
            trace!(session = self.id, "thread suspended already");
            return Ok(None);
        }
        let point = dispatch.point;
        let context = point.context;
        let phase = dispatch.phase;
        let anchor = phase.anchor();

        let candidates = self.candidates();
        let collected = self.collect_duplicates(thread, &dispatch, &candidates);
        let strategy = self.strategy_for(thread);

        if phase != Phase::Enter
            && self.is_stepping()
            && collected
                .iter()
                .any(|&index| matches!(candidates[index].1, Candidate::Stepping))
        {
            strategy.lock().notify_node_exit(context);
        }

        let mut hits: Vec<(usize, Breakpoint, Option<GuestError>)> = Vec::new();
        if let Some((breakpoint, failure)) = dispatch.fired {
            let rank = candidates
                .iter()
                .position(|(_, candidate)| {
                    matches!(candidate, Candidate::Breakpoint(other) if *other == breakpoint)
                })
                .unwrap_or(usize::MAX);
            hits.push((rank, breakpoint, failure));
        }
        for &index in &collected {
            let Candidate::Breakpoint(breakpoint) = &candidates[index].1 else {
                continue;
            };
            let shared = breakpoint.shared();
            if !shared.handles(phase) || !self.is_breakpoints_active(breakpoint.kind()) {
                continue;
            }
            if let Hit::Fired(failure) =
                shared.notify_indirect_hit(self, point, phase, dispatch.exception)
            {
                hits.push((index, breakpoint.clone(), failure));
            }
        }
        hits.sort_by_key(|(rank, ..)| *rank);

        let hit_stepping = phase != Phase::Exceptional
            && self.stepping_filter.read().accepts(context)
            && strategy.lock().step(&self.elements, context, anchor);
        if hits.is_empty() && !hit_stepping {
            return Ok(None);
        }
        strategy.lock().consume();

        let mut breakpoints = Vec::with_capacity(hits.len());
        let mut failures = Vec::new();
        for (_, breakpoint, failure) in hits {
            let view = self.view_of(&breakpoint);
            if let Some(failure) = failure {
                failures.push((view.clone(), failure));
            }
            breakpoints.push(view);
        }
        self.do_suspend(
            point,
            anchor,
            breakpoints,
            failures,
            dispatch.return_value.cloned(),
            dispatch.exception.cloned(),
        )
    }

    /// Step check after the host re-entered a frame for an unwind.
    pub(crate) fn notify_unwind_callback(
        self: &Arc<Self>,
        point: ExecutionPoint<'_>,
    ) -> Result<(), Interrupt> {
        let thread = std::thread::current().id();
        let Some(slot) = self.strategy_slot(thread) else {
            return Ok(());
        };
        let stop = {
            let mut strategy = slot.lock();
            let stop = strategy.step(&self.elements, point.context, SuspendAnchor::Before);
            if stop {
                strategy.consume();
            }
            stop
        };
        if !stop {
            return Ok(());
        }
        self.do_suspend(point, SuspendAnchor::Before, Vec::new(), Vec::new(), None, None)
            .map(|_| ())
    }

    pub(crate) fn suspend_here(
        self: &Arc<Self>,
        point: ExecutionPoint<'_>,
    ) -> Result<bool, Interrupt> {
        let thread = std::thread::current().id();
        if self.is_closed() || self.is_suspended_on(thread) {
            return Ok(false);
        }
        self.strategy_for(thread).lock().consume();
        self.do_suspend(point, SuspendAnchor::Before, Vec::new(), Vec::new(), None, None)?;
        Ok(true)
    }

    fn do_suspend(
        self: &Arc<Self>,
        point: ExecutionPoint<'_>,
        anchor: SuspendAnchor,
        breakpoints: Vec<Breakpoint>,
        failures: Vec<(Breakpoint, GuestError)>,
        return_value: Option<Value>,
        exception: Option<Arc<GuestException>>,
    ) -> Result<Option<Value>, Interrupt> {
        let thread = std::thread::current().id();
        let location = point.describe();
        let event = SuspendedEvent::new(EventData {
            session: DebuggerSession::from_shared(self.clone()),
            thread,
            context: point.context,
            anchor,
            frames: point.stack.frames(),
            breakpoints,
            failures,
            return_value,
            exception,
        });
        debug!(
            session = self.id,
            thread = ?thread,
            location = %location,
            ?anchor,
            breakpoints = event.breakpoint_count(),
            "suspended"
        );
        self.suspended.write().insert(thread, event.clone());
        {
            let _resume = SuspendedReset {
                session: self,
                thread,
            };
            (self.callback)(&event);
        }
        let outcome = event.dispose();
        if self.is_closed() {
            debug!(session = self.id, thread = ?thread, "session closed while suspended");
            return Ok(outcome.return_value);
        }
        let next = outcome.next.unwrap_or_else(SteppingStrategy::proceed);
        let (kill, unwind) = self.install_next(thread, next, point.context, anchor);
        debug!(session = self.id, thread = ?thread, kill, unwind = ?unwind, "resumed");

        if kill || unwind.is_some() {
            self.discard_visit(thread);
        }
        if kill {
            return Err(Interrupt::Kill(KillSignal {
                location: Some(location.into()),
            }));
        }
        if let Some(depth) = unwind {
            return Err(Interrupt::Unwind(UnwindSignal { depth }));
        }
        Ok(outcome.return_value)
    }

    /// Forget what the interrupted visit of `thread` left for listeners the
    /// host will no longer notify: duplicate marks in every session and hit
    /// outcomes cached on breakpoints.
    fn discard_visit(&self, thread: ThreadId) {
        for session in self.debugger.live_sessions() {
            session.clear_duplicates(thread);
            let local: Vec<Breakpoint> = session.breakpoints.lock().values().cloned().collect();
            for breakpoint in local {
                breakpoint.shared().forget_visit(thread);
            }
        }
        let global = self.debugger.global_breakpoints();
        for breakpoint in global.iter().chain([self.debugger.always_halt()]) {
            breakpoint.shared().forget_visit(thread);
        }
        trace!(session = self.id, thread = ?thread, "interrupted visit discarded");
    }

    /// Install the strategy prepared during the suspension, unless a
    /// suspension of this thread was requested while it was suspended.
    fn install_next(
        &self,
        thread: ThreadId,
        mut next: SteppingStrategy,
        context: &dyn EventContext,
        anchor: SuspendAnchor,
    ) -> (bool, Option<u32>) {
        if next.is_kill() {
            self.set_strategy(thread, SteppingStrategy::proceed(), true);
            return (true, None);
        }
        if let Some(current) = self.strategy_slot(thread) {
            let mut strategy = current.lock();
            if !strategy.is_consumed() {
                strategy.initialize(context, anchor);
                trace!(session = self.id, %strategy, "keeping strategy requested while suspended");
                drop(strategy);
                self.update_stepping();
                return (false, None);
            }
        }
        next.initialize(context, anchor);
        let unwind = next.unwind_frame();
        self.set_strategy(thread, next, true);
        (false, unwind)
    }
}

/// Removes the thread's suspended event, also when the callback panics.
struct SuspendedReset<'a> {
    session: &'a SessionShared,
    thread: ThreadId,
}

impl Drop for SuspendedReset<'_> {
    fn drop(&mut self) {
        self.session.suspended.write().remove(&self.thread);
    }
}
