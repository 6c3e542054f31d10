use std::sync::{Arc, OnceLock, Weak};

use crate::error::Interrupt;
use crate::host::{BindingId, ExecutionEventListener, ExecutionPoint, SourceListener};
use crate::session::{Dispatch, Phase};
use crate::source::LoadedSource;
use crate::value::{GuestException, Value};

use super::{Breakpoint, BreakpointShared, Hit};

/// Listener attached at a breakpoint's location.
///
/// The hit (condition and counters) is evaluated once per visit and then
/// reported to every session observing the breakpoint. A session dispatch
/// that reached the point first leaves its outcome to be reused here.
pub(crate) struct BreakpointNode {
    breakpoint: Arc<BreakpointShared>,
    binding: OnceLock<BindingId>,
}

impl BreakpointNode {
    pub(super) fn new(breakpoint: Arc<BreakpointShared>) -> Self {
        Self {
            breakpoint,
            binding: OnceLock::new(),
        }
    }

    pub(super) fn bind(&self, binding: BindingId) {
        let _ = self.binding.set(binding);
    }

    fn break_at(
        &self,
        point: ExecutionPoint<'_>,
        phase: Phase,
        return_value: Option<&Value>,
        exception: Option<&Arc<GuestException>>,
    ) -> Result<Option<Value>, Interrupt> {
        let breakpoint = &self.breakpoint;
        let thread = std::thread::current().id();
        let node = point.context.node_id();
        let binding = self.binding.get().copied();

        let evaluated = breakpoint.take_visit(thread, node, phase);
        let mut targets = Vec::new();
        for session in breakpoint.sessions() {
            if let Some(binding) = binding {
                if session.consume_duplicate(thread, binding, node, phase) {
                    continue;
                }
            }
            if breakpoint.handles(phase) && session.accepts_hit(thread, breakpoint.kind()) {
                targets.push(session);
            }
        }
        if targets.is_empty() {
            return Ok(None);
        }
        let hit = match evaluated {
            Some(hit) => hit,
            None => breakpoint.evaluate_visit(point, exception, &targets),
        };
        let Hit::Fired(failure) = hit else {
            return Ok(None);
        };

        let handle = Breakpoint::from_shared(breakpoint.clone());
        let mut replaced = None;
        for session in &targets {
            let dispatch = Dispatch {
                source: binding,
                point,
                phase,
                return_value,
                exception,
                fired: Some((handle.clone(), failure.clone())),
            };
            if let Some(value) = session.dispatch(dispatch)? {
                replaced = Some(value);
            }
        }
        Ok(replaced)
    }
}

impl ExecutionEventListener for BreakpointNode {
    fn on_enter(&self, point: ExecutionPoint<'_>) -> Result<(), Interrupt> {
        self.break_at(point, Phase::Enter, None, None).map(|_| ())
    }

    fn on_return_value(
        &self,
        point: ExecutionPoint<'_>,
        value: &Value,
    ) -> Result<Option<Value>, Interrupt> {
        self.break_at(point, Phase::Return, Some(value), None)
    }

    fn on_return_exceptional(
        &self,
        point: ExecutionPoint<'_>,
        exception: &Arc<GuestException>,
    ) -> Result<(), Interrupt> {
        self.break_at(point, Phase::Exceptional, None, Some(exception))
            .map(|_| ())
    }
}

/// Resolves a line breakpoint when its source gets loaded.
pub(crate) struct SourceResolver {
    breakpoint: Weak<BreakpointShared>,
    generation: u64,
}

impl SourceResolver {
    pub(super) fn new(breakpoint: Weak<BreakpointShared>, generation: u64) -> Self {
        Self {
            breakpoint,
            generation,
        }
    }
}

impl SourceListener for SourceResolver {
    fn on_source_loaded(&self, source: &LoadedSource) {
        if let Some(breakpoint) = self.breakpoint.upgrade() {
            breakpoint.on_source_loaded(self.generation, source);
        }
    }
}
