use std::sync::{OnceLock, Weak};

use crate::error::Interrupt;
use crate::host::{BindingId, ExecutionEventListener, ExecutionPoint, UnwindAction};
use crate::source::{SuspendAnchor, Tags};
use crate::value::{GuestException, Value};

use super::{Dispatch, Phase, SessionShared};

/// Tracks call depth for the session's stepping strategies.
///
/// Attached at every root before the stepping node so that a frame is
/// counted before its first statement is stepped on.
pub(super) struct RootDepthNode {
    session: Weak<SessionShared>,
}

impl RootDepthNode {
    pub(super) fn new(session: Weak<SessionShared>) -> Self {
        Self { session }
    }

    fn with_stepping(&self, f: impl FnOnce(&SessionShared, std::thread::ThreadId)) {
        if let Some(session) = self.session.upgrade() {
            if session.is_stepping() {
                f(&session, std::thread::current().id());
            }
        }
    }
}

impl ExecutionEventListener for RootDepthNode {
    fn on_enter(&self, _point: ExecutionPoint<'_>) -> Result<(), Interrupt> {
        self.with_stepping(|session, thread| {
            session.with_strategy(thread, |strategy| strategy.notify_call_entry());
        });
        Ok(())
    }

    fn on_return_value(
        &self,
        _point: ExecutionPoint<'_>,
        _value: &Value,
    ) -> Result<Option<Value>, Interrupt> {
        self.with_stepping(|session, thread| {
            session.with_strategy(thread, |strategy| strategy.notify_call_exit());
        });
        Ok(None)
    }

    fn on_return_exceptional(
        &self,
        _point: ExecutionPoint<'_>,
        _exception: &std::sync::Arc<GuestException>,
    ) -> Result<(), Interrupt> {
        self.with_stepping(|session, thread| {
            session.with_strategy(thread, |strategy| strategy.notify_call_exit());
        });
        Ok(())
    }

    fn on_unwind(&self, point: ExecutionPoint<'_>) -> Result<UnwindAction, Interrupt> {
        let Some(session) = self.session.upgrade() else {
            return Ok(UnwindAction::Continue);
        };
        if !session.is_stepping() {
            return Ok(UnwindAction::Continue);
        }
        let thread = std::thread::current().id();
        let action = session
            .with_strategy(thread, |strategy| strategy.notify_on_unwind())
            .unwrap_or(UnwindAction::Continue);
        if action == UnwindAction::Reenter {
            session.notify_unwind_callback(point)?;
        }
        Ok(action)
    }
}

/// Suspends at stepping locations.
///
/// Attached at the session's source elements and at calls, which it needs
/// to stop after returning into the caller.
pub(super) struct SteppingNode {
    session: Weak<SessionShared>,
    binding: OnceLock<BindingId>,
}

impl SteppingNode {
    pub(super) fn new(session: Weak<SessionShared>) -> Self {
        Self {
            session,
            binding: OnceLock::new(),
        }
    }

    pub(super) fn bind(&self, binding: BindingId) {
        let _ = self.binding.set(binding);
    }

    fn consume_duplicate(&self, session: &SessionShared, point: ExecutionPoint<'_>, phase: Phase) -> bool {
        match self.binding.get() {
            Some(binding) => session.consume_duplicate(
                std::thread::current().id(),
                *binding,
                point.context.node_id(),
                phase,
            ),
            None => false,
        }
    }
}

impl ExecutionEventListener for SteppingNode {
    fn on_enter(&self, point: ExecutionPoint<'_>) -> Result<(), Interrupt> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        let duplicate = self.consume_duplicate(&session, point, Phase::Enter);
        if !session.is_stepping() {
            return Ok(());
        }
        let thread = std::thread::current().id();
        let context = point.context;
        if !duplicate
            && context.has_tag(session.element_tags())
            && session.wants_step(thread, context, SuspendAnchor::Before)
        {
            session.dispatch(Dispatch {
                source: self.binding.get().copied(),
                point,
                phase: Phase::Enter,
                return_value: None,
                exception: None,
                fired: None,
            })?;
        }
        session.with_strategy(thread, |strategy| strategy.notify_node_entry(context));
        Ok(())
    }

    fn on_return_value(
        &self,
        point: ExecutionPoint<'_>,
        value: &Value,
    ) -> Result<Option<Value>, Interrupt> {
        let Some(session) = self.session.upgrade() else {
            return Ok(None);
        };
        let duplicate = self.consume_duplicate(&session, point, Phase::Return);
        if duplicate || !session.is_stepping() {
            return Ok(None);
        }
        let thread = std::thread::current().id();
        let context = point.context;
        session.with_strategy(thread, |strategy| strategy.notify_node_exit(context));

        let after_call = context.has_tag(Tags::CALL)
            && session
                .with_strategy(thread, |strategy| strategy.is_stop_after_call())
                .unwrap_or(false);
        let after_element = context
            .has_tag(session.element_tags() & (Tags::EXPRESSION | Tags::ROOT))
            && session.wants_step(thread, context, SuspendAnchor::After);
        if !after_call && !after_element {
            return Ok(None);
        }
        session.dispatch(Dispatch {
            source: self.binding.get().copied(),
            point,
            phase: Phase::Return,
            return_value: Some(value),
            exception: None,
            fired: None,
        })
    }

    fn on_return_exceptional(
        &self,
        point: ExecutionPoint<'_>,
        _exception: &std::sync::Arc<GuestException>,
    ) -> Result<(), Interrupt> {
        let Some(session) = self.session.upgrade() else {
            return Ok(());
        };
        let duplicate = self.consume_duplicate(&session, point, Phase::Exceptional);
        if duplicate || !session.is_stepping() {
            return Ok(());
        }
        let context = point.context;
        session.with_strategy(std::thread::current().id(), |strategy| {
            strategy.notify_node_exit(context)
        });
        Ok(())
    }
}
