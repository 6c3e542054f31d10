//! Per-thread stepping state machine.

use std::fmt;

use smol_str::SmolStr;

use crate::error::DebugError;
use crate::host::{EventContext, UnwindAction};
use crate::source::{SourceElement, SuspendAnchor, Tags};

use super::config::StepConfig;

/// Current stepping intent of one thread in one session.
#[derive(Debug)]
pub(crate) struct SteppingStrategy {
    kind: Kind,
    consumed: bool,
}

#[derive(Debug)]
enum Kind {
    Continue,
    AlwaysHalt,
    Kill,
    StepInto(StepInto),
    StepOver(StepOver),
    StepOut(StepOut),
    Unwind(Unwind),
    Composed(Box<Link>),
}

#[derive(Debug)]
struct StepInto {
    config: StepConfig,
    depth: i32,
    remaining: u32,
}

#[derive(Debug)]
struct StepOver {
    config: StepConfig,
    depth: i32,
    expressions: i32,
    active_frame: bool,
    active_expression: bool,
    remaining: u32,
}

#[derive(Debug)]
struct StepOut {
    config: StepConfig,
    depth: i32,
    expressions: Option<i32>,
    active_frame: bool,
    active_expression: bool,
    remaining: u32,
}

#[derive(Debug)]
struct Unwind {
    frame: u32,
    depth: i32,
}

/// Element of a composed queue; the head owns the rest of the queue.
#[derive(Debug)]
struct Link {
    kind: Kind,
    next: Option<Box<Link>>,
}

impl Link {
    fn push(&mut self, kind: Kind) {
        match &mut self.next {
            Some(next) => next.push(kind),
            None => self.next = Some(Box::new(Link { kind, next: None })),
        }
    }
}

impl SteppingStrategy {
    fn new(kind: Kind) -> Self {
        Self {
            kind,
            consumed: false,
        }
    }

    pub(crate) fn proceed() -> Self {
        Self::new(Kind::Continue)
    }

    pub(crate) fn always_halt() -> Self {
        Self::new(Kind::AlwaysHalt)
    }

    pub(crate) fn kill() -> Self {
        Self::new(Kind::Kill)
    }

    pub(crate) fn step_into(config: StepConfig) -> Self {
        let remaining = config.step_count();
        Self::new(Kind::StepInto(StepInto {
            config,
            depth: 0,
            remaining,
        }))
    }

    pub(crate) fn step_over(config: StepConfig) -> Self {
        let remaining = config.step_count();
        Self::new(Kind::StepOver(StepOver {
            config,
            depth: 0,
            expressions: -1,
            active_frame: true,
            active_expression: true,
            remaining,
        }))
    }

    pub(crate) fn step_out(config: StepConfig) -> Self {
        let remaining = config.step_count();
        Self::new(Kind::StepOut(StepOut {
            config,
            depth: 0,
            expressions: None,
            active_frame: false,
            active_expression: false,
            remaining,
        }))
    }

    /// Unwind the stack and re-enter the frame at `frame` (0 is the top frame).
    pub(crate) fn unwind(frame: u32) -> Self {
        Self::new(Kind::Unwind(Unwind { frame, depth: 1 }))
    }

    pub(crate) fn consume(&mut self) {
        self.consumed = true;
    }

    pub(crate) fn is_consumed(&self) -> bool {
        self.consumed
    }

    pub(crate) fn is_active(&self, context: &dyn EventContext, anchor: SuspendAnchor) -> bool {
        self.kind.is_active(context, anchor)
    }

    /// Whether the point completes the step and should suspend.
    pub(crate) fn step(
        &mut self,
        elements: &[SourceElement],
        context: &dyn EventContext,
        anchor: SuspendAnchor,
    ) -> bool {
        self.kind.step(elements, context, anchor)
    }

    pub(crate) fn notify_call_entry(&mut self) {
        self.kind.notify_call_entry();
    }

    pub(crate) fn notify_call_exit(&mut self) {
        self.kind.notify_call_exit();
    }

    pub(crate) fn notify_node_entry(&mut self, context: &dyn EventContext) {
        if context.has_tag(Tags::EXPRESSION) {
            self.kind.notify_expression_entry();
        }
    }

    pub(crate) fn notify_node_exit(&mut self, context: &dyn EventContext) {
        if context.has_tag(Tags::EXPRESSION) {
            self.kind.notify_expression_exit();
        }
    }

    pub(crate) fn notify_on_unwind(&mut self) -> UnwindAction {
        self.kind.notify_on_unwind()
    }

    pub(crate) fn is_stop_after_call(&self) -> bool {
        self.kind.is_stop_after_call()
    }

    /// Reset counters relative to the point the thread was suspended at.
    pub(crate) fn initialize(&mut self, context: &dyn EventContext, anchor: SuspendAnchor) {
        self.kind.initialize(context, anchor);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.kind.is_done()
    }

    pub(crate) fn is_kill(&self) -> bool {
        matches!(self.kind.head(), Kind::Kill)
    }

    /// Frame to re-enter when the strategy is an unwind.
    pub(crate) fn unwind_frame(&self) -> Option<u32> {
        match self.kind.head() {
            Kind::Unwind(unwind) => Some(unwind.frame),
            _ => None,
        }
    }

    pub(crate) fn is_unwind(&self) -> bool {
        self.unwind_frame().is_some()
    }

    fn is_terminal(&self) -> bool {
        matches!(self.kind, Kind::Continue | Kind::Kill)
    }

    fn is_stepping(&self) -> bool {
        !self.is_terminal()
    }

    fn name(&self) -> SmolStr {
        self.kind.name()
    }

    /// Append `next` so that it starts once `self` completes.
    fn then(self, next: SteppingStrategy) -> SteppingStrategy {
        let mut head = match self.kind {
            Kind::Composed(head) => head,
            kind => Box::new(Link { kind, next: None }),
        };
        match next.kind {
            Kind::Composed(mut other) => loop {
                let rest = other.next.take();
                head.push(other.kind);
                match rest {
                    Some(link) => other = link,
                    None => break,
                }
            },
            kind => head.push(kind),
        }
        SteppingStrategy::new(Kind::Composed(head))
    }
}

/// Record a client preparation on top of the ones already made during a
/// suspension.
///
/// Steps queue up behind each other. Continue, kill and unwind replace the
/// pending steps; after continue or kill no further step may be queued, and
/// kill can only be prepared once.
pub(crate) fn prepare(
    slot: &mut Option<SteppingStrategy>,
    next: SteppingStrategy,
) -> Result<(), DebugError> {
    let Some(current) = slot.take() else {
        *slot = Some(next);
        return Ok(());
    };
    let merged = if current.is_kill() {
        let name = next.name();
        *slot = Some(current);
        return Err(DebugError::StepAfterTerminal(name));
    } else if next.is_terminal() || next.is_unwind() {
        if current.is_terminal() && next.is_unwind() {
            let name = next.name();
            *slot = Some(current);
            return Err(DebugError::StepAfterTerminal(name));
        }
        next
    } else if current.is_terminal() {
        let name = next.name();
        *slot = Some(current);
        return Err(DebugError::StepAfterTerminal(name));
    } else {
        debug_assert!(current.is_stepping());
        current.then(next)
    };
    *slot = Some(merged);
    Ok(())
}

impl Kind {
    fn head(&self) -> &Kind {
        match self {
            Kind::Composed(link) => &link.kind,
            kind => kind,
        }
    }

    fn name(&self) -> SmolStr {
        SmolStr::new_static(match self.head() {
            Kind::Continue => "continue",
            Kind::AlwaysHalt => "halt",
            Kind::Kill => "kill",
            Kind::StepInto(_) => "step into",
            Kind::StepOver(_) => "step over",
            Kind::StepOut(_) => "step out",
            Kind::Unwind(_) => "unwind",
            Kind::Composed(_) => "composed",
        })
    }

    fn is_active(&self, context: &dyn EventContext, anchor: SuspendAnchor) -> bool {
        match self {
            Kind::Continue | Kind::Unwind(_) => false,
            Kind::AlwaysHalt => anchor == SuspendAnchor::Before,
            Kind::Kill | Kind::StepInto(_) => true,
            Kind::StepOver(over) => over.active_frame && over.active_expression,
            Kind::StepOut(out) => out.active_frame || out.active_expression,
            Kind::Composed(link) => link.kind.is_active(context, anchor),
        }
    }

    fn step(
        &mut self,
        elements: &[SourceElement],
        context: &dyn EventContext,
        anchor: SuspendAnchor,
    ) -> bool {
        match self {
            Kind::Continue => false,
            Kind::AlwaysHalt => anchor == SuspendAnchor::Before,
            Kind::Kill | Kind::Unwind(_) => true,
            Kind::StepInto(into) => {
                let returned = anchor == SuspendAnchor::After && into.depth < 0;
                if returned || into.config.matches(elements, context, anchor) {
                    into.depth = 0;
                    into.remaining = into.remaining.saturating_sub(1);
                    into.remaining == 0
                } else {
                    false
                }
            }
            Kind::StepOver(over) => {
                let returned = anchor == SuspendAnchor::After && over.depth < 0;
                let matched = over.active_frame
                    && over.active_expression
                    && over.config.matches(elements, context, anchor);
                if returned || matched {
                    over.depth = 0;
                    over.active_frame = true;
                    over.remaining = over.remaining.saturating_sub(1);
                    over.remaining == 0
                } else {
                    false
                }
            }
            Kind::StepOut(out) => {
                let active = out.active_frame || out.active_expression;
                if active
                    && (anchor == SuspendAnchor::After
                        || out.config.matches(elements, context, anchor))
                {
                    out.depth = 0;
                    out.expressions = out.expressions.map(|_| 0);
                    out.active_frame = false;
                    out.active_expression = false;
                    out.remaining = out.remaining.saturating_sub(1);
                    out.remaining == 0
                } else {
                    false
                }
            }
            Kind::Composed(link) => {
                if !link.kind.step(elements, context, anchor) {
                    return false;
                }
                match link.next.take() {
                    None => true,
                    Some(next) => {
                        **link = *next;
                        link.kind.initialize(context, anchor);
                        false
                    }
                }
            }
        }
    }

    fn notify_call_entry(&mut self) {
        match self {
            Kind::StepInto(into) => into.depth += 1,
            Kind::StepOver(over) => {
                over.depth += 1;
                over.active_frame = over.depth <= 0;
            }
            Kind::StepOut(out) => {
                out.depth += 1;
                out.active_frame = out.depth < 0;
            }
            Kind::Composed(link) => link.kind.notify_call_entry(),
            _ => {}
        }
    }

    fn notify_call_exit(&mut self) {
        match self {
            Kind::StepInto(into) => into.depth -= 1,
            Kind::StepOver(over) => {
                over.depth -= 1;
                over.active_frame = over.depth <= 0;
            }
            Kind::StepOut(out) => {
                out.depth -= 1;
                if out.depth < 0 {
                    out.active_frame = true;
                }
            }
            Kind::Composed(link) => link.kind.notify_call_exit(),
            _ => {}
        }
    }

    fn notify_expression_entry(&mut self) {
        match self {
            Kind::StepOver(over) => {
                over.expressions += 1;
                over.active_expression = over.expressions <= 0;
            }
            Kind::StepOut(out) => {
                if let Some(expressions) = out.expressions.as_mut() {
                    *expressions += 1;
                }
            }
            Kind::Composed(link) => link.kind.notify_expression_entry(),
            _ => {}
        }
    }

    fn notify_expression_exit(&mut self) {
        match self {
            Kind::StepOver(over) => {
                over.expressions -= 1;
                over.active_expression = over.expressions <= 0;
            }
            Kind::StepOut(out) => {
                if let Some(expressions) = out.expressions.as_mut() {
                    *expressions -= 1;
                    if *expressions < 0 {
                        out.active_expression = true;
                    }
                }
            }
            Kind::Composed(link) => link.kind.notify_expression_exit(),
            _ => {}
        }
    }

    fn notify_on_unwind(&mut self) -> UnwindAction {
        match self {
            Kind::Unwind(unwind) => {
                unwind.depth -= 1;
                if unwind.depth == -(unwind.frame as i32) {
                    UnwindAction::Reenter
                } else {
                    UnwindAction::Continue
                }
            }
            Kind::Composed(link) => link.kind.notify_on_unwind(),
            _ => UnwindAction::Continue,
        }
    }

    fn is_stop_after_call(&self) -> bool {
        match self {
            Kind::StepInto(into) => into.depth < 0,
            Kind::StepOver(over) => over.depth < 0,
            Kind::StepOut(out) => out.active_frame,
            Kind::Composed(link) => link.kind.is_stop_after_call(),
            _ => false,
        }
    }

    fn initialize(&mut self, context: &dyn EventContext, anchor: SuspendAnchor) {
        let before_expression =
            context.has_tag(Tags::EXPRESSION) && anchor == SuspendAnchor::Before;
        match self {
            Kind::StepInto(into) => into.depth = 0,
            Kind::StepOver(over) => {
                over.depth = 0;
                over.expressions = if before_expression { 0 } else { -1 };
                over.active_frame = true;
                over.active_expression = true;
            }
            Kind::StepOut(out) => {
                out.depth = 0;
                out.expressions = context.has_tag(Tags::EXPRESSION).then_some(0);
                out.active_frame = false;
                out.active_expression = false;
            }
            Kind::Unwind(unwind) => unwind.depth = 1,
            Kind::Composed(link) => link.kind.initialize(context, anchor),
            Kind::Continue | Kind::AlwaysHalt | Kind::Kill => {}
        }
    }

    fn is_done(&self) -> bool {
        match self {
            Kind::Continue | Kind::Kill => true,
            Kind::Composed(link) => link.next.is_none() && link.kind.is_done(),
            _ => false,
        }
    }
}

impl fmt::Display for SteppingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Continue => f.write_str("CONTINUE"),
            Kind::AlwaysHalt => f.write_str("HALT"),
            Kind::Kill => f.write_str("KILL"),
            Kind::StepInto(into) => write!(
                f,
                "STEP_INTO(depth={}, remaining={})",
                into.depth, into.remaining
            ),
            Kind::StepOver(over) => write!(
                f,
                "STEP_OVER(depth={}, expressions={}, remaining={})",
                over.depth, over.expressions, over.remaining
            ),
            Kind::StepOut(out) => write!(
                f,
                "STEP_OUT(depth={}, remaining={})",
                out.depth, out.remaining
            ),
            Kind::Unwind(unwind) => write!(f, "UNWIND(frame={})", unwind.frame),
            Kind::Composed(link) => {
                f.write_str("COMPOSED[")?;
                let mut current = Some(link.as_ref());
                let mut first = true;
                while let Some(link) = current {
                    if !first {
                        f.write_str(" -> ")?;
                    }
                    first = false;
                    write!(f, "{}", link.kind)?;
                    current = link.next.as_deref();
                }
                f.write_str("]")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use expect_test::expect;

    use super::*;
    use crate::host::NodeId;
    use crate::source::SourceSection;

    struct Point(Tags);

    impl EventContext for Point {
        fn node_id(&self) -> NodeId {
            NodeId(7)
        }

        fn tags(&self) -> Tags {
            self.0
        }

        fn source_section(&self) -> Option<&SourceSection> {
            None
        }
    }

    const STATEMENTS: &[SourceElement] = &[SourceElement::Statement];
    const WITH_EXPRESSIONS: &[SourceElement] = &[SourceElement::Statement, SourceElement::Expression];

    fn statement() -> Point {
        Point(Tags::STATEMENT)
    }

    fn call() -> Point {
        Point(Tags::CALL)
    }

    fn initialized(mut strategy: SteppingStrategy) -> SteppingStrategy {
        strategy.initialize(&statement(), SuspendAnchor::Before);
        strategy
    }

    #[test]
    fn continue_never_stops() {
        let mut strategy = SteppingStrategy::proceed();
        assert!(strategy.is_done());
        assert!(!strategy.is_active(&statement(), SuspendAnchor::Before));
        assert!(!strategy.step(STATEMENTS, &statement(), SuspendAnchor::Before));
    }

    #[test]
    fn always_halt_stops_only_before() {
        let mut strategy = SteppingStrategy::always_halt();
        assert!(!strategy.is_done());
        assert!(strategy.step(STATEMENTS, &statement(), SuspendAnchor::Before));
        assert!(!strategy.step(STATEMENTS, &call(), SuspendAnchor::After));
    }

    #[test]
    fn step_into_stops_at_next_statement_in_callee() {
        let mut strategy = initialized(SteppingStrategy::step_into(StepConfig::default()));
        strategy.notify_call_entry();
        assert!(strategy.step(STATEMENTS, &statement(), SuspendAnchor::Before));
    }

    #[test]
    fn step_into_repeats_count_times() {
        let mut strategy =
            initialized(SteppingStrategy::step_into(StepConfig::count(3).unwrap()));
        assert!(!strategy.step(STATEMENTS, &statement(), SuspendAnchor::Before));
        strategy.notify_call_entry();
        assert!(!strategy.step(STATEMENTS, &statement(), SuspendAnchor::Before));
        assert!(strategy.step(STATEMENTS, &statement(), SuspendAnchor::Before));
    }

    #[test]
    fn step_into_stops_after_returning_past_start() {
        let mut strategy = initialized(SteppingStrategy::step_into(StepConfig::default()));
        strategy.notify_call_exit();
        assert!(strategy.is_stop_after_call());
        assert!(strategy.step(STATEMENTS, &call(), SuspendAnchor::After));
    }

    #[test]
    fn step_over_skips_balanced_nested_calls() {
        let mut strategy = initialized(SteppingStrategy::step_over(StepConfig::default()));
        for _ in 0..3 {
            strategy.notify_call_entry();
            assert!(!strategy.is_active(&statement(), SuspendAnchor::Before));
            assert!(!strategy.step(STATEMENTS, &statement(), SuspendAnchor::Before));
            strategy.notify_call_entry();
            assert!(!strategy.step(STATEMENTS, &statement(), SuspendAnchor::Before));
            strategy.notify_call_exit();
            strategy.notify_call_exit();
            assert!(!strategy.is_stop_after_call());
            assert!(!strategy.step(STATEMENTS, &call(), SuspendAnchor::After));
        }
        assert!(strategy.step(STATEMENTS, &statement(), SuspendAnchor::Before));
    }

    #[test]
    fn step_over_stops_on_early_return() {
        let mut strategy = initialized(SteppingStrategy::step_over(StepConfig::default()));
        strategy.notify_call_exit();
        assert!(strategy.is_stop_after_call());
        assert!(strategy.step(STATEMENTS, &call(), SuspendAnchor::After));
    }

    #[test]
    fn step_over_expression_stops_after_it() {
        let expression = Point(Tags::EXPRESSION);
        let child = Point(Tags::EXPRESSION);
        let mut strategy = SteppingStrategy::step_over(StepConfig::default());
        strategy.initialize(&expression, SuspendAnchor::Before);
        strategy.notify_node_entry(&expression);
        strategy.notify_node_entry(&child);
        assert!(!strategy.step(WITH_EXPRESSIONS, &child, SuspendAnchor::Before));
        strategy.notify_node_exit(&child);
        assert!(!strategy.step(WITH_EXPRESSIONS, &child, SuspendAnchor::After));
        strategy.notify_node_exit(&expression);
        assert!(strategy.step(WITH_EXPRESSIONS, &expression, SuspendAnchor::After));
    }

    #[test]
    fn step_out_waits_for_caller() {
        let mut strategy = initialized(SteppingStrategy::step_out(StepConfig::default()));
        assert!(!strategy.step(STATEMENTS, &statement(), SuspendAnchor::Before));
        strategy.notify_call_entry();
        strategy.notify_call_exit();
        assert!(!strategy.is_stop_after_call());
        strategy.notify_call_exit();
        assert!(strategy.is_stop_after_call());
        assert!(strategy.step(STATEMENTS, &call(), SuspendAnchor::After));
    }

    #[test]
    fn unwind_reenters_target_frame() {
        let mut strategy = SteppingStrategy::unwind(2);
        strategy.initialize(&statement(), SuspendAnchor::Before);
        assert!(strategy.is_unwind());
        assert_eq!(strategy.notify_on_unwind(), UnwindAction::Continue);
        assert_eq!(strategy.notify_on_unwind(), UnwindAction::Continue);
        assert_eq!(strategy.notify_on_unwind(), UnwindAction::Reenter);
    }

    #[test]
    fn unwind_top_frame_reenters_immediately() {
        let mut strategy = SteppingStrategy::unwind(0);
        strategy.initialize(&statement(), SuspendAnchor::Before);
        assert_eq!(strategy.notify_on_unwind(), UnwindAction::Reenter);
        assert!(strategy.step(STATEMENTS, &statement(), SuspendAnchor::Before));
    }

    #[test]
    fn kill_is_done_and_stops() {
        let mut strategy = SteppingStrategy::kill();
        assert!(strategy.is_done());
        assert!(strategy.is_kill());
        assert!(strategy.step(STATEMENTS, &statement(), SuspendAnchor::Before));
    }

    #[test]
    fn composed_reports_only_the_last_completion() {
        let mut slot = None;
        prepare(&mut slot, SteppingStrategy::step_over(StepConfig::default())).unwrap();
        prepare(&mut slot, SteppingStrategy::step_into(StepConfig::default())).unwrap();
        let mut strategy = slot.unwrap();
        assert!(matches!(strategy.kind, Kind::Composed(_)));
        strategy.initialize(&statement(), SuspendAnchor::Before);

        strategy.notify_call_entry();
        assert!(!strategy.step(STATEMENTS, &statement(), SuspendAnchor::Before));
        strategy.notify_call_exit();
        assert!(!strategy.step(STATEMENTS, &statement(), SuspendAnchor::Before));
        assert!(!strategy.is_done());
        strategy.notify_call_entry();
        assert!(strategy.step(STATEMENTS, &statement(), SuspendAnchor::Before));
    }

    #[test]
    fn prepare_rejects_steps_after_terminal() {
        let mut slot = None;
        prepare(&mut slot, SteppingStrategy::proceed()).unwrap();
        let err = prepare(&mut slot, SteppingStrategy::step_into(StepConfig::default()))
            .unwrap_err();
        assert_eq!(err, DebugError::StepAfterTerminal("step into".into()));
        prepare(&mut slot, SteppingStrategy::kill()).unwrap();
        assert!(prepare(&mut slot, SteppingStrategy::kill()).is_err());
        assert!(prepare(&mut slot, SteppingStrategy::proceed()).is_err());
        assert!(slot.unwrap().is_kill());
    }

    #[test]
    fn prepare_terminal_replaces_pending_steps() {
        let mut slot = None;
        prepare(&mut slot, SteppingStrategy::step_over(StepConfig::default())).unwrap();
        prepare(&mut slot, SteppingStrategy::unwind(1)).unwrap();
        prepare(&mut slot, SteppingStrategy::step_into(StepConfig::default())).unwrap();
        let strategy = slot.unwrap();
        assert_eq!(strategy.unwind_frame(), Some(1));
        expect![["COMPOSED[UNWIND(frame=1) -> STEP_INTO(depth=0, remaining=1)]"]]
            .assert_eq(&strategy.to_string());
    }
}
