mod common;

use std::sync::{Arc, Mutex};

use arbor_debug::harness::RunError;
use arbor_debug::{
    Breakpoint, DebugError, KillSignal, SourceElement, StepConfig, SuspendAnchor,
    SuspensionFilter, Value,
};
use common::{host, lines, recording_session, recording_session_with_elements, stop, CALLS};

const FACT: &str = "\
fn main() {
    r = fact(3)
    return r
}
fn fact(n) {
    if n <= 1 {
        return 1
    }
    m = fact(n - 1)
    return n * m
}
";

fn line_bp(line: u32) -> Breakpoint {
    Breakpoint::builder("main.arb").line_is(line).build().unwrap()
}

#[test]
fn step_into_enters_the_callee() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |event, index| {
        if index == 0 {
            event.prepare_step_into(StepConfig::default()).unwrap();
        }
    });
    session.install(&line_bp(3)).unwrap();

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![3, 8]);
    let second = stop(&stops, 1);
    assert!(second.breakpoints.is_empty());
    assert_eq!(second.anchor, SuspendAnchor::Before);
}

#[test]
fn step_over_skips_the_callee() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |event, index| {
        if index < 2 {
            event.prepare_step_over(StepConfig::default()).unwrap();
        }
    });
    session.install(&line_bp(3)).unwrap();

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![3, 4, 5]);
}

#[test]
fn step_out_stops_after_the_call() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |event, index| {
        if index == 0 {
            event.prepare_step_out(StepConfig::default()).unwrap();
        }
    });
    session.install(&line_bp(8)).unwrap();

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![8, 3]);
    let after_call = stop(&stops, 1);
    assert_eq!(after_call.column, 9);
    assert_eq!(after_call.anchor, SuspendAnchor::After);
    assert_eq!(after_call.return_value, Some(Value::Int(3)));
}

#[test]
fn step_count_stops_at_the_nth_element() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |event, index| {
        if index == 0 {
            event.prepare_step_into(StepConfig::count(3).unwrap()).unwrap();
        }
    });
    session.install(&line_bp(2)).unwrap();

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![2, 9]);
}

#[test]
fn step_over_stays_in_the_recursive_frame() {
    let host = host(FACT);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let captured = seen.clone();
    let (session, stops) = recording_session(&host, move |event, index| {
        let n = event.top_stack_frame().unwrap().local("n").unwrap();
        captured.lock().unwrap().push(n);
        if index == 0 {
            event.prepare_step_over(StepConfig::default()).unwrap();
        }
    });
    session
        .install(
            &Breakpoint::builder("main.arb")
                .line_is(9)
                .one_shot()
                .build()
                .unwrap(),
        )
        .unwrap();

    assert_eq!(host.call("main", vec![]).unwrap(), Value::Int(6));

    assert_eq!(lines(&stops), vec![9, 10]);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![Some(Value::Int(3)), Some(Value::Int(3))]
    );
}

#[test]
fn step_out_of_recursion_returns_one_level() {
    let host = host(FACT);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let captured = seen.clone();
    let (session, stops) = recording_session(&host, move |event, index| {
        let n = event.top_stack_frame().unwrap().local("n").unwrap();
        captured.lock().unwrap().push(n);
        if index == 0 {
            event.prepare_step_out(StepConfig::default()).unwrap();
        }
    });
    session
        .install(
            &Breakpoint::builder("main.arb")
                .line_is(7)
                .build()
                .unwrap(),
        )
        .unwrap();

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![7, 9]);
    assert_eq!(stop(&stops, 1).anchor, SuspendAnchor::After);
    assert_eq!(stop(&stops, 1).return_value, Some(Value::Int(1)));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![Some(Value::Int(1)), Some(Value::Int(2))]
    );
}

#[test]
fn composed_steps_suspend_once_at_the_final_target() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |event, index| {
        if index == 0 {
            event.prepare_step_over(StepConfig::default()).unwrap();
            event.prepare_step_into(StepConfig::default()).unwrap();
        }
    });
    session.install(&line_bp(3)).unwrap();

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![3, 5]);
}

#[test]
fn breakpoint_inside_stepped_over_call_suspends_first() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |event, index| {
        if index == 0 {
            event.prepare_step_over(StepConfig::default()).unwrap();
        }
    });
    session.install(&line_bp(3)).unwrap();
    let inner = session.install(&line_bp(8)).unwrap();

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![3, 8]);
    assert_eq!(stop(&stops, 1).breakpoints, vec![inner.id()]);
}

#[test]
fn stepping_and_breakpoint_on_same_statement_suspend_once() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |event, index| {
        if index == 0 {
            event.prepare_step_into(StepConfig::default()).unwrap();
        }
    });
    session.install(&line_bp(2)).unwrap();
    let next = session.install(&line_bp(3)).unwrap();

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![2, 3]);
    assert_eq!(stop(&stops, 1).breakpoints, vec![next.id()]);
    assert_eq!(next.hit_count(), 1);
}

#[test]
fn steps_after_continue_are_rejected() {
    let host = host(CALLS);
    let results = Arc::new(Mutex::new(Vec::new()));
    let captured = results.clone();
    let (session, stops) = recording_session(&host, move |event, _| {
        let mut results = captured.lock().unwrap();
        results.push(event.prepare_continue());
        results.push(event.prepare_step_into(StepConfig::default()));
        results.push(event.prepare_continue());
    });
    session.install(&line_bp(3)).unwrap();

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![3]);
    let results = results.lock().unwrap();
    assert_eq!(results[0], Ok(()));
    assert_eq!(
        results[1],
        Err(DebugError::StepAfterTerminal("step into".into()))
    );
    assert!(results[2].is_err());
}

#[test]
fn step_config_is_validated() {
    assert!(matches!(
        StepConfig::count(0),
        Err(DebugError::InvalidArgument(_))
    ));
    assert!(StepConfig::builder()
        .source_elements(&[SourceElement::Statement])
        .suspend_anchors(SourceElement::Expression, &[SuspendAnchor::After])
        .build()
        .is_err());
    assert!(StepConfig::builder()
        .suspend_anchors(SourceElement::Statement, &[SuspendAnchor::After])
        .build()
        .is_err());

    let host = host(CALLS);
    let rejected = Arc::new(Mutex::new(None));
    let captured = rejected.clone();
    let (session, _stops) = recording_session(&host, move |event, _| {
        let config = StepConfig::builder()
            .source_elements(&[SourceElement::Expression])
            .build()
            .unwrap();
        *captured.lock().unwrap() = Some(event.prepare_step_into(config));
    });
    session.install(&line_bp(3)).unwrap();
    host.call("main", vec![]).unwrap();

    assert!(matches!(
        rejected.lock().unwrap().clone(),
        Some(Err(DebugError::InvalidState(_)))
    ));
}

#[test]
fn expression_steps_stop_before_subexpressions() {
    let host = host("fn main() {\n    x = 1 + 2\n    return x\n}\n");
    let (session, stops) = recording_session_with_elements(
        &host,
        &[SourceElement::Statement, SourceElement::Expression],
        |event, index| {
            if index == 0 {
                let config = StepConfig::builder()
                    .source_elements(&[SourceElement::Expression])
                    .build()
                    .unwrap();
                event.prepare_step_into(config).unwrap();
            }
        },
    );
    session.install(&line_bp(2)).unwrap();

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![2, 2]);
    let expression = stop(&stops, 1);
    assert_eq!(expression.column, 9);
    assert_eq!(expression.anchor, SuspendAnchor::Before);
}

#[test]
fn internal_functions_are_stepped_over_by_default() {
    let source = "\
fn main() {
    x = helper(1)
    return x
}
internal fn helper(v) {
    w = v + 1
    return w
}
";
    let host = host(source);
    let (session, stops) = recording_session(&host, |event, index| {
        if index == 0 {
            event.prepare_step_into(StepConfig::default()).unwrap();
        }
    });
    session.install(&line_bp(2)).unwrap();

    host.call("main", vec![]).unwrap();
    assert_eq!(lines(&stops), vec![2, 3]);

    session.set_stepping_filter(SuspensionFilter::builder().include_internal(true).build());
    host.call("main", vec![]).unwrap();
    assert_eq!(lines(&stops), vec![2, 3, 2, 6]);
}

#[test]
fn kill_terminates_the_call_past_guest_handlers() {
    let source = "\
fn main() {
    try {
        x = add(1, 2)
    } catch e {
        print \"caught\"
    }
    return 0
}
fn add(a, b) {
    return a + b
}
";
    let host = host(source);
    let evaluations = Arc::new(Mutex::new(Vec::new()));
    let captured = evaluations.clone();
    let (session, stops) = recording_session(&host, move |event, _| {
        let frame = event.top_stack_frame().unwrap();
        captured.lock().unwrap().push(frame.eval("a + b"));
        event.prepare_kill().unwrap();
        captured.lock().unwrap().push(frame.eval("a + b"));
        assert!(event.prepare_kill().is_err());
    });
    let bp = session.install(&line_bp(10)).unwrap();

    let err = host.call("main", vec![]).unwrap_err();
    let RunError::Killed(signal) = err else {
        panic!("expected kill, got {err:?}");
    };
    assert_eq!(signal.to_string(), KillSignal::MESSAGE);
    assert!(signal.location().is_some_and(|at| at.contains("main.arb:10")));
    assert!(host.output().is_empty());
    assert_eq!(lines(&stops), vec![10]);

    let evaluations = evaluations.lock().unwrap();
    assert_eq!(evaluations[0], Ok(Value::Int(3)));
    match &evaluations[1] {
        Err(DebugError::Evaluation(err)) => assert_eq!(err.message(), KillSignal::MESSAGE),
        other => panic!("unexpected evaluation {other:?}"),
    }

    bp.set_enabled(false).unwrap();
    assert_eq!(host.call("main", vec![]).unwrap(), Value::Int(0));
}

#[test]
fn unwind_reenters_the_top_frame() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |event, index| {
        if index == 0 {
            let frames = event.stack_frames().unwrap();
            assert_eq!(frames[0].name().unwrap().as_deref(), Some("add"));
            event.prepare_unwind_frame(&frames[0]).unwrap();
        }
    });
    let bp = session
        .install(
            &Breakpoint::builder("main.arb")
                .line_is(9)
                .ignore_count(0)
                .build()
                .unwrap(),
        )
        .unwrap();

    assert_eq!(host.call("main", vec![]).unwrap(), Value::Int(3));

    assert_eq!(lines(&stops), vec![9, 7, 9]);
    let unwound = stop(&stops, 1);
    assert_eq!(unwound.anchor, SuspendAnchor::Before);
    assert!(unwound.breakpoints.is_empty());
    assert_eq!(bp.hit_count(), 2);
    assert_eq!(host.output(), vec!["3".to_string()]);
}

#[test]
fn unwind_to_the_caller_reruns_it() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |event, index| {
        if index == 0 {
            let frames = event.stack_frames().unwrap();
            assert_eq!(frames[1].name().unwrap().as_deref(), Some("main"));
            event.prepare_unwind_frame(&frames[1]).unwrap();
        }
    });
    session
        .install(
            &Breakpoint::builder("main.arb")
                .line_is(9)
                .build()
                .unwrap(),
        )
        .unwrap();

    assert_eq!(host.call("main", vec![]).unwrap(), Value::Int(3));

    assert_eq!(lines(&stops), vec![9, 1, 9]);
    assert_eq!(host.output(), vec!["3".to_string()]);
}

#[test]
fn kill_during_a_step_does_not_mute_the_breakpoint_on_rerun() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |event, index| match index {
        0 => event.prepare_step_into(StepConfig::default()).unwrap(),
        1 => event.prepare_kill().unwrap(),
        _ => {}
    });
    let bp = session.install(&line_bp(3)).unwrap();
    session.suspend_next_execution().unwrap();

    assert!(matches!(
        host.call("main", vec![]),
        Err(RunError::Killed(_))
    ));
    assert_eq!(host.call("main", vec![]).unwrap(), Value::Int(3));

    assert_eq!(lines(&stops), vec![2, 3, 3]);
    assert_eq!(stop(&stops, 1).breakpoints, vec![bp.id()]);
    assert_eq!(stop(&stops, 2).breakpoints, vec![bp.id()]);
    assert_eq!(bp.hit_count(), 2);
}
