mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arbor_debug::harness::TestHost;
use arbor_debug::{
    Breakpoint, BreakpointEvent, BreakpointKind, DebugError, StepConfig, SuspendAnchor, Value,
};
use common::{host, lines, recording_session, stop, CALLS, LOOP};
use expect_test::expect;

#[test]
fn line_breakpoint_suspends_before_statement() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |_, _| {});
    let bp = session
        .install(&Breakpoint::builder("main.arb").line_is(3).build().unwrap())
        .unwrap();

    assert_eq!(host.call("main", vec![]).unwrap(), Value::Int(3));

    assert_eq!(lines(&stops), vec![3]);
    let first = stop(&stops, 0);
    assert_eq!(first.column, 5);
    assert_eq!(first.anchor, SuspendAnchor::Before);
    assert_eq!(first.breakpoints, vec![bp.id()]);
    assert_eq!(first.return_value, None);
    assert_eq!(bp.hit_count(), 1);
    assert!(bp.is_resolved());
    assert_eq!(bp.resolved_section().unwrap().start_line, 3);
}

#[test]
fn ignore_count_skips_leading_hits() {
    let host = host(LOOP);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let captured = seen.clone();
    let (session, stops) = recording_session(&host, move |event, _| {
        let x = event.top_stack_frame().unwrap().local("x").unwrap();
        captured.lock().unwrap().push(x);
    });
    let bp = session
        .install(
            &Breakpoint::builder("main.arb")
                .line_is(4)
                .ignore_count(1)
                .build()
                .unwrap(),
        )
        .unwrap();

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![4]);
    assert_eq!(*seen.lock().unwrap(), vec![Some(Value::Int(15))]);
    assert_eq!(bp.hit_count(), 2);
}

#[test]
fn condition_limits_hits_to_matching_iterations() {
    let host = host(LOOP);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let captured = seen.clone();
    let (session, stops) = recording_session(&host, move |event, _| {
        let frame = event.top_stack_frame().unwrap();
        captured.lock().unwrap().push(frame.eval("x").unwrap());
    });
    let bp = session
        .install(
            &Breakpoint::builder("main.arb")
                .line_is(4)
                .condition("x > 10")
                .build()
                .unwrap(),
        )
        .unwrap();

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![4]);
    assert_eq!(*seen.lock().unwrap(), vec![Value::Int(15)]);
    assert_eq!(bp.hit_count(), 1);
    assert_eq!(bp.condition().as_deref(), Some("x > 10"));
}

#[test]
fn changed_condition_governs_later_runs() {
    let host = host(LOOP);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let captured = seen.clone();
    let (session, stops) = recording_session(&host, move |event, _| {
        let x = event.top_stack_frame().unwrap().local("x").unwrap();
        captured.lock().unwrap().push(x);
    });
    let bp = session
        .install(
            &Breakpoint::builder("main.arb")
                .line_is(4)
                .condition("x > 10")
                .build()
                .unwrap(),
        )
        .unwrap();

    host.call("main", vec![]).unwrap();
    bp.set_condition(Some("x < 10")).unwrap();
    host.call("main", vec![]).unwrap();
    bp.set_condition(None).unwrap();
    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![4, 4, 4, 4]);
    assert_eq!(
        *seen.lock().unwrap(),
        [15, 5, 5, 15].map(|x| Some(Value::Int(x)))
    );
    assert_eq!(bp.condition(), None);
    assert_eq!(bp.hit_count(), 4);
}

#[test]
fn ignore_count_changed_between_runs() {
    let host = host(LOOP);
    let (session, stops) = recording_session(&host, |_, _| {});
    let bp = session
        .install(&Breakpoint::builder("main.arb").line_is(4).build().unwrap())
        .unwrap();

    host.call("main", vec![]).unwrap();
    assert_eq!(bp.hit_count(), 2);
    bp.set_ignore_count(3).unwrap();
    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![4, 4, 4]);
    assert_eq!(bp.hit_count(), 4);
    assert_eq!(bp.ignore_count(), 3);
}

#[test]
fn false_conditions_do_not_use_up_the_ignore_count() {
    let host = host(LOOP);
    let (session, stops) = recording_session(&host, |_, _| {});
    let bp = session
        .install(
            &Breakpoint::builder("main.arb")
                .line_is(4)
                .condition("x > 10")
                .ignore_count(1)
                .build()
                .unwrap(),
        )
        .unwrap();

    host.call("main", vec![]).unwrap();
    assert!(lines(&stops).is_empty());
    assert_eq!(bp.hit_count(), 1);

    host.call("main", vec![]).unwrap();
    assert_eq!(lines(&stops), vec![4]);
    assert_eq!(bp.hit_count(), 2);
}

#[test]
fn failing_condition_suspends_and_reports_the_error() {
    let host = host(LOOP);
    let failures = Arc::new(Mutex::new(Vec::new()));
    let captured = failures.clone();
    let holder: Arc<Mutex<Option<Breakpoint>>> = Arc::new(Mutex::new(None));
    let bp_slot = holder.clone();
    let (session, stops) = recording_session(&host, move |event, _| {
        let bp = bp_slot.lock().unwrap().clone().unwrap();
        let failure = event.breakpoint_condition_exception(&bp).unwrap();
        captured
            .lock()
            .unwrap()
            .push(failure.map(|err| err.message().to_string()));
    });
    let bp = session
        .install(
            &Breakpoint::builder("main.arb")
                .line_is(4)
                .condition("missing > 1")
                .build()
                .unwrap(),
        )
        .unwrap();
    *holder.lock().unwrap() = Some(bp.clone());

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![4, 4]);
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 2);
    for failure in failures.iter() {
        assert!(
            failure.as_deref().unwrap().contains("undefined variable 'missing'"),
            "{failure:?}"
        );
    }
}

#[test]
fn non_boolean_condition_is_reported_as_failure() {
    let host = host(LOOP);
    let reported = Arc::new(AtomicUsize::new(0));
    let counter = reported.clone();
    let (session, stops) = recording_session(&host, move |event, _| {
        let bp = event.breakpoints()[0].clone();
        if event.breakpoint_condition_exception(&bp).unwrap().is_some() {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });
    session
        .install(
            &Breakpoint::builder("main.arb")
                .line_is(4)
                .condition("x + 1")
                .build()
                .unwrap(),
        )
        .unwrap();

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![4, 4]);
    assert_eq!(reported.load(Ordering::SeqCst), 2);
}

#[test]
fn one_shot_breakpoint_disables_itself() {
    let host = host(LOOP);
    let (session, stops) = recording_session(&host, |_, _| {});
    let bp = session
        .install(
            &Breakpoint::builder("main.arb")
                .line_is(4)
                .one_shot()
                .build()
                .unwrap(),
        )
        .unwrap();

    host.call("main", vec![]).unwrap();
    assert_eq!(lines(&stops), vec![4]);
    assert!(!bp.is_enabled());
    assert_eq!(bp.hit_count(), 1);

    bp.set_enabled(true).unwrap();
    host.call("main", vec![]).unwrap();
    assert_eq!(lines(&stops), vec![4, 4]);
    assert_eq!(bp.hit_count(), 2);
}

#[test]
fn disabled_breakpoint_does_not_suspend() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |_, _| {});
    let bp = session
        .install(&Breakpoint::builder("main.arb").line_is(3).build().unwrap())
        .unwrap();
    bp.set_enabled(false).unwrap();

    host.call("main", vec![]).unwrap();

    assert!(lines(&stops).is_empty());
    assert_eq!(bp.hit_count(), 0);
}

#[test]
fn disposed_breakpoint_stays_inert() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |_, _| {});
    let bp = session
        .install(&Breakpoint::builder("main.arb").line_is(3).build().unwrap())
        .unwrap();
    let bindings = host.instrumenter().execution_binding_count();

    bp.dispose().unwrap();

    assert!(bp.is_disposed());
    assert!(!bp.is_enabled());
    assert_eq!(bp.set_enabled(true), Err(DebugError::BreakpointDisposed));
    assert_eq!(session.install(&bp).unwrap_err(), DebugError::BreakpointDisposed);
    assert!(session.breakpoints().iter().all(|listed| *listed != bp));
    assert_eq!(host.instrumenter().execution_binding_count(), bindings - 1);
    bp.dispose().unwrap();

    host.call("main", vec![]).unwrap();
    assert!(lines(&stops).is_empty());
}

#[test]
fn breakpoints_at_one_location_share_a_suspension() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |_, _| {});
    let first = session
        .install(&Breakpoint::builder("main.arb").line_is(3).build().unwrap())
        .unwrap();
    let second = session
        .install(
            &Breakpoint::builder("main.arb")
                .line_is(3)
                .column_is(5)
                .build()
                .unwrap(),
        )
        .unwrap();

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&stops), vec![3]);
    assert_eq!(stop(&stops, 0).breakpoints, vec![first.id(), second.id()]);
    assert_eq!(first.hit_count(), 1);
    assert_eq!(second.hit_count(), 1);
}

#[test]
fn installing_twice_in_a_session_keeps_one_entry() {
    let host = host(CALLS);
    let (session, _stops) = recording_session(&host, |_, _| {});
    let bp = Breakpoint::builder("main.arb").line_is(3).build().unwrap();
    session.install(&bp).unwrap();
    session.install(&bp).unwrap();

    let local: Vec<_> = session
        .breakpoints()
        .into_iter()
        .filter(|listed| !listed.is_read_only())
        .collect();
    assert_eq!(local, vec![bp]);
}

#[test]
fn unloaded_source_resolves_once_when_loaded() {
    common::init_tracing();
    let host = TestHost::new();
    let (session, stops) = recording_session(&host, |_, _| {});
    let resolved = Arc::new(Mutex::new(Vec::new()));
    let sink = resolved.clone();
    let bp = session
        .install(
            &Breakpoint::builder("later.arb")
                .line_is(8)
                .resolve_listener(move |_, section| {
                    sink.lock().unwrap().push(section.clone());
                })
                .build()
                .unwrap(),
        )
        .unwrap();
    assert!(!bp.is_resolved());

    host.load("later.arb", CALLS).unwrap();
    host.load("other.arb", LOOP).unwrap();

    assert!(bp.is_resolved());
    let resolved = resolved.lock().unwrap();
    assert_eq!(resolved.len(), 1);
    assert_eq!((resolved[0].start_line, resolved[0].start_column), (8, 5));

    host.call("main", vec![]).unwrap();
    assert_eq!(lines(&stops), vec![8]);
}

#[test]
fn line_between_statements_resolves_to_next_statement() {
    let host = host("fn main() {\n    x = 1\n\n    y = 2\n    return y\n}\n");
    let (session, stops) = recording_session(&host, |_, _| {});
    let bp = session
        .install(&Breakpoint::builder("main.arb").line_is(3).build().unwrap())
        .unwrap();

    host.call("main", vec![]).unwrap();

    assert_eq!(bp.resolved_section().unwrap().start_line, 4);
    assert_eq!(lines(&stops), vec![4]);
}

#[test]
fn shared_breakpoint_counts_one_hit_per_visit() {
    let host = host(CALLS);
    let (stepping, stepping_stops) = recording_session(&host, |event, index| {
        if index == 0 {
            event.prepare_step_into(StepConfig::default()).unwrap();
        }
    });
    let (watching, watching_stops) = recording_session(&host, |_, _| {});
    let bp = Breakpoint::builder("main.arb")
        .line_is(3)
        .ignore_count(1)
        .build()
        .unwrap();
    stepping.install(&bp).unwrap();
    watching.install(&bp).unwrap();
    stepping.suspend_next_execution().unwrap();

    host.call("main", vec![]).unwrap();
    assert_eq!(lines(&stepping_stops), vec![2, 3]);
    assert!(stop(&stepping_stops, 1).breakpoints.is_empty());
    assert!(lines(&watching_stops).is_empty());
    assert_eq!(bp.hit_count(), 1);

    host.call("main", vec![]).unwrap();
    assert_eq!(lines(&stepping_stops), vec![2, 3, 3]);
    assert_eq!(lines(&watching_stops), vec![3]);
    assert_eq!(bp.hit_count(), 2);
}

#[test]
fn global_breakpoint_shows_read_only_views() {
    let host = host(CALLS);
    let (first, first_stops) = recording_session(&host, |_, _| {});
    let global = host
        .debugger()
        .install(&Breakpoint::builder("main.arb").line_is(8).build().unwrap())
        .unwrap();
    let (second, second_stops) = recording_session(&host, |event, _| {
        let view = &event.breakpoints()[0];
        assert!(view.is_read_only());
        assert_eq!(view.set_enabled(false), Err(DebugError::ReadOnlyBreakpoint));
    });

    for session in [&first, &second] {
        let views: Vec<_> = session
            .breakpoints()
            .into_iter()
            .filter(|bp| bp.id() == global.id())
            .collect();
        assert_eq!(views.len(), 1);
        assert!(views[0].is_read_only());
        assert!(views[0].is_global());
        assert_eq!(views[0].dispose(), Err(DebugError::ReadOnlyBreakpoint));
        assert_eq!(session.install(&views[0]).unwrap_err(), DebugError::ReadOnlyBreakpoint);
    }

    host.call("main", vec![]).unwrap();

    assert_eq!(lines(&first_stops), vec![8]);
    assert_eq!(lines(&second_stops), vec![8]);
    assert_eq!(global.hit_count(), 1);
    assert_eq!(host.debugger().breakpoints(), vec![global.clone()]);
    assert_eq!(
        host.debugger().install(&global).unwrap_err(),
        DebugError::AlreadyInstalled
    );
}

#[test]
fn session_breakpoint_cannot_become_global() {
    let host = host(CALLS);
    let (session, _stops) = recording_session(&host, |_, _| {});
    let bp = session
        .install(&Breakpoint::builder("main.arb").line_is(3).build().unwrap())
        .unwrap();

    assert_eq!(
        host.debugger().install(&bp).unwrap_err(),
        DebugError::AlreadyInstalled
    );
}

#[test]
fn breakpoint_from_another_debugger_is_rejected() {
    let host = host(CALLS);
    let other = common::host(CALLS);
    let (session, _stops) = recording_session(&host, |_, _| {});
    let (foreign, _foreign_stops) = recording_session(&other, |_, _| {});
    let bp = foreign
        .install(&Breakpoint::builder("main.arb").line_is(3).build().unwrap())
        .unwrap();

    assert_eq!(session.install(&bp).unwrap_err(), DebugError::AlreadyInstalled);
}

#[test]
fn debugger_reports_global_breakpoint_changes() {
    let host = host(CALLS);
    let (sender, receiver) = std::sync::mpsc::channel();
    host.debugger().set_breakpoint_sender(Some(sender));

    let bp = host
        .debugger()
        .install(&Breakpoint::builder("main.arb").line_is(3).build().unwrap())
        .unwrap();
    bp.dispose().unwrap();

    let timeout = std::time::Duration::from_secs(1);
    match receiver.recv_timeout(timeout).unwrap() {
        BreakpointEvent::Added(added) => assert_eq!(added, bp),
        other => panic!("unexpected event {other:?}"),
    }
    match receiver.recv_timeout(timeout).unwrap() {
        BreakpointEvent::Removed(removed) => assert_eq!(removed, bp),
        other => panic!("unexpected event {other:?}"),
    }
    assert!(host.debugger().breakpoints().is_empty());
}

#[test]
fn halt_instruction_suspends_every_session() {
    let host = host("fn main() {\n    x = 1\n    debugger\n    return x\n}\n");
    let (first, first_stops) = recording_session(&host, |_, _| {});
    let (_second, second_stops) = recording_session(&host, |_, _| {});
    let halt = host.debugger().always_halt_breakpoint();
    assert_eq!(halt.kind(), BreakpointKind::HaltInstruction);

    host.call("main", vec![]).unwrap();
    assert_eq!(lines(&first_stops), vec![3]);
    assert_eq!(lines(&second_stops), vec![3]);
    assert_eq!(stop(&first_stops, 0).breakpoints, vec![halt.id()]);

    first.set_breakpoints_active(BreakpointKind::HaltInstruction, false);
    host.call("main", vec![]).unwrap();
    assert_eq!(lines(&first_stops), vec![3]);
    assert_eq!(lines(&second_stops), vec![3, 3]);
}

#[test]
fn inactive_kind_suppresses_location_breakpoints() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |_, _| {});
    session
        .install(&Breakpoint::builder("main.arb").line_is(3).build().unwrap())
        .unwrap();

    session.set_breakpoints_active(BreakpointKind::SourceLocation, false);
    assert!(!session.is_breakpoints_active(BreakpointKind::SourceLocation));
    host.call("main", vec![]).unwrap();
    assert!(lines(&stops).is_empty());

    session.set_all_breakpoints_active(true);
    host.call("main", vec![]).unwrap();
    assert_eq!(lines(&stops), vec![3]);
}

#[test]
fn after_anchor_exposes_and_replaces_return_value() {
    let host = host(CALLS);
    let (session, stops) = recording_session(&host, |event, _| {
        assert_eq!(event.return_value().unwrap(), Some(Value::Int(3)));
        event.set_return_value(Value::Int(42)).unwrap();
    });
    session
        .install(
            &Breakpoint::builder("main.arb")
                .line_is(9)
                .suspend_anchor(SuspendAnchor::After)
                .build()
                .unwrap(),
        )
        .unwrap();

    assert_eq!(host.call("main", vec![]).unwrap(), Value::Int(42));

    let first = stop(&stops, 0);
    assert_eq!((first.line, first.column), (9, 12));
    assert_eq!(first.anchor, SuspendAnchor::After);
    assert_eq!(host.output(), vec!["42".to_string()]);
}

#[test]
fn builder_rejects_invalid_settings() {
    assert!(matches!(
        Breakpoint::builder("main.arb").line_is(0).build(),
        Err(DebugError::InvalidArgument(_))
    ));
    assert!(matches!(
        Breakpoint::builder("main.arb")
            .line_is(2)
            .source_elements(&[])
            .build(),
        Err(DebugError::InvalidArgument(_))
    ));
}

#[test]
fn breakpoint_display() {
    let bp = Breakpoint::builder("main.arb")
        .line_is(4)
        .ignore_count(2)
        .condition("x > 10")
        .build()
        .unwrap();
    let text = bp.to_string().replace(&format!("#{}", bp.id()), "#N");
    expect![[r#"Breakpoint#N main.arb:4 (enabled, hits=0, ignore=2, condition="x > 10")"#]]
        .assert_eq(&text);
}
