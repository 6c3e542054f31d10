#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use arbor_debug::harness::TestHost;
use arbor_debug::{DebuggerSession, SourceElement, SuspendAnchor, SuspendedEvent, Value};

/// Calls `add` from `main` with statements on lines 2..5 and 8..9.
pub const CALLS: &str = "\
fn main() {
    x = 1
    y = add(x, 2)
    print y
    return y
}
fn add(a, b) {
    c = a + b
    return c
}
";

/// Counts `x` up by ten while it is below twenty.
pub const LOOP: &str = "\
fn main() {
    x = 5
    while x < 20 {
        y = x
        x = x + 10
    }
    return x
}
";

/// Snapshot of a suspension taken inside the callback.
#[derive(Debug, Clone, PartialEq)]
pub struct Stop {
    pub line: u32,
    pub column: u32,
    pub anchor: SuspendAnchor,
    pub breakpoints: Vec<u64>,
    pub thread: ThreadId,
    pub return_value: Option<Value>,
}

impl Stop {
    pub fn capture(event: &SuspendedEvent) -> Self {
        let section = event
            .source_section()
            .expect("accessible in callback")
            .expect("suspended at a section");
        Self {
            line: section.start_line,
            column: section.start_column,
            anchor: event.suspend_anchor(),
            breakpoints: event.breakpoints().iter().map(|bp| bp.id()).collect(),
            thread: event.thread(),
            return_value: event.return_value().expect("accessible in callback"),
        }
    }
}

pub type Stops = Arc<Mutex<Vec<Stop>>>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

pub fn host(text: &str) -> TestHost {
    init_tracing();
    TestHost::from_source("main.arb", text).expect("test source parses")
}

/// Start a session recording every suspension, then running `action` with
/// the zero-based index of the stop.
pub fn recording_session(
    host: &TestHost,
    action: impl Fn(&SuspendedEvent, usize) + Send + Sync + 'static,
) -> (DebuggerSession, Stops) {
    recording_session_with_elements(host, &[], action)
}

/// Like [`recording_session`], stepping over `elements` unless empty.
pub fn recording_session_with_elements(
    host: &TestHost,
    elements: &[SourceElement],
    action: impl Fn(&SuspendedEvent, usize) + Send + Sync + 'static,
) -> (DebuggerSession, Stops) {
    let stops: Stops = Arc::new(Mutex::new(Vec::new()));
    let recorded = stops.clone();
    let callback = move |event: &SuspendedEvent| {
        let index = {
            let mut stops = recorded.lock().unwrap();
            stops.push(Stop::capture(event));
            stops.len() - 1
        };
        action(event, index);
    };
    let session = if elements.is_empty() {
        host.debugger().start_session(callback)
    } else {
        host.debugger()
            .start_session_with_elements(callback, elements)
            .expect("valid source elements")
    };
    (session, stops)
}

pub fn lines(stops: &Stops) -> Vec<u32> {
    stops.lock().unwrap().iter().map(|stop| stop.line).collect()
}

pub fn stop(stops: &Stops, index: usize) -> Stop {
    stops.lock().unwrap()[index].clone()
}
