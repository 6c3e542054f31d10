use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::filter::SuspensionFilter;
use crate::host::{CallStack, ExecutionPoint};
use crate::value::GuestException;

/// Matches thrown guest exceptions by whether a guest handler will catch them.
///
/// Every exception is judged once, at the first point it is seen returning
/// exceptionally; the reported set holds weak references so it never keeps
/// an exception alive.
#[derive(Debug)]
pub(super) struct ExceptionFilter {
    caught: bool,
    uncaught: bool,
    filter: SuspensionFilter,
    reported: Mutex<Vec<Weak<GuestException>>>,
}

impl ExceptionFilter {
    pub(super) fn new(caught: bool, uncaught: bool, filter: SuspensionFilter) -> Self {
        Self {
            caught,
            uncaught,
            filter,
            reported: Mutex::new(Vec::new()),
        }
    }

    pub(super) fn suspension_filter(&self) -> &SuspensionFilter {
        &self.filter
    }

    pub(super) fn matches(&self, point: ExecutionPoint<'_>, exception: &Arc<GuestException>) -> bool {
        if !self.filter.accepts(point.context) {
            return false;
        }
        if !self.first_sighting(exception) {
            return false;
        }
        let caught = is_caught(point.stack, exception);
        if caught {
            self.caught
        } else {
            self.uncaught
        }
    }

    fn first_sighting(&self, exception: &Arc<GuestException>) -> bool {
        let mut reported = self.reported.lock();
        reported.retain(|weak| weak.strong_count() > 0);
        let weak = Arc::downgrade(exception);
        if reported.iter().any(|seen| Weak::ptr_eq(seen, &weak)) {
            return false;
        }
        reported.push(weak);
        true
    }
}

/// Walk the stack from the top frame down; the exception is caught when any
/// enclosing try block's handler accepts it.
fn is_caught(stack: &dyn CallStack, exception: &GuestException) -> bool {
    stack.frames().iter().any(|frame| {
        frame
            .enclosing_try_blocks()
            .iter()
            .any(|block| block.catches.as_ref().map_or(true, |catches| catches(exception)))
    })
}

impl fmt::Display for ExceptionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.caught, self.uncaught) {
            (true, true) => f.write_str("exceptions(caught, uncaught)"),
            (true, false) => f.write_str("exceptions(caught)"),
            _ => f.write_str("exceptions(uncaught)"),
        }
    }
}
