//! Flags read on hot paths.

use std::sync::atomic::{AtomicBool, Ordering};

/// Boolean read on every instrumented point and rarely written.
#[derive(Debug)]
pub(crate) struct StableBoolean {
    value: AtomicBool,
}

impl StableBoolean {
    pub(crate) const fn new(initial: bool) -> Self {
        Self {
            value: AtomicBool::new(initial),
        }
    }

    #[inline]
    pub(crate) fn get(&self) -> bool {
        self.value.load(Ordering::Acquire)
    }

    /// Returns whether the value changed.
    pub(crate) fn set(&self, value: bool) -> bool {
        self.value.swap(value, Ordering::AcqRel) != value
    }
}
