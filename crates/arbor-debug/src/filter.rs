//! Filters restricting where a session may suspend.

use std::fmt;
use std::sync::Arc;

use crate::host::EventContext;
use crate::source::SourceSection;

type SourcePredicate = Arc<dyn Fn(&SourceSection) -> bool + Send + Sync>;

/// Restricts stepping (and exception breakpoints that opt in) to a subset of
/// the program.
#[derive(Clone, Default)]
pub struct SuspensionFilter {
    include_internal: bool,
    ignore_language_context_initialization: bool,
    source: Option<SourcePredicate>,
}

impl SuspensionFilter {
    #[must_use]
    pub fn builder() -> SuspensionFilterBuilder {
        SuspensionFilterBuilder::default()
    }

    #[must_use]
    pub fn is_internal_included(&self) -> bool {
        self.include_internal
    }

    #[must_use]
    pub fn is_ignore_language_context_initialization(&self) -> bool {
        self.ignore_language_context_initialization
    }

    /// Whether a suspension at `context` passes the filter.
    #[must_use]
    pub fn accepts(&self, context: &dyn EventContext) -> bool {
        if context.is_internal() && !self.include_internal {
            return false;
        }
        if self.ignore_language_context_initialization && !context.is_language_context_initialized()
        {
            return false;
        }
        match (&self.source, context.source_section()) {
            (Some(predicate), Some(section)) => predicate(section),
            _ => true,
        }
    }
}

impl fmt::Debug for SuspensionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuspensionFilter")
            .field("include_internal", &self.include_internal)
            .field(
                "ignore_language_context_initialization",
                &self.ignore_language_context_initialization,
            )
            .field("source", &self.source.is_some())
            .finish()
    }
}

#[derive(Default)]
pub struct SuspensionFilterBuilder {
    filter: SuspensionFilter,
}

impl SuspensionFilterBuilder {
    #[must_use]
    pub fn include_internal(mut self, include: bool) -> Self {
        self.filter.include_internal = include;
        self
    }

    /// Skip points reached while the guest language is still initializing.
    #[must_use]
    pub fn ignore_language_context_initialization(mut self, ignore: bool) -> Self {
        self.filter.ignore_language_context_initialization = ignore;
        self
    }

    #[must_use]
    pub fn source_is(
        mut self,
        predicate: impl Fn(&SourceSection) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter.source = Some(Arc::new(predicate));
        self
    }

    #[must_use]
    pub fn build(self) -> SuspensionFilter {
        self.filter
    }
}
