use std::fmt;
use std::sync::Arc;

use smol_str::SmolStr;

use crate::error::DebugError;
use crate::filter::SuspensionFilter;
use crate::source::{SourceElement, SourceSection, SuspendAnchor};

use super::exception::ExceptionFilter;
use super::{Breakpoint, BreakpointKind, Locator, Settings};

/// Called once when a breakpoint location resolves in a loaded source.
pub type ResolveListener = Arc<dyn Fn(&Breakpoint, &SourceSection) + Send + Sync>;

/// Builder for source-location breakpoints.
pub struct BreakpointBuilder {
    uri: SmolStr,
    line: Option<u32>,
    column: Option<u32>,
    section: Option<SourceSection>,
    settings: Settings,
    elements_set: bool,
}

impl BreakpointBuilder {
    pub(super) fn new(uri: SmolStr) -> Self {
        Self {
            uri,
            line: None,
            column: None,
            section: None,
            settings: Settings::default(),
            elements_set: false,
        }
    }

    /// 1-based line.
    #[must_use]
    pub fn line_is(mut self, line: u32) -> Self {
        self.line = Some(line);
        self
    }

    /// 1-based column.
    #[must_use]
    pub fn column_is(mut self, column: u32) -> Self {
        self.column = Some(column);
        self
    }

    /// Bind to exactly this section instead of resolving a line.
    #[must_use]
    pub fn section_is(mut self, section: SourceSection) -> Self {
        self.section = Some(section);
        self
    }

    #[must_use]
    pub fn suspend_anchor(mut self, anchor: SuspendAnchor) -> Self {
        self.settings.anchor = anchor;
        self
    }

    /// Skip this many hits before the breakpoint suspends.
    #[must_use]
    pub fn ignore_count(mut self, ignore_count: u32) -> Self {
        self.settings.ignore_count = ignore_count;
        self
    }

    #[must_use]
    pub fn one_shot(mut self) -> Self {
        self.settings.one_shot = true;
        self
    }

    #[must_use]
    pub fn condition(mut self, condition: &str) -> Self {
        self.settings.condition = Some(condition.into());
        self
    }

    #[must_use]
    pub fn source_elements(mut self, elements: &[SourceElement]) -> Self {
        self.settings.elements = elements.to_vec();
        self.elements_set = true;
        self
    }

    #[must_use]
    pub fn resolve_listener(
        mut self,
        listener: impl Fn(&Breakpoint, &SourceSection) + Send + Sync + 'static,
    ) -> Self {
        self.settings.resolve_listener = Some(Arc::new(listener));
        self
    }

    pub fn build(mut self) -> Result<Breakpoint, DebugError> {
        if self.settings.elements.is_empty() {
            return Err(DebugError::invalid_argument("no source elements"));
        }
        if !self.elements_set && self.settings.anchor == SuspendAnchor::After {
            self.settings.elements = vec![SourceElement::Expression];
        }
        let anchor = self.settings.anchor;
        if !self
            .settings
            .elements
            .iter()
            .any(|element| element.suspend_anchors().contains(&anchor))
        {
            return Err(DebugError::invalid_argument(format!(
                "anchor {anchor:?} is not supported by {:?}",
                self.settings.elements
            )));
        }
        if let Some(column) = self.column {
            if column == 0 {
                return Err(DebugError::invalid_argument("column must be >= 1"));
            }
        }
        let locator = match (self.section, self.line) {
            (Some(section), _) => {
                if section.uri != self.uri {
                    return Err(DebugError::invalid_argument(
                        "section belongs to a different source",
                    ));
                }
                Locator::Section(section)
            }
            (None, Some(0)) => return Err(DebugError::invalid_argument("line must be >= 1")),
            (None, Some(line)) => Locator::Line {
                uri: self.uri,
                line,
                column: self.column,
            },
            (None, None) => {
                return Err(DebugError::invalid_argument("line or section is required"));
            }
        };
        Ok(Breakpoint::create(
            BreakpointKind::SourceLocation,
            locator,
            self.settings,
        ))
    }
}

impl fmt::Debug for BreakpointBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakpointBuilder")
            .field("uri", &self.uri)
            .field("line", &self.line)
            .field("column", &self.column)
            .field("section", &self.section)
            .finish_non_exhaustive()
    }
}

/// Builder for exception breakpoints.
#[derive(Debug)]
pub struct ExceptionBreakpointBuilder {
    caught: bool,
    uncaught: bool,
    filter: SuspensionFilter,
    settings: Settings,
}

impl ExceptionBreakpointBuilder {
    pub(super) fn new(caught: bool, uncaught: bool) -> Self {
        Self {
            caught,
            uncaught,
            filter: SuspensionFilter::default(),
            settings: Settings {
                anchor: SuspendAnchor::After,
                ..Settings::default()
            },
        }
    }

    /// Restrict where thrown exceptions are reported.
    #[must_use]
    pub fn suspension_filter(mut self, filter: SuspensionFilter) -> Self {
        self.filter = filter;
        self
    }

    #[must_use]
    pub fn condition(mut self, condition: &str) -> Self {
        self.settings.condition = Some(condition.into());
        self
    }

    #[must_use]
    pub fn one_shot(mut self) -> Self {
        self.settings.one_shot = true;
        self
    }

    pub fn build(self) -> Result<Breakpoint, DebugError> {
        if !self.caught && !self.uncaught {
            return Err(DebugError::invalid_argument(
                "at least one of caught or uncaught must be set",
            ));
        }
        Ok(Breakpoint::create(
            BreakpointKind::Exception,
            Locator::Exception(ExceptionFilter::new(self.caught, self.uncaught, self.filter)),
            self.settings,
        ))
    }
}

impl fmt::Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("anchor", &self.anchor)
            .field("elements", &self.elements)
            .field("one_shot", &self.one_shot)
            .field("ignore_count", &self.ignore_count)
            .field("condition", &self.condition)
            .finish_non_exhaustive()
    }
}
