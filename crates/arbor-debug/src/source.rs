//! Source sections, element tags and location resolution.

use std::fmt;

use bitflags::bitflags;
use serde::Deserialize;
use smol_str::SmolStr;

bitflags! {
    /// Tags a guest language attaches to instrumentable syntax-tree nodes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Tags: u8 {
        /// A statement.
        const STATEMENT = 1 << 0;
        /// An expression.
        const EXPRESSION = 1 << 1;
        /// A call site.
        const CALL = 1 << 2;
        /// The root of a guest function.
        const ROOT = 1 << 3;
        /// A lexical try block.
        const TRY_BLOCK = 1 << 4;
        /// A guest `debugger` statement.
        const ALWAYS_HALT = 1 << 5;
    }
}

/// Source elements a session or step can be configured with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceElement {
    Statement,
    Expression,
    Root,
}

impl SourceElement {
    pub const ALL: [SourceElement; 3] = [
        SourceElement::Statement,
        SourceElement::Expression,
        SourceElement::Root,
    ];

    #[must_use]
    pub fn tag(self) -> Tags {
        match self {
            SourceElement::Statement => Tags::STATEMENT,
            SourceElement::Expression => Tags::EXPRESSION,
            SourceElement::Root => Tags::ROOT,
        }
    }

    /// Anchors at which the element is a valid stop.
    #[must_use]
    pub fn suspend_anchors(self) -> &'static [SuspendAnchor] {
        match self {
            SourceElement::Statement => &[SuspendAnchor::Before],
            SourceElement::Expression | SourceElement::Root => {
                &[SuspendAnchor::Before, SuspendAnchor::After]
            }
        }
    }

    pub(crate) fn tags_of(elements: &[SourceElement]) -> Tags {
        elements
            .iter()
            .fold(Tags::empty(), |tags, element| tags | element.tag())
    }
}

/// Whether a stop happens before or after the tagged construct executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendAnchor {
    Before,
    After,
}

/// A region of guest source code.
///
/// Lines and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceSection {
    pub uri: SmolStr,
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

impl SourceSection {
    #[must_use]
    pub fn new(
        uri: impl Into<SmolStr>,
        start_line: u32,
        start_column: u32,
        end_line: u32,
        end_column: u32,
    ) -> Self {
        Self {
            uri: uri.into(),
            start_line,
            start_column,
            end_line,
            end_column,
        }
    }

    /// Section spanning a whole single line.
    #[must_use]
    pub fn line(uri: impl Into<SmolStr>, line: u32) -> Self {
        Self::new(uri, line, 1, line, u32::MAX)
    }

    fn start(&self) -> (u32, u32) {
        (self.start_line, self.start_column)
    }

    fn end(&self) -> (u32, u32) {
        (self.end_line, self.end_column)
    }

    #[must_use]
    pub fn contains(&self, line: u32, column: u32) -> bool {
        self.start() <= (line, column) && (line, column) <= self.end()
    }

    fn span(&self) -> (u32, u32) {
        (
            self.end_line.saturating_sub(self.start_line),
            if self.end_line == self.start_line {
                self.end_column.saturating_sub(self.start_column)
            } else {
                self.end_column
            },
        )
    }
}

impl fmt::Display for SourceSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uri, self.start_line)?;
        if self.start_column > 1 {
            write!(f, ":{}", self.start_column)?;
        }
        Ok(())
    }
}

/// Instrumentable sections of a source that the host has loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedSource {
    pub uri: SmolStr,
    pub sections: Vec<(SourceSection, Tags)>,
}

impl LoadedSource {
    #[must_use]
    pub fn new(uri: impl Into<SmolStr>) -> Self {
        Self {
            uri: uri.into(),
            sections: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_section(mut self, section: SourceSection, tags: Tags) -> Self {
        self.sections.push((section, tags));
        self
    }
}

/// Resolve a line/column request to the nearest instrumentable section.
///
/// Sections starting on the requested line win (the closest one at or before
/// the column, else the first one after it). Otherwise the innermost section
/// containing the position is used, and finally the next section after it.
#[must_use]
pub fn resolve_location(
    source: &LoadedSource,
    tags: Tags,
    line: u32,
    column: Option<u32>,
) -> Option<SourceSection> {
    let column = column.unwrap_or(1);
    let candidates = || {
        source
            .sections
            .iter()
            .filter(move |(_, section_tags)| section_tags.intersects(tags))
            .map(|(section, _)| section)
    };

    let mut best_on_line_before: Option<&SourceSection> = None;
    let mut best_on_line_after: Option<&SourceSection> = None;
    for section in candidates().filter(|section| section.start_line == line) {
        if section.start_column <= column {
            match best_on_line_before {
                Some(best) if section.start_column <= best.start_column => {}
                _ => best_on_line_before = Some(section),
            }
        } else {
            match best_on_line_after {
                Some(best) if section.start_column >= best.start_column => {}
                _ => best_on_line_after = Some(section),
            }
        }
    }
    if let Some(section) = best_on_line_before.or(best_on_line_after) {
        return Some(section.clone());
    }

    let mut best_containing: Option<&SourceSection> = None;
    for section in candidates().filter(|section| section.contains(line, column)) {
        if best_containing
            .map(|current| section.span() < current.span())
            .unwrap_or(true)
        {
            best_containing = Some(section);
        }
    }
    if let Some(section) = best_containing {
        return Some(section.clone());
    }

    candidates()
        .filter(|section| section.start() >= (line, column))
        .min_by_key(|section| section.start())
        .cloned()
}
